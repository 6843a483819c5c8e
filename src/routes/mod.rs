pub mod event_routes;
pub mod message_routes;
pub mod session_routes;

use crate::error::AppError;
use crate::state::SharedState;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{Method, header},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Headroom for multipart boundaries and the text fields around the file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn app(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    let body_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health))
        // Sessions
        .route(
            "/sessions",
            get(session_routes::list_sessions).post(session_routes::create_session),
        )
        .route(
            "/sessions/{session_id}",
            get(session_routes::get_session).delete(session_routes::delete_session),
        )
        .route(
            "/sessions/{session_id}/events",
            get(event_routes::session_events),
        )
        // Messages
        .route("/messages/send-text", post(message_routes::send_text))
        .route(
            "/messages/send-pdf",
            post(message_routes::send_pdf).layer(DefaultBodyLimit::max(body_limit)),
        )
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.len(),
        "subscribers": state.events.subscriber_count(),
    }))
}

/// Trimmed value of a required request field.
pub(crate) fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::validation(format!("{field} is required")))
}
