use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};

use super::required;
use crate::error::AppError;
use crate::session::{ConnectionState, StartOutcome, SupervisorState};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    pub session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    pub session_id: String,
    pub message: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: &'static str,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_state: Option<ConnectionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SupervisorState,
    pub connection_state: ConnectionState,
    pub reconnect_attempts: u32,
}

#[derive(Serialize)]
pub struct SessionList {
    pub status: &'static str,
    pub sessions: Vec<SessionSummary>,
    /// Ids with credentials on disk, loaded or not.
    pub stored: Vec<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /sessions: create (or reuse) a session and wait for its first QR or
/// readiness signal.
pub async fn create_session(
    State(state): State<SharedState>,
    payload: Result<Json<CreateSession>, JsonRejection>,
) -> Result<Json<StartResponse>, AppError> {
    let Json(body) = payload.map_err(|e| AppError::validation(e.body_text()))?;
    let session_id = required(body.session_id, "sessionId")?;

    let response = match state.registry.start(&session_id).await? {
        StartOutcome::Ready => StartResponse {
            status: "ok",
            qr: None,
            session_id,
            message: "session ready",
        },
        StartOutcome::Qr(qr) => StartResponse {
            status: "qr",
            qr: Some(qr),
            session_id,
            message: "scan the QR code to pair",
        },
    };
    Ok(Json(response))
}

/// GET /sessions/{session_id}: status lookup, restoring from stored
/// credentials when the session is not in memory.
pub async fn get_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let Some(supervisor) = state.registry.observe(&session_id).await? else {
        return Ok(Json(StatusResponse {
            status: "nd",
            session_id,
            is_ready: None,
            connection_state: None,
            phone_number: None,
            message: "session not found".into(),
        }));
    };

    let is_ready = supervisor.is_ready();
    let snapshot = supervisor.snapshot();
    let connection_state = snapshot.connection_state();
    Ok(Json(StatusResponse {
        status: "ok",
        session_id,
        is_ready: Some(is_ready),
        connection_state: Some(connection_state),
        phone_number: snapshot.phone_number(),
        message: format!("session is {connection_state}"),
    }))
}

/// DELETE /sessions/{session_id}: soft-disconnect and erase credentials.
pub async fn delete_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.registry.delete(&session_id, true).await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "sessionId": session_id,
        "message": if removed { "session deleted" } else { "nothing to delete" },
    })))
}

/// GET /sessions
pub async fn list_sessions(
    State(state): State<SharedState>,
) -> Result<Json<SessionList>, AppError> {
    let sessions = state
        .registry
        .list()
        .into_iter()
        .filter_map(|id| state.registry.peek(&id))
        .map(|supervisor| {
            let snapshot = supervisor.snapshot();
            SessionSummary {
                connection_state: snapshot.connection_state(),
                session_id: snapshot.session_id,
                state: snapshot.state,
                reconnect_attempts: snapshot.reconnect_attempts,
            }
        })
        .collect();
    let stored = state.registry.stored_ids().await?;

    Ok(Json(SessionList {
        status: "ok",
        sessions,
        stored,
    }))
}
