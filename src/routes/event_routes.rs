use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};

use crate::error::AppError;
use crate::events::SessionSubscription;
use crate::session::validate_session_id;
use crate::state::SharedState;

/// GET /sessions/{session_id}/events: WebSocket stream of the lifecycle
/// notifications of one session.
pub async fn session_events(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    validate_session_id(&session_id)?;
    // Subscribe before the upgrade completes so nothing published in between is lost.
    let subscription = state.events.subscribe_session(&session_id);
    Ok(ws.on_upgrade(move |socket| forward_events(socket, subscription, session_id)))
}

async fn forward_events(
    mut socket: WebSocket,
    mut subscription: SessionSubscription,
    session_id: String,
) {
    tracing::debug!(session_id, "Event subscriber connected");
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(session_id, "Failed to encode event: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Observers have nothing to say; pings are answered by axum.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    tracing::debug!(session_id, "Event subscriber disconnected");
}
