use crate::session::SessionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Session(SessionError::Validation(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Session(e) => match e {
                SessionError::Validation(_) | SessionError::UploadType { .. } => {
                    StatusCode::BAD_REQUEST
                }
                SessionError::SessionAbsent(_)
                | SessionError::Disconnected
                | SessionError::RecipientNotFound(_) => StatusCode::NOT_FOUND,
                SessionError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                SessionError::SendFailed(_) | SessionError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (kind, message, details) = match &self {
            AppError::Session(SessionError::SendFailed(detail)) => (
                "send_failed",
                "failed to send message".to_string(),
                Some(detail.clone()),
            ),
            AppError::Session(SessionError::Storage(e)) => {
                tracing::error!("storage error: {:?}", e);
                ("storage_error", "internal server error".to_string(), None)
            }
            AppError::Session(e) => (e.kind(), e.to_string(), None),
            AppError::Internal(e) => {
                tracing::error!("internal error: {:?}", e);
                ("internal_error", "internal server error".to_string(), None)
            }
        };

        let mut body = serde_json::json!({
            "status": "error",
            "error": kind,
            "message": message,
        });
        if let Some(details) = details {
            body["details"] = details.into();
        }
        (status, axum::Json(body)).into_response()
    }
}
