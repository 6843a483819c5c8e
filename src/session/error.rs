use std::time::Duration;

/// Errors surfaced by the session core.
///
/// Transient connection failures never show up here; callers only see
/// `NotReady`/`Timeout` while a retry is in progress.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),
    #[error("session is not ready")]
    NotReady,
    #[error("timed out after {}s waiting for the session", .0.as_secs())]
    Timeout(Duration),
    #[error("recipient {0} is not registered on WhatsApp")]
    RecipientNotFound(String),
    #[error("session was disconnected")]
    Disconnected,
    #[error("session {0} not found")]
    SessionAbsent(String),
    #[error("field \"{field}\" must be a PDF document")]
    UploadType { field: String },
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("storage: {0}")]
    Storage(#[from] anyhow::Error),
}

impl SessionError {
    /// Stable machine-readable kind, used as the `error` field of HTTP responses.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Validation(_) => "validation_error",
            SessionError::NotReady => "not_ready",
            SessionError::Timeout(_) => "timeout",
            SessionError::RecipientNotFound(_) => "recipient_not_found",
            SessionError::Disconnected => "disconnected",
            SessionError::SessionAbsent(_) => "session_absent",
            SessionError::UploadType { .. } => "upload_type_error",
            SessionError::SendFailed(_) => "send_failed",
            SessionError::Storage(_) => "storage_error",
        }
    }
}

/// Validate a caller-supplied session id. It doubles as a directory name, so
/// only `[A-Za-z0-9_.-]` is accepted and it may not start with a dot.
pub fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    if session_id.is_empty() {
        return Err(SessionError::Validation("sessionId is required".into()));
    }
    if session_id.len() > 128 {
        return Err(SessionError::Validation(
            "sessionId must be at most 128 characters".into(),
        ));
    }
    if session_id.starts_with('.')
        || !session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(SessionError::Validation(format!(
            "invalid sessionId `{session_id}`: use letters, digits, '-', '_' or '.'"
        )));
    }
    Ok(())
}
