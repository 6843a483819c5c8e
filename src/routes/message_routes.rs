use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartError, rejection::JsonRejection},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::required;
use crate::error::AppError;
use crate::session::SessionError;
use crate::state::SharedState;
use crate::upload::{PDF_MIME, PendingUpload, is_pdf};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendText {
    pub session_id: Option<String>,
    pub to: Option<String>,
    pub message: Option<String>,
}

/// POST /messages/send-text
pub async fn send_text(
    State(state): State<SharedState>,
    payload: Result<Json<SendText>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = payload.map_err(|e| AppError::validation(e.body_text()))?;
    let session_id = required(body.session_id, "sessionId")?;
    let to = required(body.to, "to")?;
    let message = body
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| AppError::validation("message is required"))?;

    let supervisor = state.registry.get(&session_id).await?;
    supervisor.send_text(&to, &message).await?;

    Ok(Json(json!({
        "status": "ok",
        "sessionId": session_id,
        "to": to,
        "message": "message sent",
    })))
}

fn multipart_error(e: MultipartError) -> AppError {
    AppError::validation(format!("invalid multipart body: {}", e.body_text()))
}

/// POST /messages/send-pdf (multipart: `pdf`, `sessionId`, `to`, `caption`).
///
/// The uploaded file lives only for the duration of this request.
pub async fn send_pdf(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let max_bytes = state.config.max_upload_bytes as u64;
    let mut session_id = None;
    let mut to = None;
    let mut caption = None;
    let mut upload: Option<PendingUpload> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "pdf" => {
                let mimetype = field.content_type().unwrap_or_default().to_string();
                if !is_pdf(&mimetype) {
                    tracing::debug!(mimetype, "Rejected non-PDF upload");
                    return Err(SessionError::UploadType { field: name }.into());
                }
                let original = field.file_name().unwrap_or_default().to_string();
                let mut pending =
                    PendingUpload::create(&state.config.uploads_dir, &original, PDF_MIME).await?;
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    if pending.len() + chunk.len() as u64 > max_bytes {
                        return Err(AppError::validation(format!(
                            "pdf exceeds the {max_bytes} byte limit"
                        )));
                    }
                    pending.write(&chunk).await?;
                }
                pending.finish().await?;
                upload = Some(pending);
            }
            "sessionId" => session_id = Some(field.text().await.map_err(multipart_error)?),
            "to" => to = Some(field.text().await.map_err(multipart_error)?),
            "caption" => caption = Some(field.text().await.map_err(multipart_error)?),
            _ => {}
        }
    }

    let session_id = required(session_id, "sessionId")?;
    let to = required(to, "to")?;
    let upload = upload
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AppError::validation("pdf is required"))?;
    let caption = caption.filter(|c| !c.trim().is_empty());

    let supervisor = state.registry.get(&session_id).await?;
    let sent = supervisor
        .send_document(&to, upload.document(caption))
        .await;
    let file_name = upload.file_name().to_string();
    upload.discard().await;
    sent?;

    Ok(Json(json!({
        "status": "ok",
        "sessionId": session_id,
        "to": to,
        "fileName": file_name,
        "message": "document sent",
    })))
}
