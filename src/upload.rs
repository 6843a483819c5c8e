//! Temporary storage for uploaded documents.
//!
//! A [`PendingUpload`] owns one file under the uploads directory. Handlers
//! call [`PendingUpload::discard`] once the file has been used; early returns
//! fall back to removal on drop.

use crate::protocol::Document;
use anyhow::Context;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const PDF_MIME: &str = "application/pdf";

const MAX_FILE_NAME_CHARS: usize = 100;
const FALLBACK_FILE_NAME: &str = "document.pdf";

/// True for `application/pdf`, ignoring case and media-type parameters.
pub fn is_pdf(mimetype: &str) -> bool {
    mimetype
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(PDF_MIME))
}

/// Reduce a client-supplied file name to a safe basename.
pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let cleaned: String = cleaned.chars().take(MAX_FILE_NAME_CHARS).collect();
    if cleaned.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

pub struct PendingUpload {
    path: PathBuf,
    file_name: String,
    mimetype: String,
    file: Option<tokio::fs::File>,
    written: u64,
    discarded: bool,
}

impl PendingUpload {
    /// Create an empty file in `dir` for an upload named `original_name`.
    pub async fn create(dir: &Path, original_name: &str, mimetype: &str) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create uploads dir {}", dir.display()))?;

        let file_name = sanitize_file_name(original_name);
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let stored = format!(
            "{}-{}-{}",
            Utc::now().timestamp_millis(),
            &unique[..8],
            file_name
        );
        let path = dir.join(stored);
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Upload started");
        Ok(Self {
            path,
            file_name,
            mimetype: mimetype.to_string(),
            file: Some(file),
            written: 0,
            discarded: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let file = self
            .file
            .as_mut()
            .context("upload already finished")?;
        file.write_all(chunk)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush and close the file. Further writes fail.
    pub async fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .with_context(|| format!("failed to flush {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn document(&self, caption: Option<String>) -> Document {
        Document {
            path: self.path.clone(),
            file_name: self.file_name.clone(),
            mimetype: self.mimetype.clone(),
            caption,
        }
    }

    /// Close and remove the file.
    pub async fn discard(mut self) {
        self.file.take();
        self.discarded = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Upload removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), "Failed to remove upload: {e}"),
        }
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.discarded {
            return;
        }
        self.file.take();
        // Drop cannot await; this only runs when a request bails out early.
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Upload removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), "Failed to remove upload: {e}"),
        }
    }
}
