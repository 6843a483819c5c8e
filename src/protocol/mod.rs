//! Protocol seam between the session core and whatever speaks WhatsApp.
//!
//! The session core never talks to the network itself. It asks a
//! [`Protocol`] to open a [`Socket`] for a session and consumes the
//! [`ProtocolEvent`]s the socket reports. [`bridge::BridgeProtocol`] is the
//! production implementation.

pub mod bridge;

use crate::session::store::{CredentialFiles, CredentialUpdate};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use bridge::BridgeProtocol;

/// Lifecycle and credential notifications from an open socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// A pairing payload to render as a QR code.
    Qr(String),
    /// The connection is authenticated; `account_id` is the paired account address.
    Open { account_id: Option<String> },
    /// The connection closed. `logged_out` means the credentials are no longer valid.
    Closed { logged_out: bool, detail: String },
    CredentialsUpdated(CredentialUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Local file holding the document bytes.
    pub path: PathBuf,
    pub file_name: String,
    pub mimetype: String,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    Text(String),
    Document(Document),
}

/// Opens protocol connections.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Open a connection for `session_id` using its stored credentials.
    ///
    /// Returns once the transport is established; authentication progress is
    /// reported through `events`. After a `Closed` event the socket is dead and
    /// no further events are sent.
    async fn open(
        &self,
        session_id: &str,
        credentials: CredentialFiles,
        events: mpsc::UnboundedSender<ProtocolEvent>,
    ) -> anyhow::Result<Arc<dyn Socket>>;
}

/// One live protocol connection.
#[async_trait]
pub trait Socket: Send + Sync {
    async fn send(&self, jid: &str, message: &OutgoingMessage) -> anyhow::Result<()>;

    /// Whether `jid` is registered on WhatsApp.
    async fn exists(&self, jid: &str) -> anyhow::Result<bool>;

    /// Tear the connection down. Idempotent; emits no further events.
    async fn close(&self);
}
