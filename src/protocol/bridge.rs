//! WebSocket bridge to an out-of-process WhatsApp client.
//!
//! One bridge connection per session at `{bridge_url}/sessions/{id}`. Frames
//! are JSON objects discriminated by `type`:
//!
//! | direction | type     | fields                                              |
//! |-----------|----------|-----------------------------------------------------|
//! | out       | `auth`   | `files` (stored credentials)                        |
//! | out       | `send`   | `id`, `jid`, `message` (`{text}` or `{document}`)   |
//! | out       | `exists` | `id`, `jid`                                         |
//! | in        | `qr`     | `qr`                                                |
//! | in        | `open`   | `user.id`                                           |
//! | in        | `close`  | `statusCode`, `reason` (401 = logged out)           |
//! | in        | `creds`  | `files` (name to JSON, `null` deletes)              |
//! | in        | `ack`    | `id`, `ok`, `exists?`, `error?`                     |

use super::{OutgoingMessage, Protocol, ProtocolEvent, Socket};
use crate::session::store::{CredentialFiles, CredentialUpdate};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::Engine as _;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Bridge close status meaning the account was logged out.
pub const LOGGED_OUT_STATUS: u16 = 401;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Auth {
        files: &'a CredentialFiles,
    },
    Send {
        id: String,
        jid: &'a str,
        message: WireMessage,
    },
    Exists {
        id: String,
        jid: &'a str,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireMessage {
    Text { text: String },
    Document { document: WireDocument },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireDocument {
    data: String,
    mimetype: String,
    file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Qr {
        qr: String,
    },
    Open {
        #[serde(default)]
        user: Option<WireUser>,
    },
    Close {
        #[serde(default, rename = "statusCode")]
        status_code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    Creds {
        files: BTreeMap<String, Option<Value>>,
    },
    Ack {
        id: String,
        ok: bool,
        #[serde(default)]
        exists: Option<bool>,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Debug, Deserialize, PartialEq)]
struct WireUser {
    id: String,
}

#[derive(Debug)]
struct Ack {
    ok: bool,
    exists: Option<bool>,
    error: Option<String>,
}

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<Ack>>>>;

/// [`Protocol`] backed by the WebSocket bridge.
#[derive(Debug, Clone)]
pub struct BridgeProtocol {
    base_url: String,
    ack_timeout: Duration,
}

impl BridgeProtocol {
    pub fn new(base_url: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            ack_timeout,
        }
    }

    fn session_url(&self, session_id: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.starts_with("ws://") || base.starts_with("wss://") {
            format!("{base}/sessions/{session_id}")
        } else {
            format!("ws://{base}/sessions/{session_id}")
        }
    }
}

#[async_trait]
impl Protocol for BridgeProtocol {
    async fn open(
        &self,
        session_id: &str,
        credentials: CredentialFiles,
        events: mpsc::UnboundedSender<ProtocolEvent>,
    ) -> Result<Arc<dyn Socket>> {
        let url = self.session_url(session_id);
        tracing::debug!(session_id, %url, "Connecting to bridge");

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to bridge at {url}"))?;
        let (mut write, read) = ws_stream.split();

        let auth = serde_json::to_string(&Outbound::Auth {
            files: &credentials,
        })?;
        write
            .send(Message::text(auth))
            .await
            .context("Failed to send auth frame")?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::text(frame)).await {
                    tracing::debug!("Bridge write failed: {e}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(
            session_id.to_string(),
            read,
            events,
            Arc::clone(&pending),
        ));

        Ok(Arc::new(BridgeSocket {
            session_id: session_id.to_string(),
            outbound: Mutex::new(Some(outbound_tx)),
            pending,
            ack_timeout: self.ack_timeout,
            reader,
        }))
    }
}

async fn read_loop<S>(
    session_id: String,
    mut read: S,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    pending: PendingAcks,
) where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let closed = loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                break ProtocolEvent::Closed {
                    logged_out: false,
                    detail: "bridge stream ended".into(),
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                break ProtocolEvent::Closed {
                    logged_out: false,
                    detail: e.to_string(),
                };
            }
        };

        let frame: Inbound = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session_id, "Ignoring malformed bridge frame: {e}");
                continue;
            }
        };

        match frame {
            Inbound::Qr { qr } => {
                let _ = events.send(ProtocolEvent::Qr(qr));
            }
            Inbound::Open { user } => {
                let _ = events.send(ProtocolEvent::Open {
                    account_id: user.map(|u| u.id),
                });
            }
            Inbound::Creds { files } => {
                let _ = events.send(ProtocolEvent::CredentialsUpdated(CredentialUpdate { files }));
            }
            Inbound::Ack {
                id,
                ok,
                exists,
                error,
            } => {
                let waiter = pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ack { ok, exists, error });
                    }
                    None => tracing::debug!(session_id, "Ack for unknown request {id}"),
                }
            }
            Inbound::Close {
                status_code,
                reason,
            } => {
                break ProtocolEvent::Closed {
                    logged_out: status_code == Some(LOGGED_OUT_STATUS),
                    detail: reason.unwrap_or_else(|| match status_code {
                        Some(code) => format!("closed with status {code}"),
                        None => "closed by bridge".into(),
                    }),
                };
            }
        }
    };

    // Dropping the senders fails every in-flight request.
    pending.lock().clear();
    let _ = events.send(closed);
}

struct BridgeSocket {
    session_id: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: PendingAcks,
    ack_timeout: Duration,
    reader: JoinHandle<()>,
}

impl BridgeSocket {
    async fn request(&self, id: String, frame: String) -> Result<Ack> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let queued = self
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|out| out.send(frame).is_ok());
        if !queued {
            self.pending.lock().remove(&id);
            bail!("bridge connection is closed");
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => bail!("bridge connection closed before acknowledging request {id}"),
            Err(_) => {
                self.pending.lock().remove(&id);
                bail!(
                    "bridge did not acknowledge request {id} within {}s",
                    self.ack_timeout.as_secs()
                )
            }
        }
    }
}

#[async_trait]
impl Socket for BridgeSocket {
    async fn send(&self, jid: &str, message: &OutgoingMessage) -> Result<()> {
        let message = match message {
            OutgoingMessage::Text(text) => WireMessage::Text { text: text.clone() },
            OutgoingMessage::Document(doc) => {
                let bytes = tokio::fs::read(&doc.path)
                    .await
                    .with_context(|| format!("failed to read {}", doc.path.display()))?;
                WireMessage::Document {
                    document: WireDocument {
                        data: base64::engine::general_purpose::STANDARD.encode(bytes),
                        mimetype: doc.mimetype.clone(),
                        file_name: doc.file_name.clone(),
                        caption: doc.caption.clone(),
                    },
                }
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&Outbound::Send {
            id: id.clone(),
            jid,
            message,
        })?;
        let ack = self.request(id, frame).await?;
        if !ack.ok {
            bail!(
                "{}",
                ack.error.unwrap_or_else(|| "bridge rejected the message".into())
            );
        }
        Ok(())
    }

    async fn exists(&self, jid: &str) -> Result<bool> {
        let id = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&Outbound::Exists { id: id.clone(), jid })?;
        let ack = self.request(id, frame).await?;
        if !ack.ok {
            bail!(
                "{}",
                ack.error
                    .unwrap_or_else(|| "bridge could not look up the recipient".into())
            );
        }
        Ok(ack.exists.unwrap_or(false))
    }

    async fn close(&self) {
        tracing::debug!(session_id = %self.session_id, "Closing bridge connection");
        self.reader.abort();
        // The writer flushes a close frame once its queue is dropped.
        self.outbound.lock().take();
        self.pending.lock().clear();
    }
}

impl Drop for BridgeSocket {
    fn drop(&mut self) {
        // The writer exits on its own once `outbound` is dropped.
        self.reader.abort();
    }
}
