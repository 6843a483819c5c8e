//! Session event hub: process-wide broadcast of session lifecycle
//! notifications for real-time observers.
//!
//! The registry publishes every supervisor event here; WebSocket clients
//! subscribe to the notifications of one session id. Events carry a
//! monotonic `seq` per session so observers can detect gaps. The counter
//! survives deletion and re-creation of a session id, so an observer that
//! stays subscribed across both never sees it go backwards.

use crate::session::SessionEvent;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const HUB_CAPACITY: usize = 256;

// ── Event Types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HubEventKind {
    #[serde(rename = "session-qr")]
    Qr,
    #[serde(rename = "session-ready")]
    Ready,
    #[serde(rename = "session-closed")]
    Closed,
}

/// Notification payload as delivered to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEvent {
    #[serde(rename = "type")]
    pub kind: HubEventKind,
    pub session_id: String,
    pub seq: u64,
    pub data: Value,
    pub timestamp: String,
}

// ── Hub ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<HubEvent>,
    seq_by_session: Arc<Mutex<HashMap<String, u64>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            tx,
            seq_by_session: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish a supervisor event. `phone_number` is attached to ready
    /// notifications when known.
    pub fn publish(&self, session_id: &str, event: &SessionEvent, phone_number: Option<String>) {
        let (kind, data) = match event {
            SessionEvent::Qr(qr) => (HubEventKind::Qr, json!({ "qr": qr })),
            SessionEvent::Ready => (HubEventKind::Ready, json!({ "phoneNumber": phone_number })),
            SessionEvent::Closed { reason, permanent } => (
                HubEventKind::Closed,
                json!({ "reason": reason.to_string(), "permanent": permanent }),
            ),
        };

        // Sent under the lock so delivery order matches `seq` order.
        let mut seqs = self.seq_by_session.lock();
        let next = seqs.entry(session_id.to_string()).or_insert(0);
        *next += 1;

        // No receivers is fine: nobody is watching this session right now.
        let _ = self.tx.send(HubEvent {
            kind,
            session_id: session_id.to_string(),
            seq: *next,
            data,
            timestamp: Utc::now().to_rfc3339(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to the notifications of one session.
    pub fn subscribe_session(&self, session_id: &str) -> SessionSubscription {
        SessionSubscription {
            session_id: session_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiver filtered to a single session id.
pub struct SessionSubscription {
    session_id: String,
    rx: broadcast::Receiver<HubEvent>,
}

impl SessionSubscription {
    /// Next notification for this session, `None` once the hub is gone.
    /// Lagged notifications are skipped.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.session_id == self.session_id => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        "Event subscriber lagged, skipped {skipped} events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
