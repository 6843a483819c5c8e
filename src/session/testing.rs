//! In-process [`Protocol`] used by the session tests.

use crate::protocol::{OutgoingMessage, Protocol, ProtocolEvent, Socket};
use crate::session::store::CredentialFiles;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

struct FakeConnection {
    session_id: String,
    credentials: CredentialFiles,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct FakeState {
    connections: Vec<FakeConnection>,
    fail_opens: usize,
    on_open: Vec<ProtocolEvent>,
    unregistered: HashSet<String>,
    hang_sends: bool,
    sent: Vec<(String, String, OutgoingMessage)>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeProtocol {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProtocol {
    /// Fail the next `n` opens.
    pub fn fail_opens(&self, n: usize) {
        self.state.lock().fail_opens = n;
    }

    /// Events every new connection emits right after opening.
    pub fn on_open(&self, events: Vec<ProtocolEvent>) {
        self.state.lock().on_open = events;
    }

    pub fn unregister(&self, jid: &str) {
        self.state.lock().unregistered.insert(jid.to_string());
    }

    pub fn hang_sends(&self, hang: bool) {
        self.state.lock().hang_sends = hang;
    }

    pub fn open_count(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .connections
            .iter()
            .filter(|c| c.session_id == session_id)
            .count()
    }

    pub async fn wait_for_opens(&self, session_id: &str, n: usize) {
        for _ in 0..12_000 {
            if self.open_count(session_id) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{session_id} never reached {n} opens");
    }

    /// Push an event into the latest connection of `session_id`.
    pub fn emit(&self, session_id: &str, event: ProtocolEvent) -> bool {
        let state = self.state.lock();
        state
            .connections
            .iter()
            .rev()
            .find(|c| c.session_id == session_id)
            .is_some_and(|c| c.events.send(event).is_ok())
    }

    pub fn last_credentials(&self, session_id: &str) -> Option<CredentialFiles> {
        self.state
            .lock()
            .connections
            .iter()
            .rev()
            .find(|c| c.session_id == session_id)
            .map(|c| c.credentials.clone())
    }

    pub fn is_closed(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .connections
            .iter()
            .rev()
            .find(|c| c.session_id == session_id)
            .is_some_and(|c| c.closed.load(Ordering::SeqCst))
    }

    pub fn sent(&self) -> Vec<(String, String, OutgoingMessage)> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl Protocol for FakeProtocol {
    async fn open(
        &self,
        session_id: &str,
        credentials: CredentialFiles,
        events: mpsc::UnboundedSender<ProtocolEvent>,
    ) -> anyhow::Result<Arc<dyn Socket>> {
        let mut state = self.state.lock();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            anyhow::bail!("bridge unreachable");
        }
        for event in &state.on_open {
            let _ = events.send(event.clone());
        }
        let closed = Arc::new(AtomicBool::new(false));
        state.connections.push(FakeConnection {
            session_id: session_id.to_string(),
            credentials,
            events,
            closed: Arc::clone(&closed),
        });
        Ok(Arc::new(FakeSocket {
            session_id: session_id.to_string(),
            state: Arc::clone(&self.state),
            closed,
        }))
    }
}

struct FakeSocket {
    session_id: String,
    state: Arc<Mutex<FakeState>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Socket for FakeSocket {
    async fn send(&self, jid: &str, message: &OutgoingMessage) -> anyhow::Result<()> {
        let hang = self.state.lock().hang_sends;
        if hang {
            std::future::pending::<()>().await;
        }
        self.state
            .lock()
            .sent
            .push((self.session_id.clone(), jid.to_string(), message.clone()));
        Ok(())
    }

    async fn exists(&self, jid: &str) -> anyhow::Result<bool> {
        Ok(!self.state.lock().unregistered.contains(jid))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
