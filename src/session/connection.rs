//! One protocol connection for one session.
//!
//! A [`ConnectionHandle`] owns at most one live [`Socket`]. Each `connect()`
//! starts a new *generation*; events are tagged with the generation that
//! produced them so the supervisor can drop anything a superseded socket
//! still had in flight.

use super::error::SessionError;
use super::store::CredentialStore;
use super::types::{CloseReason, ConnectionState};
use crate::protocol::{OutgoingMessage, Protocol, ProtocolEvent, Socket};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle event emitted by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Qr(String),
    Ready { account_id: Option<String> },
    /// Transient close, or `CloseReason::LoggedOut` for a permanent one.
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: ConnectionEvent,
}

struct Pump {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

struct Inner {
    state: ConnectionState,
    socket: Option<Arc<dyn Socket>>,
    generation: u64,
    intentional: bool,
    pump: Option<Pump>,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    session_id: Arc<str>,
    protocol: Arc<dyn Protocol>,
    store: CredentialStore,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<TaggedEvent>,
}

impl ConnectionHandle {
    /// Returns the handle and the receiving end of its event stream.
    pub fn new(
        session_id: &str,
        protocol: Arc<dyn Protocol>,
        store: CredentialStore,
    ) -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let handle = Self {
            session_id: Arc::from(session_id),
            protocol,
            store,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                socket: None,
                generation: 0,
                intentional: false,
                pump: None,
            })),
            events,
        };
        (handle, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Whether the last close was requested through [`disconnect`](Self::disconnect).
    pub fn is_intentional(&self) -> bool {
        self.inner.lock().intentional
    }

    /// Start connecting in the background. A no-op unless disconnected;
    /// returns whether a new attempt was started.
    pub fn connect(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Disconnected {
            return false;
        }
        inner.state = ConnectionState::Connecting;
        inner.intentional = false;
        inner.generation += 1;
        let generation = inner.generation;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().run(generation, cancel.clone()));
        if let Some(previous) = inner.pump.replace(Pump { task, cancel }) {
            previous.cancel.cancel();
        }
        tracing::debug!(session_id = %self.session_id, generation, "Connecting");
        true
    }

    /// Close the live connection and mark the close as intentional.
    ///
    /// Returns once the event pump has stopped, so no credential write from
    /// the old connection can land afterwards.
    pub async fn disconnect(&self) {
        let (pump, socket) = {
            let mut inner = self.inner.lock();
            inner.intentional = true;
            inner.generation += 1;
            inner.state = ConnectionState::Disconnected;
            (inner.pump.take(), inner.socket.take())
        };
        if let Some(pump) = pump {
            pump.cancel.cancel();
            let _ = pump.task.await;
        }
        if let Some(socket) = socket {
            socket.close().await;
        }
    }

    fn open_socket(&self) -> Result<Arc<dyn Socket>, SessionError> {
        let inner = self.inner.lock();
        match (&inner.state, &inner.socket) {
            (ConnectionState::Open, Some(socket)) => Ok(Arc::clone(socket)),
            _ => Err(SessionError::NotReady),
        }
    }

    pub async fn send(&self, jid: &str, message: &OutgoingMessage) -> Result<(), SessionError> {
        let socket = self.open_socket()?;
        socket
            .send(jid, message)
            .await
            .map_err(|e| SessionError::SendFailed(format!("{e:#}")))
    }

    pub async fn exists(&self, jid: &str) -> Result<bool, SessionError> {
        let socket = self.open_socket()?;
        socket
            .exists(jid)
            .await
            .map_err(|e| SessionError::SendFailed(format!("{e:#}")))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    fn emit(&self, generation: u64, event: ConnectionEvent) {
        if self.is_current(generation) {
            let _ = self.events.send(TaggedEvent { generation, event });
        }
    }

    /// Mark the connection closed if `generation` is still current.
    fn finish(&self, generation: u64) -> bool {
        let socket = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return false;
            }
            inner.state = ConnectionState::Disconnected;
            inner.socket.take()
        };
        drop(socket);
        true
    }

    async fn run(self, generation: u64, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            opened = self.open(tx) => opened,
        };
        let socket = match opened {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "Connect failed: {e:#}");
                if self.finish(generation) {
                    let _ = self.events.send(TaggedEvent {
                        generation,
                        event: ConnectionEvent::Closed(CloseReason::ConnectFailed(format!(
                            "{e:#}"
                        ))),
                    });
                }
                return;
            }
        };

        let superseded = {
            let mut inner = self.inner.lock();
            if inner.generation == generation {
                inner.socket = Some(Arc::clone(&socket));
                false
            } else {
                true
            }
        };
        if superseded {
            socket.close().await;
            return;
        }

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                event = rx.recv() => event,
            };

            match event {
                Some(ProtocolEvent::CredentialsUpdated(update)) => {
                    if !self.is_current(generation) {
                        continue;
                    }
                    if let Err(e) = self.store.apply(&self.session_id, &update).await {
                        tracing::warn!(
                            session_id = %self.session_id,
                            "Failed to persist credentials: {e:#}"
                        );
                    }
                }
                Some(ProtocolEvent::Qr(qr)) => self.emit(generation, ConnectionEvent::Qr(qr)),
                Some(ProtocolEvent::Open { account_id }) => {
                    let current = {
                        let mut inner = self.inner.lock();
                        if inner.generation == generation {
                            inner.state = ConnectionState::Open;
                        }
                        inner.generation == generation
                    };
                    if current {
                        tracing::info!(session_id = %self.session_id, "Connection open");
                        let _ = self.events.send(TaggedEvent {
                            generation,
                            event: ConnectionEvent::Ready { account_id },
                        });
                    }
                }
                Some(ProtocolEvent::Closed { logged_out, detail }) => {
                    let reason = if logged_out {
                        CloseReason::LoggedOut
                    } else {
                        CloseReason::ConnectionLost(detail)
                    };
                    self.close_with(generation, reason);
                    return;
                }
                None => {
                    self.close_with(
                        generation,
                        CloseReason::ConnectionLost("protocol event stream ended".into()),
                    );
                    return;
                }
            }
        }
    }

    async fn open(
        &self,
        events: mpsc::UnboundedSender<ProtocolEvent>,
    ) -> anyhow::Result<Arc<dyn Socket>> {
        let credentials = self.store.load(&self.session_id).await?;
        self.protocol
            .open(&self.session_id, credentials, events)
            .await
    }

    fn close_with(&self, generation: u64, reason: CloseReason) {
        if self.finish(generation) {
            tracing::info!(session_id = %self.session_id, %reason, "Connection closed");
            let _ = self.events.send(TaggedEvent {
                generation,
                event: ConnectionEvent::Closed(reason),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeProtocol;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn handle(
        protocol: &FakeProtocol,
        tmp: &TempDir,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<TaggedEvent>) {
        ConnectionHandle::new(
            "abc",
            Arc::new(protocol.clone()),
            CredentialStore::new(tmp.path()),
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<TaggedEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event")
            .expect("channel open")
            .event
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_connecting() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let (conn, _rx) = handle(&protocol, &tmp);

        assert!(conn.connect());
        assert!(!conn.connect());
        assert_eq!(conn.state(), ConnectionState::Connecting);

        protocol.wait_for_opens("abc", 1).await;
        assert_eq!(protocol.open_count("abc"), 1);
    }

    #[tokio::test]
    async fn forwards_events_in_order_and_tracks_state() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let (conn, mut rx) = handle(&protocol, &tmp);

        conn.connect();
        protocol.wait_for_opens("abc", 1).await;
        protocol.emit("abc", ProtocolEvent::Qr("2@pair".into()));
        protocol.emit(
            "abc",
            ProtocolEvent::Open {
                account_id: Some("1555:1@s.whatsapp.net".into()),
            },
        );

        assert_eq!(next(&mut rx).await, ConnectionEvent::Qr("2@pair".into()));
        assert_eq!(
            next(&mut rx).await,
            ConnectionEvent::Ready {
                account_id: Some("1555:1@s.whatsapp.net".into())
            }
        );
        assert_eq!(conn.state(), ConnectionState::Open);

        protocol.emit(
            "abc",
            ProtocolEvent::Closed {
                logged_out: true,
                detail: "401".into(),
            },
        );
        assert_eq!(
            next(&mut rx).await,
            ConnectionEvent::Closed(CloseReason::LoggedOut)
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_requires_open() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let (conn, _rx) = handle(&protocol, &tmp);

        let err = conn
            .send("1@s.whatsapp.net", &OutgoingMessage::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotReady));
    }

    #[tokio::test]
    async fn failed_open_reports_connect_failed() {
        let protocol = FakeProtocol::default();
        protocol.fail_opens(1);
        let tmp = TempDir::new().unwrap();
        let (conn, mut rx) = handle(&protocol, &tmp);

        conn.connect();
        assert!(matches!(
            next(&mut rx).await,
            ConnectionEvent::Closed(CloseReason::ConnectFailed(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn persists_credentials_and_loads_them_on_next_connect() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let (conn, mut rx) = handle(&protocol, &tmp);

        conn.connect();
        protocol.wait_for_opens("abc", 1).await;
        let mut update = crate::session::store::CredentialUpdate::default();
        update
            .files
            .insert("creds.json".into(), Some(json!({"k": 1})));
        protocol.emit("abc", ProtocolEvent::CredentialsUpdated(update));
        protocol.emit(
            "abc",
            ProtocolEvent::Closed {
                logged_out: false,
                detail: "eof".into(),
            },
        );
        assert!(matches!(next(&mut rx).await, ConnectionEvent::Closed(_)));

        conn.connect();
        protocol.wait_for_opens("abc", 2).await;
        let creds = protocol.last_credentials("abc").unwrap();
        assert_eq!(creds["creds.json"], json!({"k": 1}));
    }

    #[tokio::test]
    async fn disconnect_is_intentional_and_silences_old_socket() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let (conn, mut rx) = handle(&protocol, &tmp);

        conn.connect();
        protocol.wait_for_opens("abc", 1).await;
        protocol.emit("abc", ProtocolEvent::Open { account_id: None });
        assert!(matches!(next(&mut rx).await, ConnectionEvent::Ready { .. }));

        conn.disconnect().await;
        assert!(conn.is_intentional());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(protocol.is_closed("abc"));

        let mut update = crate::session::store::CredentialUpdate::default();
        update.files.insert("late.json".into(), Some(json!(1)));
        protocol.emit("abc", ProtocolEvent::CredentialsUpdated(update));
        protocol.emit(
            "abc",
            ProtocolEvent::Closed {
                logged_out: false,
                detail: "eof".into(),
            },
        );
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert!(!tmp.path().join("abc").join("late.json").exists());
    }
}
