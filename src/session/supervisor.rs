//! Per-session state machine.
//!
//! Every session is owned by a single actor task. Callers talk to it through
//! [`SessionSupervisor`], which sends commands over a channel and reads the
//! latest [`SessionSnapshot`] from a `watch`. Connection events, the idle
//! timer and the reconnect timer are all handled on the actor, so state
//! transitions for one session are strictly serialized.

use super::connection::{ConnectionEvent, ConnectionHandle, TaggedEvent};
use super::error::SessionError;
use super::jid;
use super::policy::{ReconnectDecision, ReconnectPolicy};
use super::store::CredentialStore;
use super::timer::{IdleTimer, Timer};
use super::types::{
    CloseKind, CloseReason, SessionEvent, SessionSnapshot, StartOutcome, SupervisorState,
};
use crate::config::SessionConfig;
use crate::protocol::{Document, OutgoingMessage, Protocol};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

const EVENT_CAPACITY: usize = 64;

enum Command {
    Connect { done: Option<oneshot::Sender<()>> },
    Disconnect { done: oneshot::Sender<()> },
    Retire { done: oneshot::Sender<()> },
    Touch,
}

pub struct SessionSupervisor {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    connection: ConnectionHandle,
    start_timeout: Duration,
    send_timeout: Duration,
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionSupervisor {
    /// Create a supervisor in `Idle` and start its actor. Nothing connects
    /// until [`connect`](Self::connect) or [`start`](Self::start) is called.
    pub fn spawn(
        session_id: &str,
        protocol: Arc<dyn Protocol>,
        store: CredentialStore,
        config: &SessionConfig,
    ) -> Arc<Self> {
        let (connection, connection_events) = ConnectionHandle::new(session_id, protocol, store);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let initial = SessionSnapshot::new(session_id);
        let (publish, snapshot) = watch::channel(initial.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            snapshot: initial,
            publish,
            events: events.clone(),
            connection: connection.clone(),
            policy: config.reconnect_policy(),
            idle: IdleTimer::new(config.idle_timeout()),
            retry: Timer::default(),
        };
        tokio::spawn(actor.run(command_rx, connection_events));

        Arc::new(Self {
            session_id: session_id.to_string(),
            commands,
            snapshot,
            events,
            connection,
            start_timeout: config.start_timeout(),
            send_timeout: config.send_timeout(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.snapshot.borrow().state
    }

    /// Readiness check. Counts as activity: polling keeps the session alive.
    pub fn is_ready(&self) -> bool {
        self.touch();
        self.snapshot.borrow().is_ready()
    }

    /// Record activity, pushing the idle deadline out.
    pub fn touch(&self) {
        let _ = self.commands.send(Command::Touch);
    }

    /// Lifecycle events from now on. Every subscriber sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Begin connecting. A no-op while connecting, open or permanently closed.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect { done: None });
    }

    /// Like [`connect`](Self::connect), but returns only once the actor has
    /// handled the request, so the published snapshot already reflects it.
    pub async fn connect_confirmed(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Connect { done: Some(done) }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Soft disconnect: cancels timers, closes the connection and keeps
    /// credentials. Returns once the connection is down.
    pub async fn disconnect(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Disconnect { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Shut this supervisor down for good once it is no longer registered.
    /// Credentials are kept; later `connect`/`start` calls fail with
    /// `Disconnected` instead of opening a connection nobody tracks.
    pub async fn retire(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Retire { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Connect and wait for the first pairing QR or for readiness, whichever
    /// comes first.
    pub async fn start(&self) -> Result<StartOutcome, SessionError> {
        let mut events = self.subscribe();
        {
            let snapshot = self.snapshot.borrow();
            if snapshot.is_ready() {
                return Ok(StartOutcome::Ready);
            }
            if snapshot.state.is_terminal() {
                return Err(SessionError::Disconnected);
            }
            if let Some(qr) = &snapshot.pending_qr {
                return Ok(StartOutcome::Qr(qr.clone()));
            }
        }
        self.connect_confirmed().await;

        let waited = tokio::time::timeout(self.start_timeout, async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Qr(qr)) => return Ok(StartOutcome::Qr(qr)),
                    Ok(SessionEvent::Ready) => return Ok(StartOutcome::Ready),
                    Ok(SessionEvent::Closed { reason, permanent }) => {
                        if permanent || reason.is_intentional() {
                            return Err(SessionError::Disconnected);
                        }
                    }
                    Err(RecvError::Lagged(_)) => {
                        let snapshot = self.snapshot();
                        if snapshot.is_ready() {
                            return Ok(StartOutcome::Ready);
                        }
                        if let Some(qr) = snapshot.pending_qr {
                            return Ok(StartOutcome::Qr(qr));
                        }
                    }
                    Err(RecvError::Closed) => return Err(SessionError::Disconnected),
                }
            }
        })
        .await;
        waited.unwrap_or(Err(SessionError::Timeout(self.start_timeout)))
    }

    /// Wait until the session is open. Fails with `Disconnected` if it shuts
    /// down first and with `Timeout` if `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut snapshot = self.snapshot.clone();
        let waited = tokio::time::timeout(timeout, async {
            snapshot
                .wait_for(|s| s.is_ready() || s.is_shut_down())
                .await
                .map(|s| s.is_ready())
        })
        .await;
        match waited {
            Err(_) => Err(SessionError::Timeout(timeout)),
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false) | Err(_)) => Err(SessionError::Disconnected),
        }
    }

    pub async fn send_text(&self, to: &str, text: &str) -> Result<(), SessionError> {
        self.deliver(to, OutgoingMessage::Text(text.to_string()))
            .await
    }

    /// Send a document from a local file. The file stays owned by the caller.
    pub async fn send_document(&self, to: &str, document: Document) -> Result<(), SessionError> {
        self.deliver(to, OutgoingMessage::Document(document)).await
    }

    async fn deliver(&self, to: &str, message: OutgoingMessage) -> Result<(), SessionError> {
        let jid = jid::normalize(to)?;
        self.touch();
        self.wait_ready(self.send_timeout).await?;

        let connection = &self.connection;
        let attempt = async {
            if !connection.exists(&jid).await? {
                return Err(SessionError::RecipientNotFound(jid.clone()));
            }
            connection.send(&jid, &message).await
        };
        let mut snapshot = self.snapshot.clone();
        let left_open = async move {
            let _ = snapshot.wait_for(|s| !s.is_ready()).await;
        };

        let result = tokio::select! {
            result = attempt => result.map_err(|e| match e {
                SessionError::NotReady => SessionError::Disconnected,
                other => other,
            }),
            () = left_open => Err(SessionError::Disconnected),
        };
        match &result {
            Ok(()) => {
                self.touch();
                tracing::info!(session_id = %self.session_id, %jid, "Message sent");
            }
            Err(e) => tracing::warn!(session_id = %self.session_id, %jid, "Send failed: {e}"),
        }
        result
    }
}

struct Actor {
    snapshot: SessionSnapshot,
    publish: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    connection: ConnectionHandle,
    policy: ReconnectPolicy,
    idle: IdleTimer,
    retry: Timer,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connection_events: mpsc::UnboundedReceiver<TaggedEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect { done }) => {
                        self.start_connect();
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    }
                    Some(Command::Disconnect { done }) => {
                        self.soft_disconnect(CloseReason::Requested).await;
                        let _ = done.send(());
                    }
                    Some(Command::Retire { done }) => {
                        self.retire().await;
                        let _ = done.send(());
                    }
                    Some(Command::Touch) => self.touch(),
                    None => break,
                },
                Some(tagged) = connection_events.recv() => {
                    if tagged.generation == self.connection.generation() {
                        self.on_connection_event(tagged.event);
                    }
                }
                () = self.idle.expired() => {
                    tracing::info!(session_id = %self.snapshot.session_id, "Session idle, disconnecting");
                    self.soft_disconnect(CloseReason::IdleTimeout).await;
                }
                () = self.retry.fired() => self.reconnect(),
            }
            if self.snapshot.state.is_terminal() {
                break;
            }
        }

        self.idle.cancel();
        self.retry.cancel();
        self.connection.disconnect().await;
        tracing::debug!(session_id = %self.snapshot.session_id, "Supervisor stopped");
    }

    fn publish(&self) {
        self.publish.send_replace(self.snapshot.clone());
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn touch(&mut self) {
        self.snapshot.last_activity_at = Utc::now();
        if self.idle.is_armed() {
            self.idle.reset();
        }
        self.publish();
    }

    fn start_connect(&mut self) {
        match self.snapshot.state {
            SupervisorState::Connecting
            | SupervisorState::Open
            | SupervisorState::Closed(CloseKind::Permanent) => return,
            SupervisorState::Idle | SupervisorState::Closed(CloseKind::Transient) => {}
        }
        self.retry.cancel();
        self.snapshot.intentional_disconnect = false;
        self.snapshot.state = SupervisorState::Connecting;
        self.snapshot.last_activity_at = Utc::now();
        self.connection.connect();
        self.idle.reset();
        tracing::info!(session_id = %self.snapshot.session_id, "Session connecting");
        self.publish();
    }

    fn reconnect(&mut self) {
        if self.snapshot.state != SupervisorState::Closed(CloseKind::Transient)
            || self.snapshot.intentional_disconnect
        {
            return;
        }
        tracing::info!(
            session_id = %self.snapshot.session_id,
            attempt = self.snapshot.reconnect_attempts,
            "Reconnecting"
        );
        self.snapshot.state = SupervisorState::Connecting;
        self.connection.connect();
        self.publish();
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Qr(qr) => {
                if self.snapshot.state != SupervisorState::Connecting {
                    return;
                }
                tracing::info!(session_id = %self.snapshot.session_id, "Pairing QR issued");
                self.snapshot.pending_qr = Some(qr.clone());
                self.publish();
                self.emit(SessionEvent::Qr(qr));
            }
            ConnectionEvent::Ready { account_id } => {
                self.retry.cancel();
                self.idle.reset();
                self.snapshot.state = SupervisorState::Open;
                self.snapshot.pending_qr = None;
                self.snapshot.reconnect_attempts = 0;
                self.snapshot.last_activity_at = Utc::now();
                if account_id.is_some() {
                    self.snapshot.account_id = account_id;
                }
                tracing::info!(session_id = %self.snapshot.session_id, "Session ready");
                self.publish();
                self.emit(SessionEvent::Ready);
            }
            ConnectionEvent::Closed(reason) => self.on_closed(reason),
        }
    }

    fn on_closed(&mut self, reason: CloseReason) {
        if reason.is_logged_out() {
            self.close_permanently(reason);
            return;
        }
        if self.snapshot.intentional_disconnect {
            return;
        }

        match self.policy.decide(&reason, self.snapshot.reconnect_attempts) {
            ReconnectDecision::Reconnect(delay) => {
                self.snapshot.reconnect_attempts += 1;
                self.snapshot.state = SupervisorState::Closed(CloseKind::Transient);
                self.snapshot.pending_qr = None;
                self.retry.arm(delay);
                tracing::warn!(
                    session_id = %self.snapshot.session_id,
                    %reason,
                    attempt = self.snapshot.reconnect_attempts,
                    delay_secs = delay.as_secs(),
                    "Connection closed, scheduling reconnect"
                );
                self.publish();
                self.emit(SessionEvent::Closed {
                    reason,
                    permanent: false,
                });
            }
            ReconnectDecision::GiveUp => {
                tracing::warn!(
                    session_id = %self.snapshot.session_id,
                    %reason,
                    "Reconnect budget exhausted"
                );
                self.close_permanently(CloseReason::RetriesExhausted);
            }
        }
    }

    fn close_permanently(&mut self, reason: CloseReason) {
        self.retry.cancel();
        self.idle.cancel();
        self.snapshot.state = SupervisorState::Closed(CloseKind::Permanent);
        self.snapshot.pending_qr = None;
        tracing::warn!(session_id = %self.snapshot.session_id, %reason, "Session closed permanently");
        self.publish();
        self.emit(SessionEvent::Closed {
            reason,
            permanent: true,
        });
    }

    async fn retire(&mut self) {
        self.retry.cancel();
        self.idle.cancel();
        self.connection.disconnect().await;
        if self.snapshot.state.is_terminal() {
            return;
        }
        self.snapshot.intentional_disconnect = true;
        self.snapshot.state = SupervisorState::Closed(CloseKind::Permanent);
        self.snapshot.pending_qr = None;
        tracing::info!(session_id = %self.snapshot.session_id, "Supervisor retired");
        self.publish();
        self.emit(SessionEvent::Closed {
            reason: CloseReason::Evicted,
            permanent: true,
        });
    }

    async fn soft_disconnect(&mut self, reason: CloseReason) {
        self.retry.cancel();
        self.idle.cancel();
        self.connection.disconnect().await;
        if self.snapshot.state.is_terminal() {
            return;
        }

        let already_down = self.snapshot.intentional_disconnect
            && self.snapshot.state == SupervisorState::Closed(CloseKind::Transient);
        self.snapshot.intentional_disconnect = true;
        self.snapshot.state = SupervisorState::Closed(CloseKind::Transient);
        self.snapshot.pending_qr = None;
        self.publish();
        if !already_down {
            tracing::info!(session_id = %self.snapshot.session_id, %reason, "Session disconnected");
            self.emit(SessionEvent::Closed {
                reason,
                permanent: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolEvent;
    use crate::session::testing::FakeProtocol;
    use tempfile::TempDir;

    fn supervisor(protocol: &FakeProtocol, tmp: &TempDir) -> Arc<SessionSupervisor> {
        SessionSupervisor::spawn(
            "abc",
            Arc::new(protocol.clone()),
            CredentialStore::new(tmp.path()),
            &SessionConfig::default(),
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("event before timeout")
            .expect("event channel open")
    }

    fn lost() -> ProtocolEvent {
        ProtocolEvent::Closed {
            logged_out: false,
            detail: "stream errored".into(),
        }
    }

    fn open() -> ProtocolEvent {
        ProtocolEvent::Open {
            account_id: Some("15551234567:3@s.whatsapp.net".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_returns_qr_for_fresh_session() {
        let protocol = FakeProtocol::default();
        protocol.on_open(vec![ProtocolEvent::Qr("2@pair".into())]);
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);

        let outcome = sup.start().await.unwrap();
        assert_eq!(outcome, StartOutcome::Qr("2@pair".into()));
        let snap = sup.snapshot();
        assert_eq!(snap.state, SupervisorState::Connecting);
        assert_eq!(snap.pending_qr.as_deref(), Some("2@pair"));

        // A second start while still pairing hands back the same QR without reconnecting.
        assert_eq!(sup.start().await.unwrap(), StartOutcome::Qr("2@pair".into()));
        assert_eq!(protocol.open_count("abc"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_times_out_without_signal() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(d) if d == Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn open_clears_qr_and_resets_attempts() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        let mut events = sup.subscribe();

        sup.connect();
        protocol.wait_for_opens("abc", 1).await;
        protocol.emit("abc", lost());
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Closed { permanent: false, .. }
        ));
        assert_eq!(sup.snapshot().reconnect_attempts, 1);

        protocol.wait_for_opens("abc", 2).await;
        protocol.emit("abc", ProtocolEvent::Qr("2@again".into()));
        assert_eq!(next_event(&mut events).await, SessionEvent::Qr("2@again".into()));
        protocol.emit("abc", open());
        assert_eq!(next_event(&mut events).await, SessionEvent::Ready);

        let snap = sup.snapshot();
        assert!(snap.is_ready());
        assert_eq!(snap.reconnect_attempts, 0);
        assert_eq!(snap.pending_qr, None);
        assert_eq!(snap.phone_number().as_deref(), Some("15551234567"));
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_is_permanent_without_retry() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        let mut events = sup.subscribe();

        sup.connect();
        protocol.wait_for_opens("abc", 1).await;
        protocol.emit("abc", open());
        assert_eq!(next_event(&mut events).await, SessionEvent::Ready);

        protocol.emit(
            "abc",
            ProtocolEvent::Closed {
                logged_out: true,
                detail: "401".into(),
            },
        );
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Closed {
                reason: CloseReason::LoggedOut,
                permanent: true
            }
        );
        let snap = sup.snapshot();
        assert_eq!(snap.state, SupervisorState::Closed(CloseKind::Permanent));
        assert_eq!(snap.reconnect_attempts, 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(protocol.open_count("abc"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_closes_back_off_then_give_up() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        let mut events = sup.subscribe();

        sup.connect();
        let mut delays = Vec::new();
        for attempt in 1..=5 {
            protocol.wait_for_opens("abc", attempt).await;
            protocol.emit("abc", lost());
            assert!(matches!(
                next_event(&mut events).await,
                SessionEvent::Closed { permanent: false, .. }
            ));
            let closed_at = tokio::time::Instant::now();
            protocol.wait_for_opens("abc", attempt + 1).await;
            delays.push(closed_at.elapsed().as_secs());
        }
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);

        protocol.emit("abc", lost());
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Closed {
                reason: CloseReason::RetriesExhausted,
                permanent: true
            }
        );
        assert!(sup.state().is_terminal());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(protocol.open_count("abc"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_scheduled_reconnect() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        let mut events = sup.subscribe();

        sup.connect();
        protocol.wait_for_opens("abc", 1).await;
        protocol.emit("abc", lost());
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Closed { permanent: false, .. }
        ));

        // Still inside the 2s backoff.
        sup.disconnect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(protocol.open_count("abc"), 1);
        let snap = sup.snapshot();
        assert_eq!(snap.state, SupervisorState::Closed(CloseKind::Transient));
        assert!(snap.intentional_disconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn retired_supervisor_refuses_to_connect() {
        let protocol = FakeProtocol::default();
        protocol.on_open(vec![open()]);
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        let mut events = sup.subscribe();
        assert_eq!(sup.start().await.unwrap(), StartOutcome::Ready);

        sup.retire().await;
        assert_eq!(next_event(&mut events).await, SessionEvent::Ready);
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Closed {
                reason: CloseReason::Evicted,
                permanent: true
            }
        );
        assert!(protocol.is_closed("abc"));
        assert!(sup.state().is_terminal());

        assert!(matches!(sup.start().await, Err(SessionError::Disconnected)));
        sup.connect();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(protocol.open_count("abc"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_keeps_session_alive_and_silence_times_out_once() {
        let protocol = FakeProtocol::default();
        protocol.on_open(vec![open()]);
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        assert_eq!(sup.start().await.unwrap(), StartOutcome::Ready);
        let mut events = sup.subscribe();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(240)).await;
            assert!(sup.is_ready());
        }
        assert!(events.try_recv().is_err(), "no timeout while polled");

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Closed {
                reason: CloseReason::IdleTimeout,
                permanent: false
            }
        );
        let snap = sup.snapshot();
        assert_eq!(snap.state, SupervisorState::Closed(CloseKind::Transient));
        assert!(snap.intentional_disconnect);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(events.try_recv().is_err(), "idle timeout fires once");
        assert_eq!(protocol.open_count("abc"), 1, "no reconnect after soft disconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn send_waits_for_open() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);

        sup.connect();
        protocol.wait_for_opens("abc", 1).await;
        let opener = {
            let protocol = protocol.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                protocol.emit("abc", open());
            })
        };

        sup.send_text("+1 555 123 4567", "hola").await.unwrap();
        opener.await.unwrap();

        let sent = protocol.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "15551234567@s.whatsapp.net");
        assert_eq!(sent[0].2, OutgoingMessage::Text("hola".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn send_times_out_when_never_open() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        sup.connect();

        let start = tokio::time::Instant::now();
        let err = sup.send_text("15551234567", "hola").await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_unregistered_recipient() {
        let protocol = FakeProtocol::default();
        protocol.on_open(vec![open()]);
        protocol.unregister("15550000000@s.whatsapp.net");
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        sup.start().await.unwrap();

        let err = sup.send_text("15550000000", "hola").await.unwrap_err();
        assert!(matches!(err, SessionError::RecipientNotFound(_)));
        assert!(protocol.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_recipient_fails_fast() {
        let protocol = FakeProtocol::default();
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);

        let err = sup.send_text("not a number", "hola").await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_in_flight_send() {
        let protocol = FakeProtocol::default();
        protocol.on_open(vec![open()]);
        protocol.hang_sends(true);
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        sup.start().await.unwrap();

        let sending = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.send_text("15551234567", "hola").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.disconnect().await;

        let err = sending.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Disconnected));
        assert!(sup.snapshot().intentional_disconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn send_after_soft_disconnect_is_disconnected() {
        let protocol = FakeProtocol::default();
        protocol.on_open(vec![open()]);
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        sup.start().await.unwrap();
        sup.disconnect().await;

        let err = sup.send_text("15551234567", "hola").await.unwrap_err();
        assert!(matches!(err, SessionError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_soft_disconnect() {
        let protocol = FakeProtocol::default();
        protocol.on_open(vec![open()]);
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&protocol, &tmp);
        sup.start().await.unwrap();
        sup.disconnect().await;

        assert_eq!(sup.start().await.unwrap(), StartOutcome::Ready);
        assert!(!sup.snapshot().intentional_disconnect);
        assert_eq!(protocol.open_count("abc"), 2);
    }
}
