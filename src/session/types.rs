//! Session state types shared by the connection, supervisor and registry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Protocol-level view of a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
        }
    }
}

/// Whether a closed session may come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseKind {
    /// Retry pending, or soft disconnect with credentials retained.
    Transient,
    /// Terminal. The supervisor is discarded and its credentials erased.
    Permanent,
}

/// Supervisor state machine.
///
/// ```text
/// Idle ──connect──▶ Connecting ──ready──▶ Open
///                      ▲   │                │ closed
///                retry │   └──closed──┐     ▼
///                      └──── Closed(Transient)
///                                  │ give up / logged out
///                                  ▼
///                          Closed(Permanent)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connecting,
    Open,
    Closed(CloseKind),
}

impl SupervisorState {
    pub fn connection_state(self) -> ConnectionState {
        match self {
            SupervisorState::Connecting => ConnectionState::Connecting,
            SupervisorState::Open => ConnectionState::Open,
            SupervisorState::Idle | SupervisorState::Closed(_) => ConnectionState::Disconnected,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SupervisorState::Closed(CloseKind::Permanent)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "idle"),
            SupervisorState::Connecting => write!(f, "connecting"),
            SupervisorState::Open => write!(f, "open"),
            SupervisorState::Closed(CloseKind::Transient) => write!(f, "closed (transient)"),
            SupervisorState::Closed(CloseKind::Permanent) => write!(f, "closed (permanent)"),
        }
    }
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// Credentials were invalidated server-side. Never retried.
    LoggedOut,
    /// An established (or establishing) connection dropped.
    ConnectionLost(String),
    /// The protocol collaborator could not open a connection at all.
    ConnectFailed(String),
    /// No activity for a whole idle window.
    IdleTimeout,
    /// A caller asked for the session to be disconnected.
    Requested,
    /// The reconnect budget ran out.
    RetriesExhausted,
    /// Removed from the registry; this supervisor will not connect again.
    Evicted,
}

impl CloseReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, CloseReason::LoggedOut)
    }

    /// Closes initiated on our side; these never trigger a reconnect.
    pub fn is_intentional(&self) -> bool {
        matches!(
            self,
            CloseReason::IdleTimeout | CloseReason::Requested | CloseReason::Evicted
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LoggedOut => write!(f, "logged out"),
            CloseReason::ConnectionLost(detail) => write!(f, "connection lost: {detail}"),
            CloseReason::ConnectFailed(detail) => write!(f, "connect failed: {detail}"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Requested => write!(f, "disconnect requested"),
            CloseReason::RetriesExhausted => write!(f, "reconnect attempts exhausted"),
            CloseReason::Evicted => write!(f, "session removed"),
        }
    }
}

/// Lifecycle notifications a supervisor delivers to its subscribers, in causal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A pairing payload was issued while connecting.
    Qr(String),
    /// The session reached `Open`.
    Ready,
    Closed {
        reason: CloseReason,
        permanent: bool,
    },
}

/// What `start` observed first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Ready,
    /// Pairing required; the payload to render as a QR code.
    Qr(String),
}

/// Point-in-time view of one session, published by its supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SupervisorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_qr: Option<String>,
    pub reconnect_attempts: u32,
    pub intentional_disconnect: bool,
    pub last_activity_at: DateTime<Utc>,
    /// Account address reported by the protocol once open (e.g. `15551234567:3@s.whatsapp.net`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl SessionSnapshot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: SupervisorState::Idle,
            pending_qr: None,
            reconnect_attempts: 0,
            intentional_disconnect: false,
            last_activity_at: Utc::now(),
            account_id: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SupervisorState::Open
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    /// True once the session can no longer become ready without an explicit
    /// `connect()`: permanently closed, or soft-disconnected.
    pub fn is_shut_down(&self) -> bool {
        match self.state {
            SupervisorState::Closed(CloseKind::Permanent) => true,
            SupervisorState::Closed(CloseKind::Transient) | SupervisorState::Idle => {
                self.intentional_disconnect
            }
            SupervisorState::Connecting | SupervisorState::Open => false,
        }
    }

    /// Phone number of the paired account, only while open.
    pub fn phone_number(&self) -> Option<String> {
        if !self.is_ready() {
            return None;
        }
        self.account_id
            .as_deref()
            .map(super::jid::phone_from_account)
            .filter(|phone| !phone.is_empty())
    }
}
