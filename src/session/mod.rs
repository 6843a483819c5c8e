//! Session core: one supervised WhatsApp connection per tenant session.
//!
//! A [`SessionRegistry`] owns at most one [`SessionSupervisor`] per session id.
//! Each supervisor drives a [`ConnectionHandle`] through the protocol seam and
//! reacts to its lifecycle with a [`ReconnectPolicy`] and an [`IdleTimer`].
//! Pairing credentials live on disk in a [`CredentialStore`].

pub mod connection;
pub mod error;
pub mod jid;
pub mod policy;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod timer;
pub mod types;

pub use connection::ConnectionHandle;
pub use error::{SessionError, validate_session_id};
pub use policy::{ReconnectDecision, ReconnectPolicy};
pub use registry::SessionRegistry;
pub use store::CredentialStore;
pub use supervisor::SessionSupervisor;
pub use timer::IdleTimer;
pub use types::*;

#[cfg(test)]
pub(crate) mod testing;
