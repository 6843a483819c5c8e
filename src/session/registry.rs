//! Process-wide map of session id to supervisor.
//!
//! All create/get/delete operations on one id run under a per-id async lock,
//! so at most one supervisor per id can ever be registered. Operations on
//! different ids never contend beyond the brief map access.

use super::error::{SessionError, validate_session_id};
use super::jid;
use super::store::CredentialStore;
use super::supervisor::SessionSupervisor;
use super::types::{CloseReason, SessionEvent, StartOutcome};
use crate::config::SessionConfig;
use crate::events::EventHub;
use crate::protocol::Protocol;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::OwnedMutexGuard;

type KeyLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionSupervisor>>>,
    locks: KeyLocks,
    store: CredentialStore,
    protocol: Arc<dyn Protocol>,
    config: SessionConfig,
    hub: EventHub,
    this: Weak<SessionRegistry>,
}

/// Held while operating on one session id. Unused lock entries are pruned on drop.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock();
        if locks
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.session_id);
        }
    }
}

impl SessionRegistry {
    pub fn new(
        store: CredentialStore,
        protocol: Arc<dyn Protocol>,
        config: SessionConfig,
        hub: EventHub,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sessions: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            store,
            protocol,
            config,
            hub,
            this: this.clone(),
        })
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    async fn lock_key(&self, session_id: &str) -> KeyGuard<'_> {
        let lock = Arc::clone(self.locks.lock().entry(session_id.to_string()).or_default());
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: &self.locks,
            session_id: session_id.to_string(),
            guard: Some(guard),
        }
    }

    /// In-memory supervisor, if any. Never touches disk.
    pub fn peek(&self, session_id: &str) -> Option<Arc<SessionSupervisor>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Registered supervisor that is not permanently closed.
    fn live(&self, session_id: &str) -> Option<Arc<SessionSupervisor>> {
        self.peek(session_id)
            .filter(|supervisor| !supervisor.state().is_terminal())
    }

    /// Ids of the supervisors currently in memory, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Ids with credentials on disk.
    pub async fn stored_ids(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.store.list().await?)
    }

    /// Return the registered supervisor for `session_id`, creating an idle one
    /// if there is none. Idempotent.
    pub async fn create(&self, session_id: &str) -> Result<Arc<SessionSupervisor>, SessionError> {
        validate_session_id(session_id)?;
        let _key = self.lock_key(session_id).await;
        Ok(self.create_locked(session_id).await)
    }

    /// Create (or reuse) a session and connect it, then wait for its first
    /// pairing QR or readiness.
    ///
    /// The connect request is handled by the supervisor before the key lock
    /// is released, so an idle eviction cannot slip in between and leave the
    /// caller driving a supervisor the registry no longer tracks.
    pub async fn start(&self, session_id: &str) -> Result<StartOutcome, SessionError> {
        validate_session_id(session_id)?;
        let supervisor = {
            let _key = self.lock_key(session_id).await;
            let supervisor = self.create_locked(session_id).await;
            supervisor.connect_confirmed().await;
            supervisor
        };
        supervisor.start().await
    }

    async fn create_locked(&self, session_id: &str) -> Arc<SessionSupervisor> {
        if let Some(existing) = self.peek(session_id) {
            if !existing.state().is_terminal() {
                return existing;
            }
            // Closed for good but the watcher has not evicted it yet.
            self.evict_locked(session_id, &existing, true).await;
        }
        self.insert(session_id)
    }

    /// Look a session up, restoring it from stored credentials if needed.
    ///
    /// A restored session is only returned once it is open; if the stored
    /// credentials do not get it there, they are erased and the session is
    /// reported absent.
    pub async fn get(&self, session_id: &str) -> Result<Arc<SessionSupervisor>, SessionError> {
        validate_session_id(session_id)?;
        let _key = self.lock_key(session_id).await;

        if let Some(existing) = self.live(session_id) {
            return Ok(existing);
        }
        if !self.store.exists(session_id).await {
            return Err(SessionError::SessionAbsent(session_id.to_string()));
        }

        tracing::info!(session_id, "Restoring session from stored credentials");
        let supervisor = self.insert(session_id);
        match self.await_restore(&supervisor).await {
            Ok(()) => Ok(supervisor),
            Err(detail) => {
                self.fail_restore_locked(session_id, &supervisor, &detail)
                    .await;
                Err(SessionError::SessionAbsent(session_id.to_string()))
            }
        }
    }

    /// Status lookup: like [`get`](Self::get) but returns a restoring session
    /// immediately so callers can observe its transient state. `None` means
    /// absent in memory and on disk.
    pub async fn observe(
        &self,
        session_id: &str,
    ) -> Result<Option<Arc<SessionSupervisor>>, SessionError> {
        validate_session_id(session_id)?;
        let _key = self.lock_key(session_id).await;

        if let Some(existing) = self.live(session_id) {
            return Ok(Some(existing));
        }
        if !self.store.exists(session_id).await {
            return Ok(None);
        }

        tracing::info!(session_id, "Restoring session from stored credentials");
        let supervisor = self.insert(session_id);
        let registry = self.this.clone();
        let restoring = Arc::downgrade(&supervisor);
        let mut events = supervisor.subscribe();
        // Callers see `connecting` rather than a stale `idle` snapshot.
        supervisor.connect_confirmed().await;
        let restore_timeout = self.config.restore_timeout();
        let id = session_id.to_string();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(restore_timeout, restore_outcome(&mut events))
                .await
                .unwrap_or_else(|_| Err(timeout_detail(restore_timeout)));
            let Err(detail) = outcome else { return };
            let (Some(registry), Some(supervisor)) = (registry.upgrade(), restoring.upgrade())
            else {
                return;
            };
            let _key = registry.lock_key(&id).await;
            registry
                .fail_restore_locked(&id, &supervisor, &detail)
                .await;
        });
        Ok(Some(supervisor))
    }

    /// Soft-disconnect and unregister a session; with `erase_files`, also
    /// remove its stored credentials. Returns whether anything was removed.
    pub async fn delete(&self, session_id: &str, erase_files: bool) -> Result<bool, SessionError> {
        validate_session_id(session_id)?;
        let _key = self.lock_key(session_id).await;

        let removed = self.sessions.write().remove(session_id);
        if let Some(supervisor) = &removed {
            supervisor.retire().await;
        }

        let had_files = erase_files && self.store.exists(session_id).await;
        if erase_files {
            self.store.erase(session_id).await?;
        }
        tracing::info!(
            session_id,
            in_memory = removed.is_some(),
            erased = had_files,
            "Session deleted"
        );
        Ok(removed.is_some() || had_files)
    }

    /// Disconnect every session and empty the map. Credentials stay on disk
    /// so sessions can be restored on the next start.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<SessionSupervisor>> =
            self.sessions.write().drain().map(|(_, s)| s).collect();
        tracing::info!("Disconnecting {} session(s)", drained.len());
        futures_util::future::join_all(drained.iter().map(|s| s.retire())).await;
    }

    fn insert(&self, session_id: &str) -> Arc<SessionSupervisor> {
        let supervisor = SessionSupervisor::spawn(
            session_id,
            Arc::clone(&self.protocol),
            self.store.clone(),
            &self.config,
        );
        self.sessions
            .write()
            .insert(session_id.to_string(), Arc::clone(&supervisor));
        self.spawn_watcher(&supervisor);
        tracing::debug!(session_id, "Supervisor registered");
        supervisor
    }

    /// Forward supervisor events to the hub and clean up after permanent
    /// closes (erase) and idle timeouts (keep credentials).
    fn spawn_watcher(&self, supervisor: &Arc<SessionSupervisor>) {
        let registry = self.this.clone();
        let watched = Arc::downgrade(supervisor);
        let mut events = supervisor.subscribe();
        let hub = self.hub.clone();
        let session_id = supervisor.session_id().to_string();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id, "Watcher lagged, skipped {skipped} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let phone = match event {
                    SessionEvent::Ready => watched
                        .upgrade()
                        .and_then(|s| s.snapshot().account_id)
                        .map(|account| jid::phone_from_account(&account)),
                    _ => None,
                };
                hub.publish(&session_id, &event, phone);

                let erase = match &event {
                    // Already unregistered by whoever retired it.
                    SessionEvent::Closed {
                        reason: CloseReason::Evicted,
                        ..
                    } => break,
                    SessionEvent::Closed {
                        permanent: true, ..
                    } => true,
                    SessionEvent::Closed {
                        reason: CloseReason::IdleTimeout,
                        ..
                    } => false,
                    _ => continue,
                };
                let (Some(registry), Some(supervisor)) = (registry.upgrade(), watched.upgrade())
                else {
                    break;
                };
                let _key = registry.lock_key(&session_id).await;
                let evicted = if erase {
                    registry.evict_locked(&session_id, &supervisor, true).await
                } else {
                    // Only if nobody reconnected it in the meantime.
                    let snapshot = supervisor.snapshot();
                    snapshot.is_shut_down()
                        && registry.evict_locked(&session_id, &supervisor, false).await
                };
                if evicted {
                    break;
                }
            }
        });
    }

    /// Unregister `supervisor` if it is still the one registered under
    /// `session_id`. Caller holds the key lock.
    async fn evict_locked(
        &self,
        session_id: &str,
        supervisor: &Arc<SessionSupervisor>,
        erase_files: bool,
    ) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(session_id) {
                Some(current) if Arc::ptr_eq(current, supervisor) => {
                    sessions.remove(session_id);
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return false;
        }

        supervisor.retire().await;
        if erase_files {
            if let Err(e) = self.store.erase(session_id).await {
                tracing::warn!(session_id, "Failed to erase credentials: {e}");
            }
        }
        tracing::info!(session_id, erase_files, "Session evicted");
        true
    }

    async fn await_restore(&self, supervisor: &SessionSupervisor) -> Result<(), String> {
        let mut events = supervisor.subscribe();
        supervisor.connect();
        let restore_timeout = self.config.restore_timeout();
        tokio::time::timeout(restore_timeout, restore_outcome(&mut events))
            .await
            .unwrap_or_else(|_| Err(timeout_detail(restore_timeout)))
    }

    /// Caller holds the key lock.
    async fn fail_restore_locked(
        &self,
        session_id: &str,
        supervisor: &Arc<SessionSupervisor>,
        detail: &str,
    ) {
        tracing::warn!(session_id, "Restore failed, discarding stored credentials: {detail}");
        supervisor.disconnect().await;
        self.evict_locked(session_id, supervisor, true).await;
    }
}

/// Wait for a restoring session to settle. A pairing request means the stored
/// credentials were rejected.
async fn restore_outcome(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> Result<(), String> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Ready) => return Ok(()),
            Ok(SessionEvent::Qr(_)) => {
                return Err("stored credentials were rejected, pairing requested".into());
            }
            Ok(SessionEvent::Closed { reason, permanent }) => {
                if permanent || reason.is_intentional() {
                    return Err(reason.to_string());
                }
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err("supervisor stopped".into()),
        }
    }
}

fn timeout_detail(timeout: std::time::Duration) -> String {
    format!("not open after {}s", timeout.as_secs())
}
