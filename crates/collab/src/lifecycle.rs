//! Proactive cleanup for one client session.
//!
//! The session tracks which leases and presence records it holds and lets
//! them go early when the client is known to be leaving. Everything here is
//! an optimization: if a release never lands, lease expiry and presence TTL
//! still free the document.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cowork_core::{DocumentKey, Lease, PresenceAction, Requester};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CollabResult;
use crate::lock::{LeaseStatus, LockHandle, LockManager};
use crate::presence::PresenceTracker;

/// How long [`LifecycleController::watch_termination`] waits for dispatched
/// releases before returning.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// Client conditions that trigger cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSignal {
    /// The user switched away. Presence goes; leases stay.
    Hidden,
    /// The user came back. Presence removed on `Hidden` is published again.
    Visible,
    /// The process is about to exit. Everything goes.
    Terminating,
}

#[derive(Debug, Default)]
struct Session {
    leases: HashMap<DocumentKey, LockHandle>,
    presence: HashMap<DocumentKey, PresenceAction>,
    hidden: bool,
}

/// Cleanup controller for one user's session.
#[derive(Debug)]
pub struct LifecycleController {
    locks: LockManager,
    presence: PresenceTracker,
    user: Requester,
    session: Mutex<Session>,
}

impl LifecycleController {
    pub fn new(locks: LockManager, presence: PresenceTracker, user: Requester) -> Self {
        Self {
            locks,
            presence,
            user,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn user(&self) -> &Requester {
        &self.user
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the edit lease on `key` and announce `editing` presence.
    ///
    /// Fails only if the lease cannot be acquired; a presence failure is
    /// logged and the refresh timer keeps retrying.
    pub async fn open_for_edit(&self, key: &DocumentKey) -> CollabResult<Lease> {
        let handle = self.locks.acquire(key, &self.user).await?;
        let lease = handle.lease().clone();
        self.session().leases.insert(key.clone(), handle);
        self.announce(key, PresenceAction::Editing).await;
        Ok(lease)
    }

    /// Announce `viewing` presence on `key`.
    pub async fn open_for_view(&self, key: &DocumentKey) -> CollabResult<()> {
        key.validate()?;
        self.announce(key, PresenceAction::Viewing).await;
        Ok(())
    }

    async fn announce(&self, key: &DocumentKey, action: PresenceAction) {
        self.session().presence.insert(key.clone(), action);
        if let Err(e) = self.presence.publish(key, &self.user.id, action).await {
            tracing::warn!(user_id = %self.user.id, %key, error = %e, "Failed to publish presence");
        }
    }

    /// Local status of the session's lease on `key`.
    pub fn lease_status(&self, key: &DocumentKey) -> Option<LeaseStatus> {
        self.session().leases.get(key).map(LockHandle::status)
    }

    /// Keys the session currently tracks, leases or presence.
    pub fn open_documents(&self) -> Vec<DocumentKey> {
        let session = self.session();
        let mut keys: Vec<DocumentKey> = session
            .leases
            .keys()
            .chain(session.presence.keys())
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        keys.dedup();
        keys
    }

    /// Release the lease and presence on `key` and wait for both.
    ///
    /// Both are attempted even if one fails; the lease error wins.
    pub async fn close(&self, key: &DocumentKey) -> CollabResult<()> {
        let (handle, had_presence) = {
            let mut session = self.session();
            (
                session.leases.remove(key),
                session.presence.remove(key).is_some(),
            )
        };

        let released = match handle {
            Some(handle) => handle.release().await.map(|_| ()),
            None => Ok(()),
        };
        let unpublished = if had_presence {
            self.presence.unpublish(key, &self.user.id).await
        } else {
            Ok(())
        };

        tracing::info!(user_id = %self.user.id, %key, "Session closed document");
        released.and(unpublished)
    }

    /// [`close`](Self::close) every tracked key.
    pub async fn close_all(&self) -> CollabResult<()> {
        let mut first_error = None;
        for key in self.open_documents() {
            if let Err(e) = self.close(&key).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// React to a client condition without waiting for the store.
    ///
    /// Returns the spawned release tasks. Dropping them does not cancel the
    /// work.
    pub fn handle(&self, signal: ClientSignal) -> Vec<JoinHandle<()>> {
        tracing::debug!(user_id = %self.user.id, ?signal, "Client signal");
        match signal {
            ClientSignal::Hidden => {
                let keys: Vec<DocumentKey> = {
                    let mut session = self.session();
                    session.hidden = true;
                    session.presence.keys().cloned().collect()
                };
                keys.into_iter().map(|key| self.spawn_unpublish(key)).collect()
            }
            ClientSignal::Visible => {
                let entries: Vec<(DocumentKey, PresenceAction)> = {
                    let mut session = self.session();
                    if !std::mem::take(&mut session.hidden) {
                        return Vec::new();
                    }
                    session.presence.iter().map(|(k, a)| (k.clone(), *a)).collect()
                };
                entries
                    .into_iter()
                    .map(|(key, action)| {
                        let presence = self.presence.clone();
                        let user_id = self.user.id.clone();
                        tokio::spawn(async move {
                            if let Err(e) = presence.publish(&key, &user_id, action).await {
                                tracing::warn!(%user_id, %key, error = %e, "Failed to restore presence");
                            }
                        })
                    })
                    .collect()
            }
            ClientSignal::Terminating => {
                let (leases, keys) = {
                    let mut session = self.session();
                    let leases: Vec<LockHandle> = session.leases.drain().map(|(_, h)| h).collect();
                    let keys: Vec<DocumentKey> = session.presence.drain().map(|(k, _)| k).collect();
                    (leases, keys)
                };
                let mut tasks: Vec<JoinHandle<()>> = leases
                    .into_iter()
                    .map(|handle| {
                        let user_id = self.user.id.clone();
                        tokio::spawn(async move {
                            let key = handle.key();
                            if let Err(e) = handle.release().await {
                                tracing::warn!(%user_id, %key, error = %e, "Release on exit failed");
                            }
                        })
                    })
                    .collect();
                tasks.extend(keys.into_iter().map(|key| self.spawn_unpublish(key)));
                tasks
            }
        }
    }

    fn spawn_unpublish(&self, key: DocumentKey) -> JoinHandle<()> {
        let presence = self.presence.clone();
        let user_id = self.user.id.clone();
        tokio::spawn(async move {
            if let Err(e) = presence.unpublish(&key, &user_id).await {
                tracing::warn!(%user_id, %key, error = %e, "Presence removal failed");
            }
        })
    }

    /// Raise [`ClientSignal::Terminating`] on SIGINT/SIGTERM.
    ///
    /// The task ends without cleanup if `cancel` fires first. After a
    /// signal it waits up to [`TERMINATION_GRACE`] for the releases, so the
    /// host can await it before exiting.
    pub fn watch_termination(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = termination_signal() => {}
            }
            tracing::info!(user_id = %controller.user.id, "Termination signal received, releasing session");
            let tasks = controller.handle(ClientSignal::Terminating);
            let _ = tokio::time::timeout(TERMINATION_GRACE, wait_all(tasks)).await;
        })
    }
}

/// A session dropped without [`close_all`](LifecycleController::close_all)
/// behaves like a crashed client: heartbeats stop and its records lapse.
impl Drop for LifecycleController {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
        for key in session.presence.keys() {
            self.presence.abandon(key, &self.user.id);
        }
    }
}

async fn wait_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
///
/// A handler that cannot be installed is logged and never fires.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
