//! Edit leases.
//!
//! A lease is granted inside a single-record store transaction: the grant
//! succeeds iff no unexpired lease held by someone else exists. The winner
//! gets a [`LockHandle`] that owns the heartbeat task renewing the lease
//! every `lease_heartbeat`. Renewals are update-only writes, so a lease that
//! was released or force-released is never brought back by a late
//! heartbeat. The heartbeat also refuses to renew once its last confirmed
//! expiry has passed, because by then another client may already hold the
//! key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cowork_core::collaboration::collections;
use cowork_core::types::{Timestamp, UserId};
use cowork_core::{Clock, CollabEvent, CoreError, DocumentKey, Lease, Requester};
use cowork_db::{DocumentStore, Query, RecordPath, SetOptions, StoredRecord, TxnOp};
use cowork_events::{EventBus, Subscription, SubscriptionBridge};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admin::{AdminCredential, AdminPolicy};
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Local view of a lease held through a [`LockHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The heartbeat is running; `expires_at` is the last confirmed expiry.
    Held { expires_at: Timestamp },
    /// The heartbeat stopped without a release (renewal failure, local
    /// lapse, or administrative removal). Editing must stop.
    Lost,
    /// The lease was released, or superseded by a newer acquire of the same
    /// key by the same owner.
    Released,
}

impl LeaseStatus {
    pub fn is_held(&self) -> bool {
        matches!(self, LeaseStatus::Held { .. })
    }
}

/// Ownership of a granted lease and its heartbeat.
///
/// Dropping the handle stops the heartbeat; the lease then lapses on its own
/// after at most `lease_duration`. Call [`release`](Self::release) to free
/// the key immediately.
#[derive(Debug)]
pub struct LockHandle {
    manager: LockManager,
    lease: Lease,
    heartbeat_id: Uuid,
    cancel: CancellationToken,
    status: watch::Receiver<LeaseStatus>,
}

impl LockHandle {
    /// The lease as granted.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn key(&self) -> DocumentKey {
        self.lease.key()
    }

    pub fn status(&self) -> LeaseStatus {
        self.status.borrow().clone()
    }

    /// Wait until the lease is no longer held and return the final status.
    pub async fn wait_lost(&mut self) -> LeaseStatus {
        let settled = self
            .status
            .wait_for(|s| !s.is_held())
            .await
            .map(|s| s.clone())
            .ok();
        match settled {
            Some(status) => status,
            None => self.status.borrow().clone(),
        }
    }

    /// Stop the heartbeat and delete the lease.
    ///
    /// Returns `false` if the lease was no longer ours in the store.
    pub async fn release(self) -> CollabResult<bool> {
        self.manager.release(&self.lease.key(), &self.lease.owner_id).await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.manager.deregister(&self.lease.key(), self.heartbeat_id);
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Heartbeat {
    id: Uuid,
    owner_id: UserId,
    cancel: CancellationToken,
    status: Arc<watch::Sender<LeaseStatus>>,
    /// Held by the heartbeat for each renewal, and by release paths around
    /// their transaction, so the two never interleave.
    gate: Arc<AsyncMutex<()>>,
}

impl Heartbeat {
    fn stop(&self, status: LeaseStatus) {
        self.cancel.cancel();
        self.status.send_replace(status);
    }
}

/// Grants, renews and releases edit leases. Cheap to clone.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    bridge: SubscriptionBridge,
    bus: Arc<EventBus>,
    admin: Arc<dyn AdminPolicy>,
    config: Arc<CollabConfig>,
    heartbeats: Arc<Mutex<HashMap<DocumentKey, Heartbeat>>>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("clock", &self.clock)
            .field("admin", &self.admin)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        admin: Arc<dyn AdminPolicy>,
        config: Arc<CollabConfig>,
    ) -> Self {
        Self {
            bridge: SubscriptionBridge::new(Arc::clone(&store)),
            store,
            clock,
            bus,
            admin,
            config,
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Try to take the edit lease on `key`.
    ///
    /// Succeeds if the key is free, the existing lease has expired, or the
    /// requester already owns it (the lease is then refreshed). Otherwise
    /// fails with [`CollabError::Conflict`] naming the current holder.
    pub async fn acquire(&self, key: &DocumentKey, requester: &Requester) -> CollabResult<LockHandle> {
        key.validate()?;
        requester.check()?;

        let now = self.clock.now();
        let lease = Lease::grant(key, requester, now, self.config.lease_span());
        let proposed = serde_json::to_value(&lease)?;
        let path = RecordPath::lock(key);

        let decide = |current: Option<&Value>| match current.and_then(decode_lease) {
            Some(held) if held.is_live_at(now) && !held.is_owned_by(&requester.id) => TxnOp::Abort,
            _ => TxnOp::Put(proposed.clone()),
        };
        let outcome = self.store.transact(&path, &decide).await?;

        if outcome.op == TxnOp::Abort {
            let holder = outcome
                .previous
                .as_ref()
                .and_then(decode_lease)
                .ok_or_else(|| CoreError::Validation(format!("unreadable lease at {path}")))?;
            tracing::info!(
                user_id = %requester.id,
                holder_user_id = %holder.owner_id,
                document_type = %key.document_type,
                document_id = %key.document_id,
                expires_at = %holder.expires_at,
                "Lock denied"
            );
            self.bus.publish(CollabEvent::LockDenied {
                document_type: key.document_type,
                document_id: key.document_id.clone(),
                requester_id: requester.id.clone(),
                holder_user_id: holder.owner_id.clone(),
                expires_at: holder.expires_at,
            });
            return Err(CollabError::Conflict {
                holder: Box::new(holder),
            });
        }

        tracing::info!(
            user_id = %requester.id,
            document_type = %key.document_type,
            document_id = %key.document_id,
            expires_at = %lease.expires_at,
            "Lock acquired"
        );
        self.bus.publish(CollabEvent::LockAcquired {
            document_type: key.document_type,
            document_id: key.document_id.clone(),
            user_id: requester.id.clone(),
            expires_at: lease.expires_at,
        });

        Ok(self.start_heartbeat(lease))
    }

    /// Delete the lease on `key` if `requester_id` owns it.
    ///
    /// Any local heartbeat for that owner stops once the store has answered.
    /// Returns `false` when there was nothing of ours to release; that is not
    /// an error. On a store error the lease and its heartbeat are untouched.
    pub async fn release(&self, key: &DocumentKey, requester_id: &str) -> CollabResult<bool> {
        key.validate()?;
        let gate = self.renewal_gate(key, Some(requester_id));
        let _paused = match &gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let decide = |current: Option<&Value>| match current.and_then(decode_lease) {
            Some(held) if held.is_owned_by(requester_id) => TxnOp::Delete,
            _ => TxnOp::Abort,
        };
        let outcome = self.store.transact(&RecordPath::lock(key), &decide).await?;
        self.stop_heartbeat(key, Some(requester_id), LeaseStatus::Released);

        if outcome.op != TxnOp::Delete {
            tracing::debug!(
                user_id = %requester_id,
                document_type = %key.document_type,
                document_id = %key.document_id,
                "Release ignored: lease not held by requester"
            );
            return Ok(false);
        }

        tracing::info!(
            user_id = %requester_id,
            document_type = %key.document_type,
            document_id = %key.document_id,
            "Lock released"
        );
        self.bus.publish(CollabEvent::LockReleased {
            document_type: key.document_type,
            document_id: key.document_id.clone(),
            user_id: requester_id.to_string(),
        });
        Ok(true)
    }

    /// The live lease on `key`, if any.
    pub async fn current(&self, key: &DocumentKey) -> CollabResult<Option<Lease>> {
        key.validate()?;
        let now = self.clock.now();
        let lease = self
            .store
            .get(&RecordPath::lock(key))
            .await?
            .as_ref()
            .and_then(decode_lease)
            .filter(|lease| lease.is_live_at(now));
        Ok(lease)
    }

    /// Observe the live lease on `key`.
    ///
    /// `on_change` receives `None` when the key is free or its lease has
    /// expired, and `Some(lease)` otherwise. Expiry is noticed within
    /// `subscription_recheck` even if nothing is written to the store.
    pub fn subscribe<F>(&self, key: &DocumentKey, on_change: F) -> CollabResult<Subscription>
    where
        F: Fn(Option<Lease>) + Send + 'static,
    {
        key.validate()?;
        let clock = Arc::clone(&self.clock);
        Ok(self.bridge.subscribe_derived(
            Query::for_document(collections::LOCKS, key),
            self.config.subscription_recheck,
            move |records| live_lease(records, clock.now()),
            on_change,
        ))
    }

    /// Remove the lease on `key` regardless of owner.
    ///
    /// Requires a credential accepted by the configured [`AdminPolicy`].
    /// Returns the removed lease, if there was one.
    pub async fn force_release(
        &self,
        key: &DocumentKey,
        credential: &AdminCredential,
    ) -> CollabResult<Option<Lease>> {
        key.validate()?;
        if !self.admin.may_force_release(credential) {
            tracing::warn!(
                admin_id = %credential.admin_id,
                document_type = %key.document_type,
                document_id = %key.document_id,
                "Force release refused"
            );
            return Err(CoreError::Forbidden(format!(
                "{} may not force-release locks",
                credential.admin_id
            ))
            .into());
        }

        let gate = self.renewal_gate(key, None);
        let _paused = match &gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let decide = |current: Option<&Value>| match current {
            Some(_) => TxnOp::Delete,
            None => TxnOp::Abort,
        };
        let outcome = self.store.transact(&RecordPath::lock(key), &decide).await?;
        let previous = outcome.previous.as_ref().and_then(decode_lease);

        if let Some(lease) = &previous {
            self.stop_heartbeat(key, Some(&lease.owner_id), LeaseStatus::Lost);
        }

        tracing::warn!(
            admin_id = %credential.admin_id,
            previous_owner_id = previous.as_ref().map(|l| l.owner_id.as_str()),
            reason = credential.reason.as_deref(),
            document_type = %key.document_type,
            document_id = %key.document_id,
            "Lock force-released"
        );
        self.bus.publish(CollabEvent::LockForceReleased {
            document_type: key.document_type,
            document_id: key.document_id.clone(),
            admin_id: credential.admin_id.clone(),
            previous_owner_id: previous.as_ref().map(|l| l.owner_id.clone()),
        });
        Ok(previous)
    }

    // -----------------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------------

    fn registry(&self) -> MutexGuard<'_, HashMap<DocumentKey, Heartbeat>> {
        self.heartbeats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Renewal gate of the local heartbeat on `key`, if it belongs to
    /// `owner_id` (or to anyone when `owner_id` is `None`).
    fn renewal_gate(&self, key: &DocumentKey, owner_id: Option<&str>) -> Option<Arc<AsyncMutex<()>>> {
        self.registry()
            .get(key)
            .filter(|hb| owner_id.map_or(true, |owner| hb.owner_id == owner))
            .map(|hb| Arc::clone(&hb.gate))
    }

    /// Number of heartbeats currently running in this manager.
    pub fn active_heartbeats(&self) -> usize {
        self.registry().len()
    }

    fn start_heartbeat(&self, lease: Lease) -> LockHandle {
        let key = lease.key();
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(LeaseStatus::Held {
            expires_at: lease.expires_at,
        });
        let heartbeat = Heartbeat {
            id,
            owner_id: lease.owner_id.clone(),
            cancel: cancel.clone(),
            status: Arc::new(status_tx),
            gate: Arc::new(AsyncMutex::new(())),
        };

        let previous = self.registry().insert(key.clone(), heartbeat.clone());
        if let Some(previous) = previous {
            // Same owner: the new grant supersedes the old one. Different
            // owner: the old lease expired before we took it.
            let status = if previous.owner_id == lease.owner_id {
                LeaseStatus::Released
            } else {
                LeaseStatus::Lost
            };
            previous.stop(status);
        }

        tokio::spawn(self.clone().run_heartbeat(key, lease.expires_at, heartbeat));

        LockHandle {
            manager: self.clone(),
            lease,
            heartbeat_id: id,
            cancel,
            status: status_rx,
        }
    }

    fn stop_heartbeat(&self, key: &DocumentKey, owner_id: Option<&str>, status: LeaseStatus) {
        let mut registry = self.registry();
        let owned = registry
            .get(key)
            .is_some_and(|hb| owner_id.map_or(true, |owner| hb.owner_id == owner));
        if owned {
            if let Some(heartbeat) = registry.remove(key) {
                heartbeat.stop(status);
            }
        }
    }

    fn deregister(&self, key: &DocumentKey, id: Uuid) {
        let mut registry = self.registry();
        if registry.get(key).is_some_and(|hb| hb.id == id) {
            registry.remove(key);
        }
    }

    async fn run_heartbeat(self, key: DocumentKey, mut expires_at: Timestamp, heartbeat: Heartbeat) {
        let Heartbeat {
            id,
            owner_id,
            cancel,
            status,
            gate,
        } = heartbeat;
        let path = RecordPath::lock(&key);
        let period = self.config.lease_heartbeat;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(user_id = %owner_id, %key, "Heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let _turn = gate.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            let now = self.clock.now();
            if now >= expires_at {
                tracing::warn!(
                    user_id = %owner_id,
                    %key,
                    expires_at = %expires_at,
                    "Lease lapsed before renewal"
                );
                break;
            }

            let renewal = Lease::renewal(now, self.config.lease_span());
            let result = match serde_json::to_value(&renewal) {
                Ok(patch) => self
                    .store
                    .set(&path, patch, SetOptions::update())
                    .await
                    .map_err(CollabError::from),
                Err(e) => Err(e.into()),
            };
            if cancel.is_cancelled() {
                return;
            }

            match result {
                Ok(()) => {
                    expires_at = renewal.expires_at;
                    status.send_replace(LeaseStatus::Held { expires_at });
                    tracing::debug!(user_id = %owner_id, %key, expires_at = %expires_at, "Lease renewed");
                }
                Err(e) => {
                    tracing::warn!(user_id = %owner_id, %key, error = %e, "Lease renewal failed");
                    break;
                }
            }
        }

        self.deregister(&key, id);
        status.send_replace(LeaseStatus::Lost);
        tracing::warn!(user_id = %owner_id, %key, "Lease lost; editing must stop");
        self.bus.publish(CollabEvent::LockLost {
            document_type: key.document_type,
            document_id: key.document_id.clone(),
            user_id: owner_id,
        });
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Decode a stored lease. Unreadable records count as no lease.
fn decode_lease(value: &Value) -> Option<Lease> {
    match Lease::deserialize(value) {
        Ok(lease) => Some(lease),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed lease record");
            None
        }
    }
}

fn live_lease(records: &[StoredRecord], now: Timestamp) -> Option<Lease> {
    records
        .iter()
        .filter_map(|record| decode_lease(&record.data))
        .find(|lease| lease.is_live_at(now))
}
