//! Caller-facing entry point.
//!
//! [`Coordinator`] binds one store, clock, event bus and configuration to a
//! [`LockManager`] and a [`PresenceTracker`], and exposes their operations
//! keyed by `(document_type, document_id)` the way UI code calls them.

use std::sync::Arc;

use cowork_core::{
    Clock, DocumentKey, DocumentType, Lease, PresenceAction, PresenceRecord, Requester, SystemClock,
};
use cowork_db::DocumentStore;
use cowork_events::{EventBus, Subscription};

use crate::admin::{AdminAllowList, AdminCredential, AdminPolicy};
use crate::config::CollabConfig;
use crate::error::CollabResult;
use crate::lifecycle::LifecycleController;
use crate::lock::{LockHandle, LockManager};
use crate::presence::PresenceTracker;

/// Builder for [`Coordinator`]. Defaults: [`SystemClock`], a fresh
/// [`EventBus`], and an [`AdminAllowList`] from `config.admin_ids`.
pub struct CoordinatorBuilder {
    store: Arc<dyn DocumentStore>,
    config: CollabConfig,
    clock: Option<Arc<dyn Clock>>,
    bus: Option<Arc<EventBus>>,
    admin: Option<Arc<dyn AdminPolicy>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CollabConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn admin_policy(mut self, admin: Arc<dyn AdminPolicy>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Validate the configuration and assemble the coordinator.
    pub fn build(self) -> CollabResult<Coordinator> {
        self.config.validate()?;

        let config = Arc::new(self.config);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let bus = self.bus.unwrap_or_default();
        let admin = self
            .admin
            .unwrap_or_else(|| Arc::new(AdminAllowList::new(config.admin_ids.iter().cloned())));

        let locks = LockManager::new(
            Arc::clone(&self.store),
            Arc::clone(&clock),
            Arc::clone(&bus),
            admin,
            Arc::clone(&config),
        );
        let presence = PresenceTracker::new(
            Arc::clone(&self.store),
            Arc::clone(&clock),
            Arc::clone(&bus),
            Arc::clone(&config),
        );

        tracing::debug!(
            lease_secs = config.lease_duration.as_secs(),
            heartbeat_secs = config.lease_heartbeat.as_secs(),
            presence_ttl_secs = config.presence_ttl.as_secs(),
            "Coordinator ready"
        );

        Ok(Coordinator {
            config,
            bus,
            locks,
            presence,
        })
    }
}

/// Lock and presence coordination over a shared store.
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: Arc<CollabConfig>,
    bus: Arc<EventBus>,
    locks: LockManager,
    presence: PresenceTracker,
}

impl Coordinator {
    pub fn builder(store: Arc<dyn DocumentStore>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            store,
            config: CollabConfig::default(),
            clock: None,
            bus: None,
            admin: None,
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// Bus carrying a [`CollabEvent`](cowork_core::CollabEvent) for every
    /// lock and presence transition made through this coordinator.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// A cleanup controller for one user's session.
    pub fn session(&self, user: Requester) -> LifecycleController {
        LifecycleController::new(self.locks.clone(), self.presence.clone(), user)
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    pub async fn acquire_lock(
        &self,
        document_type: DocumentType,
        document_id: &str,
        requester: &Requester,
    ) -> CollabResult<LockHandle> {
        self.locks
            .acquire(&DocumentKey::new(document_type, document_id), requester)
            .await
    }

    pub async fn release_lock(
        &self,
        document_type: DocumentType,
        document_id: &str,
        requester_id: &str,
    ) -> CollabResult<bool> {
        self.locks
            .release(&DocumentKey::new(document_type, document_id), requester_id)
            .await
    }

    pub async fn current_lock(
        &self,
        document_type: DocumentType,
        document_id: &str,
    ) -> CollabResult<Option<Lease>> {
        self.locks
            .current(&DocumentKey::new(document_type, document_id))
            .await
    }

    pub fn subscribe_lock<F>(
        &self,
        document_type: DocumentType,
        document_id: &str,
        on_change: F,
    ) -> CollabResult<Subscription>
    where
        F: Fn(Option<Lease>) + Send + 'static,
    {
        self.locks
            .subscribe(&DocumentKey::new(document_type, document_id), on_change)
    }

    pub async fn force_release(
        &self,
        document_type: DocumentType,
        document_id: &str,
        credential: &AdminCredential,
    ) -> CollabResult<Option<Lease>> {
        self.locks
            .force_release(&DocumentKey::new(document_type, document_id), credential)
            .await
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    pub async fn update_presence(
        &self,
        document_type: DocumentType,
        document_id: &str,
        user_id: &str,
        action: PresenceAction,
    ) -> CollabResult<PresenceRecord> {
        self.presence
            .publish(&DocumentKey::new(document_type, document_id), user_id, action)
            .await
    }

    pub async fn remove_presence(
        &self,
        document_type: DocumentType,
        document_id: &str,
        user_id: &str,
    ) -> CollabResult<()> {
        self.presence
            .unpublish(&DocumentKey::new(document_type, document_id), user_id)
            .await
    }

    pub fn subscribe_presence<F>(
        &self,
        document_type: DocumentType,
        document_id: &str,
        viewer_id: Option<&str>,
        on_change: F,
    ) -> CollabResult<Subscription>
    where
        F: Fn(Vec<PresenceRecord>) + Send + 'static,
    {
        self.presence.subscribe(
            &DocumentKey::new(document_type, document_id),
            viewer_id,
            on_change,
        )
    }
}
