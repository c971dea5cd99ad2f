//! Advisory presence.
//!
//! Each `(user, document)` pair has one record in the `presence` collection
//! whose `last_seen` is refreshed every `presence_heartbeat` while the user
//! stays on the document. Readers drop records older than `presence_ttl`,
//! so a client that vanished without cleanup disappears on its own.
//! Presence never blocks anything; failures are logged and retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Duration;
use cowork_core::collaboration::{collections, validate_id};
use cowork_core::types::Timestamp;
use cowork_core::{Clock, CollabEvent, DocumentKey, PresenceAction, PresenceRecord};
use cowork_db::{DocumentStore, Query, RecordPath, SetOptions, StoredRecord};
use cowork_events::{EventBus, Subscription, SubscriptionBridge};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::CollabConfig;
use crate::error::CollabResult;

/// Publishes and observes presence records. Cheap to clone.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    bridge: SubscriptionBridge,
    bus: Arc<EventBus>,
    config: Arc<CollabConfig>,
    refreshers: Arc<Mutex<HashMap<RecordPath, Refresher>>>,
}

struct Refresher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        config: Arc<CollabConfig>,
    ) -> Self {
        Self {
            bridge: SubscriptionBridge::new(Arc::clone(&store)),
            store,
            clock,
            bus,
            config,
            refreshers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Announce that `user_id` is on `key`, and keep announcing it.
    ///
    /// Publishing again for the same pair replaces the action and the
    /// refresh timer. If the first write fails its error is returned, but
    /// the refresh timer is running anyway and retries on every tick.
    pub async fn publish(
        &self,
        key: &DocumentKey,
        user_id: &str,
        action: PresenceAction,
    ) -> CollabResult<PresenceRecord> {
        key.validate()?;
        validate_id("user_id", user_id)?;

        self.stop_refresher(&RecordPath::presence(key, user_id)).await;
        let written = self.write(key, user_id, action).await;
        self.start_refresher(key.clone(), user_id.to_string(), action, written.is_ok());
        let record = written?;
        self.announce_join(key, user_id, action);
        Ok(record)
    }

    fn announce_join(&self, key: &DocumentKey, user_id: &str, action: PresenceAction) {
        tracing::debug!(
            user_id = %user_id,
            document_type = %key.document_type,
            document_id = %key.document_id,
            action = action.as_str(),
            "Presence published"
        );
        self.bus.publish(CollabEvent::PresenceJoin {
            document_type: key.document_type,
            document_id: key.document_id.clone(),
            user_id: user_id.to_string(),
            action,
        });
    }

    /// Stop refreshing and delete the record for `user_id` on `key`.
    pub async fn unpublish(&self, key: &DocumentKey, user_id: &str) -> CollabResult<()> {
        key.validate()?;
        validate_id("user_id", user_id)?;

        let path = RecordPath::presence(key, user_id);
        self.stop_refresher(&path).await;
        self.store.delete(&path).await?;

        tracing::debug!(
            user_id = %user_id,
            document_type = %key.document_type,
            document_id = %key.document_id,
            "Presence removed"
        );
        self.bus.publish(CollabEvent::PresenceLeave {
            document_type: key.document_type,
            document_id: key.document_id.clone(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    /// Live presence on `key`, most recent first, without `viewer_id`.
    pub async fn current(
        &self,
        key: &DocumentKey,
        viewer_id: Option<&str>,
    ) -> CollabResult<Vec<PresenceRecord>> {
        key.validate()?;
        let records = self
            .store
            .query(&Query::for_document(collections::PRESENCE, key))
            .await?;
        Ok(live_presence(
            &records,
            self.clock.now(),
            self.config.presence_span(),
            viewer_id,
        ))
    }

    /// Observe live presence on `key`, excluding `viewer_id`.
    ///
    /// Stale records drop out within `subscription_recheck` even when
    /// nothing is written to the store.
    pub fn subscribe<F>(
        &self,
        key: &DocumentKey,
        viewer_id: Option<&str>,
        on_change: F,
    ) -> CollabResult<Subscription>
    where
        F: Fn(Vec<PresenceRecord>) + Send + 'static,
    {
        key.validate()?;
        let clock = Arc::clone(&self.clock);
        let ttl = self.config.presence_span();
        let viewer = viewer_id.map(str::to_string);
        Ok(self.bridge.subscribe_derived(
            Query::for_document(collections::PRESENCE, key),
            self.config.subscription_recheck,
            move |records| live_presence(records, clock.now(), ttl, viewer.as_deref()),
            on_change,
        ))
    }

    /// `true` while a refresh timer runs for `user_id` on `key`.
    pub fn is_publishing(&self, key: &DocumentKey, user_id: &str) -> bool {
        self.refreshers().contains_key(&RecordPath::presence(key, user_id))
    }

    // -----------------------------------------------------------------------
    // Refresh timers
    // -----------------------------------------------------------------------

    /// Stop refreshing without deleting the record; it goes stale after
    /// `presence_ttl`. Used when a session is dropped without cleanup.
    pub fn abandon(&self, key: &DocumentKey, user_id: &str) {
        if let Some(refresher) = self.refreshers().remove(&RecordPath::presence(key, user_id)) {
            refresher.cancel.cancel();
        }
    }

    fn refreshers(&self) -> MutexGuard<'_, HashMap<RecordPath, Refresher>> {
        self.refreshers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write(
        &self,
        key: &DocumentKey,
        user_id: &str,
        action: PresenceAction,
    ) -> CollabResult<PresenceRecord> {
        let record = PresenceRecord::new(key, user_id, action, self.clock.now());
        self.store
            .set(
                &RecordPath::presence(key, user_id),
                serde_json::to_value(&record)?,
                SetOptions::overwrite(),
            )
            .await?;
        Ok(record)
    }

    /// Rewrite the record every `presence_heartbeat`. When `announced` is
    /// false the join event goes out with the first successful write.
    fn start_refresher(
        &self,
        key: DocumentKey,
        user_id: String,
        action: PresenceAction,
        mut announced: bool,
    ) {
        let path = RecordPath::presence(&key, &user_id);
        let cancel = CancellationToken::new();
        let tracker = self.clone();
        let period = self.config.presence_heartbeat;
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match tracker.write(&key, &user_id, action).await {
                    Ok(_) if !announced => {
                        announced = true;
                        tracker.announce_join(&key, &user_id, action);
                    }
                    Ok(_) => tracing::trace!(user_id = %user_id, %key, "Presence refreshed"),
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, %key, error = %e, "Presence refresh failed")
                    }
                }
            }
        });

        if let Some(previous) = self.refreshers().insert(path, Refresher { cancel, task }) {
            previous.cancel.cancel();
        }
    }

    /// Cancel the refresher for `path` and wait for any in-flight write, so
    /// a later delete cannot be overtaken by a refresh.
    async fn stop_refresher(&self, path: &RecordPath) {
        let refresher = self.refreshers().remove(path);
        if let Some(refresher) = refresher {
            refresher.cancel.cancel();
            let _ = refresher.task.await;
        }
    }
}

/// Decode, drop stale and excluded records, and order by `last_seen`
/// descending, then `user_id`.
fn live_presence(
    records: &[StoredRecord],
    now: Timestamp,
    ttl: Duration,
    exclude: Option<&str>,
) -> Vec<PresenceRecord> {
    let mut live: Vec<PresenceRecord> = records
        .iter()
        .filter_map(|record| match PresenceRecord::deserialize(&record.data) {
            Ok(presence) => Some(presence),
            Err(e) => {
                tracing::warn!(id = %record.id, error = %e, "Ignoring malformed presence record");
                None
            }
        })
        .filter(|presence| presence.is_live_at(now, ttl))
        .filter(|presence| exclude != Some(presence.user_id.as_str()))
        .collect();
    live.sort_by(|a, b| {
        b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    live
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn record(user: &str, seen: Timestamp) -> StoredRecord {
        let key = DocumentKey::project("p1");
        let presence = PresenceRecord::new(&key, user, PresenceAction::Viewing, seen);
        StoredRecord {
            id: key.presence_record_id(user),
            data: serde_json::to_value(&presence).unwrap(),
        }
    }

    #[test]
    fn test_live_presence_filters_and_orders() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let now = t0 + Duration::seconds(40);
        let records = vec![
            record("stale", t0),
            record("bob", t0 + Duration::seconds(30)),
            record("alice", t0 + Duration::seconds(30)),
            record("carol", t0 + Duration::seconds(35)),
            record("viewer", t0 + Duration::seconds(39)),
        ];

        let users: Vec<String> = live_presence(&records, now, Duration::seconds(30), Some("viewer"))
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(users, vec!["carol", "alice", "bob"]);
    }

    #[test]
    fn test_record_at_exact_ttl_is_stale() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let records = vec![record("alice", t0)];
        assert!(live_presence(&records, t0 + Duration::seconds(30), Duration::seconds(30), None).is_empty());
        assert_eq!(
            live_presence(&records, t0 + Duration::seconds(29), Duration::seconds(30), None).len(),
            1
        );
    }
}
