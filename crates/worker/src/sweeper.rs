//! Periodic removal of expired leases and stale presence records.
//!
//! Each candidate is deleted inside a store transaction that re-checks
//! expiry at commit time, so a lease renewed or re-acquired between the scan
//! and the delete survives.

use std::sync::Arc;
use std::time::Duration;

use cowork_core::collaboration::collections;
use cowork_core::{Clock, Lease, PresenceRecord};
use cowork_db::{DocumentStore, Query, RecordPath, StoreResult, TxnOp};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Records removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub leases_removed: usize,
    pub presence_removed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.leases_removed + self.presence_removed
    }
}

pub struct Sweeper {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    presence_ttl: chrono::Duration,
}

impl Sweeper {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, presence_ttl: chrono::Duration) -> Self {
        Self {
            store,
            clock,
            presence_ttl,
        }
    }

    /// Delete every lease and presence record that is dead right now.
    pub async fn sweep_once(&self) -> StoreResult<SweepReport> {
        let leases_removed = self
            .sweep_collection::<Lease, _>(collections::LOCKS, |lease, now| !lease.is_live_at(now))
            .await?;
        let ttl = self.presence_ttl;
        let presence_removed = self
            .sweep_collection::<PresenceRecord, _>(collections::PRESENCE, |record, now| {
                !record.is_live_at(now, ttl)
            })
            .await?;

        Ok(SweepReport {
            leases_removed,
            presence_removed,
        })
    }

    async fn sweep_collection<T, P>(&self, collection: &str, is_dead: P) -> StoreResult<usize>
    where
        T: DeserializeOwned,
        P: Fn(&T, cowork_core::types::Timestamp) -> bool + Send + Sync,
    {
        let records = self.store.query(&Query::collection(collection)).await?;
        let mut removed = 0;

        for record in records {
            let now = self.clock.now();
            let Ok(decoded) = serde_json::from_value::<T>(record.data) else {
                tracing::debug!(%collection, id = %record.id, "Skipping malformed record");
                continue;
            };
            if !is_dead(&decoded, now) {
                continue;
            }

            let decide = |current: Option<&Value>| {
                let still_dead = current
                    .and_then(|value| T::deserialize(value).ok())
                    .is_some_and(|value| is_dead(&value, now));
                if still_dead {
                    TxnOp::Delete
                } else {
                    TxnOp::Abort
                }
            };
            let path = RecordPath::new(collection, record.id);
            if self.store.transact(&path, &decide).await?.op == TxnOp::Delete {
                tracing::debug!(%path, "Swept dead record");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "Sweeper started");

        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.total() > 0 => {
                            tracing::info!(
                                leases_removed = report.leases_removed,
                                presence_removed = report.presence_removed,
                                "Sweeper: removed dead records"
                            );
                        }
                        Ok(_) => tracing::debug!("Sweeper: nothing to remove"),
                        Err(e) => tracing::error!(error = %e, "Sweeper: sweep failed"),
                    }
                }
            }
        }
    }
}
