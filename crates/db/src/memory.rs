//! In-process [`DocumentStore`] backend.
//!
//! Every operation takes the single record-map lock, so transactions are
//! trivially linearizable. Committed changes are announced on a
//! `tokio::sync::broadcast` channel that drives the change feeds.
//!
//! Fault injection ([`MemoryStore::set_offline`], [`MemoryStore::deny_reads`],
//! [`MemoryStore::deny_writes`]) lets tests exercise transient and permission
//! failures. Going offline also fails every open change feed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch, RwLock};

use crate::error::{StoreError, StoreResult};
use crate::store::{
    merge_fields, ChangeFeed, DocumentStore, Query, RecordPath, SetOptions, StoredRecord, TxnFn,
    TxnOp, TxnOutcome,
};

/// Capacity of the change-notice channel.
const CHANGE_CAPACITY: usize = 1024;

struct Inner {
    records: RwLock<BTreeMap<RecordPath, Value>>,
    changes: broadcast::Sender<RecordPath>,
    offline: watch::Sender<bool>,
    reads_denied: AtomicBool,
    writes_denied: AtomicBool,
}

impl Inner {
    async fn snapshot(&self, query: &Query) -> Vec<StoredRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|(path, data)| path.collection == query.collection && query.matches(data))
            .map(|(path, data)| StoredRecord {
                id: path.id.clone(),
                data: data.clone(),
            })
            .collect()
    }

    fn check_online(&self) -> StoreResult<()> {
        if *self.offline.borrow() {
            return Err(offline_error());
        }
        Ok(())
    }

    fn check_readable(&self, what: &str) -> StoreResult<()> {
        if self.reads_denied.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(format!("read of {what} denied")));
        }
        Ok(())
    }

    fn check_writable(&self, path: &RecordPath) -> StoreResult<()> {
        if self.writes_denied.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(format!("write to {path} denied")));
        }
        Ok(())
    }

    fn announce(&self, path: RecordPath) {
        // Ignore the SendError: it only means nobody is watching.
        let _ = self.changes.send(path);
    }
}

fn offline_error() -> StoreError {
    StoreError::Unavailable("memory store is offline".into())
}

/// Resolves once the store goes offline.
async fn gone_offline(offline: &mut watch::Receiver<bool>) {
    // The sender lives in `Inner`, which the caller keeps alive.
    let _ = offline.wait_for(|offline| *offline).await;
}

/// Shared, cloneable in-memory store. Clones share the same records.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                records: RwLock::new(BTreeMap::new()),
                changes,
                offline: watch::Sender::new(false),
                reads_denied: AtomicBool::new(false),
                writes_denied: AtomicBool::new(false),
            }),
        }
    }

    /// While offline, every call fails with [`StoreError::Unavailable`].
    /// Going offline ends every open change feed with that error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.send_replace(offline);
    }

    /// While denied, reads and new change feeds fail with
    /// [`StoreError::PermissionDenied`].
    pub fn deny_reads(&self, denied: bool) {
        self.inner.reads_denied.store(denied, Ordering::SeqCst);
    }

    /// While denied, every write fails with [`StoreError::PermissionDenied`].
    pub fn deny_writes(&self, denied: bool) {
        self.inner.writes_denied.store(denied, Ordering::SeqCst);
    }

    /// Number of records currently stored in `collection`.
    pub async fn count(&self, collection: &str) -> usize {
        self.inner
            .records
            .read()
            .await
            .keys()
            .filter(|path| path.collection == collection)
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &RecordPath) -> StoreResult<Option<Value>> {
        self.inner.check_online()?;
        self.inner.check_readable(&path.to_string())?;
        Ok(self.inner.records.read().await.get(path).cloned())
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<StoredRecord>> {
        self.inner.check_online()?;
        self.inner.check_readable(&query.collection)?;
        Ok(self.inner.snapshot(query).await)
    }

    async fn set(&self, path: &RecordPath, value: Value, options: SetOptions) -> StoreResult<()> {
        self.inner.check_online()?;
        self.inner.check_writable(path)?;
        {
            let mut records = self.inner.records.write().await;
            match records.get_mut(path) {
                Some(existing) if options.merge || options.must_exist => {
                    merge_fields(existing, value);
                }
                Some(existing) => *existing = value,
                None if options.must_exist => {
                    return Err(StoreError::NotFound(path.to_string()));
                }
                None => {
                    records.insert(path.clone(), value);
                }
            }
        }
        self.inner.announce(path.clone());
        Ok(())
    }

    async fn delete(&self, path: &RecordPath) -> StoreResult<()> {
        self.inner.check_online()?;
        self.inner.check_writable(path)?;
        let removed = self.inner.records.write().await.remove(path).is_some();
        if removed {
            self.inner.announce(path.clone());
        }
        Ok(())
    }

    async fn transact(&self, path: &RecordPath, decide: TxnFn<'_>) -> StoreResult<TxnOutcome> {
        self.inner.check_online()?;
        let (changed, outcome) = {
            let mut records = self.inner.records.write().await;
            let previous = records.get(path).cloned();
            let op = decide(previous.as_ref());
            let changed = match &op {
                TxnOp::Put(value) => {
                    self.inner.check_writable(path)?;
                    records.insert(path.clone(), value.clone());
                    true
                }
                TxnOp::Delete => {
                    self.inner.check_writable(path)?;
                    records.remove(path).is_some()
                }
                TxnOp::Abort => false,
            };
            (changed, TxnOutcome { previous, op })
        };
        if changed {
            self.inner.announce(path.clone());
        }
        Ok(outcome)
    }

    async fn watch(&self, query: Query) -> StoreResult<ChangeFeed> {
        self.inner.check_online()?;
        self.inner.check_readable(&query.collection)?;

        // Subscribe before taking the first snapshot so no change is missed.
        let mut changes = self.inner.changes.subscribe();
        let mut offline = self.inner.offline.subscribe();
        let initial = self.inner.snapshot(&query).await;
        let (tx, feed) = ChangeFeed::channel();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut last = initial;
            if tx.send(Ok(last.clone())).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = gone_offline(&mut offline) => {
                        let _ = tx.send(Err(offline_error())).await;
                        break;
                    }
                    change = changes.recv() => match change {
                        Ok(path) if path.collection != query.collection => continue,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }

                let snapshot = inner.snapshot(&query).await;
                if snapshot == last {
                    continue;
                }
                last = snapshot.clone();
                if tx.send(Ok(snapshot)).await.is_err() {
                    break;
                }
            }
        });

        Ok(feed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
