//! The [`DocumentStore`] trait and the value types it speaks.

use std::fmt;

use async_trait::async_trait;
use cowork_core::collaboration::collections;
use cowork_core::DocumentKey;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::StoreResult;

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Address of one record: a collection name plus a record id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordPath {
    pub collection: String,
    pub id: String,
}

impl RecordPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// The lease record for `key`.
    pub fn lock(key: &DocumentKey) -> Self {
        Self::new(collections::LOCKS, key.lock_record_id())
    }

    /// `user_id`'s presence record for `key`.
    pub fn presence(key: &DocumentKey, user_id: &str) -> Self {
        Self::new(collections::PRESENCE, key.presence_record_id(user_id))
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A record returned by a query or change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Equality filters over top-level fields of records in one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<(String, Value)>,
}

impl Query {
    /// Every record in `collection`.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
        }
    }

    /// Records in `collection` that belong to `key`.
    pub fn for_document(collection: impl Into<String>, key: &DocumentKey) -> Self {
        Self::collection(collection)
            .where_eq("document_type", key.document_type.as_str())
            .where_eq("document_id", key.document_id.as_str())
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// `true` if `data` satisfies every filter.
    pub fn matches(&self, data: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| data.get(field) == Some(expected))
    }

    /// The filters as a JSON object, for containment (`@>`) queries.
    pub fn filter_object(&self) -> Value {
        let map: Map<String, Value> = self.filters.iter().cloned().collect();
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// How [`DocumentStore::set`] treats an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetOptions {
    /// Merge top-level fields into the existing record instead of replacing it.
    pub merge: bool,
    /// Fail with [`StoreError::NotFound`](crate::StoreError::NotFound) if the
    /// record does not exist. Implies `merge`.
    pub must_exist: bool,
}

impl SetOptions {
    /// Replace the record, creating it if absent.
    pub fn overwrite() -> Self {
        Self::default()
    }

    /// Shallow-merge into the record, creating it if absent.
    pub fn merge() -> Self {
        Self {
            merge: true,
            must_exist: false,
        }
    }

    /// Shallow-merge into an existing record only.
    pub fn update() -> Self {
        Self {
            merge: true,
            must_exist: true,
        }
    }
}

/// Shallow merge: top-level fields of `patch` overwrite those of `target`.
/// Non-object values are replaced wholesale.
pub fn merge_fields(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (field, value) in patch {
                target.insert(field, value);
            }
        }
        (target, patch) => *target = patch,
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// What a transaction decided to do with the record it read.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOp {
    /// Replace the record with this value.
    Put(Value),
    /// Delete the record.
    Delete,
    /// Leave the record untouched.
    Abort,
}

/// Result of a committed (or aborted) transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnOutcome {
    /// The record as read inside the transaction.
    pub previous: Option<Value>,
    /// The operation that was applied.
    pub op: TxnOp,
}

/// Decision function run inside a transaction. Must be pure: backends may
/// call it more than once when they retry.
pub type TxnFn<'a> = &'a (dyn Fn(Option<&Value>) -> TxnOp + Send + Sync);

// ---------------------------------------------------------------------------
// Change feeds
// ---------------------------------------------------------------------------

/// Buffer size of a change feed channel.
pub const FEED_CAPACITY: usize = 64;

/// Receiving end of a [`DocumentStore::watch`] call.
///
/// Yields the current snapshot first, then a fresh snapshot after every
/// committed change that could affect the query. Dropping the feed tells the
/// backend to stop.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::Receiver<StoreResult<Vec<StoredRecord>>>,
}

impl ChangeFeed {
    /// Create a feed and the sender a backend pushes into.
    pub fn channel() -> (mpsc::Sender<StoreResult<Vec<StoredRecord>>>, Self) {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        (tx, Self { rx })
    }

    /// Wait for the next snapshot. `None` once the backend has stopped.
    pub async fn next(&mut self) -> Option<StoreResult<Vec<StoredRecord>>> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// A shared, transactional record store with change notification.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &RecordPath) -> StoreResult<Option<Value>>;

    /// One-shot read of every record matching `query`, ordered by id.
    async fn query(&self, query: &Query) -> StoreResult<Vec<StoredRecord>>;

    /// Unconditional upsert according to `options`.
    async fn set(&self, path: &RecordPath, value: Value, options: SetOptions) -> StoreResult<()>;

    /// Unconditional delete. Deleting an absent record succeeds.
    async fn delete(&self, path: &RecordPath) -> StoreResult<()>;

    /// Atomically read the record at `path`, let `decide` choose an
    /// operation, and apply it. No other write to `path` can interleave.
    async fn transact(&self, path: &RecordPath, decide: TxnFn<'_>) -> StoreResult<TxnOutcome>;

    /// Subscribe to snapshots of the records matching `query`.
    async fn watch(&self, query: Query) -> StoreResult<ChangeFeed>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_query_matches_all_filters() {
        let key = DocumentKey::project("p1");
        let query = Query::for_document(collections::LOCKS, &key);

        assert!(query.matches(&json!({"document_type": "project", "document_id": "p1", "x": 1})));
        assert!(!query.matches(&json!({"document_type": "project", "document_id": "p2"})));
        assert!(!query.matches(&json!({"document_id": "p1"})));
        assert_eq!(
            query.filter_object(),
            json!({"document_type": "project", "document_id": "p1"})
        );
    }

    #[test]
    fn test_merge_fields_is_shallow() {
        let mut target = json!({"a": 1, "b": {"c": 2}});
        merge_fields(&mut target, json!({"b": {"d": 3}, "e": 4}));
        assert_eq!(target, json!({"a": 1, "b": {"d": 3}, "e": 4}));
    }

    #[test]
    fn test_merge_fields_replaces_non_objects() {
        let mut target = json!("old");
        merge_fields(&mut target, json!({"a": 1}));
        assert_eq!(target, json!({"a": 1}));
    }

    #[test]
    fn test_record_paths() {
        let key = DocumentKey::milestone("m1");
        assert_eq!(RecordPath::lock(&key).to_string(), "locks/milestone:m1");
        assert_eq!(
            RecordPath::presence(&key, "bob").to_string(),
            "presence/bob:milestone:m1"
        );
    }
}
