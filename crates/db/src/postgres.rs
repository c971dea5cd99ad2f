//! PostgreSQL [`DocumentStore`] backend.
//!
//! Records live in the `documents` table keyed by `(collection, id)` with a
//! JSONB body. Transactions serialize on a transaction-scoped advisory lock
//! derived from the record path, then read the row `FOR UPDATE`; the advisory
//! lock also covers the case where the row does not exist yet.
//!
//! Change feeds are fed by a row trigger that sends `NOTIFY document_changes`
//! (see `migrations/`). A store and its clones share a single `LISTEN`
//! connection, opened by the first [`DocumentStore::watch`]; each feed then
//! re-queries on notices for its collection. A lost listener connection is
//! reopened with backoff and every feed re-queries once it is back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::AbortHandle;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    ChangeFeed, DocumentStore, Query, RecordPath, SetOptions, StoredRecord, TxnFn, TxnOp,
    TxnOutcome,
};

/// NOTIFY channel written by the `trg_documents_notify` trigger.
pub const CHANGE_CHANNEL: &str = "document_changes";

/// Buffer of the in-process notice fan-out.
const NOTICE_CAPACITY: usize = 1024;

const LISTEN_RETRY_INITIAL: Duration = Duration::from_millis(250);
const LISTEN_RETRY_MAX: Duration = Duration::from_secs(10);

/// [`DocumentStore`] over a shared PostgreSQL database.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    hub: Arc<ChangeHub>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            hub: Arc::new(ChangeHub {
                pool: pool.clone(),
                relay: OnceCell::new(),
            }),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch(pool: &PgPool, query: &Query) -> StoreResult<Vec<StoredRecord>> {
        let rows = sqlx::query_as::<_, (String, Value)>(
            "SELECT id, data FROM documents \
             WHERE collection = $1 AND data @> $2 \
             ORDER BY id",
        )
        .bind(&query.collection)
        .bind(query.filter_object())
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, data)| StoredRecord { id, data })
            .collect())
    }
}

/// Split a NOTIFY payload of the form `collection/id`.
fn payload_collection(payload: &str) -> Option<&str> {
    payload.split_once('/').map(|(collection, _)| collection)
}

// ---------------------------------------------------------------------------
// Shared change listener
// ---------------------------------------------------------------------------

/// What the shared listener tells the feeds.
#[derive(Debug, Clone, PartialEq)]
enum ChangeNotice {
    /// A row in this collection changed.
    Changed(String),
    /// Notifications may have been missed; every feed should re-query.
    Resync,
}

/// The single `LISTEN` connection behind all feeds of one store.
struct ChangeHub {
    pool: PgPool,
    relay: OnceCell<Relay>,
}

struct Relay {
    notices: broadcast::Sender<ChangeNotice>,
    task: AbortHandle,
}

impl ChangeHub {
    /// Receiver of every notice from now on. Starts the listener on first
    /// use.
    async fn subscribe(&self) -> StoreResult<broadcast::Receiver<ChangeNotice>> {
        let relay = self
            .relay
            .get_or_try_init(|| async {
                let listener = listen(&self.pool).await?;
                let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
                let task = tokio::spawn(relay_notifications(
                    self.pool.clone(),
                    listener,
                    notices.clone(),
                ))
                .abort_handle();
                tracing::info!(channel = CHANGE_CHANNEL, "Change listener started");
                Ok::<_, StoreError>(Relay { notices, task })
            })
            .await?;
        Ok(relay.notices.subscribe())
    }
}

impl Drop for ChangeHub {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.get() {
            relay.task.abort();
        }
    }
}

async fn listen(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    Ok(listener)
}

/// Forward notifications to the feeds until aborted.
async fn relay_notifications(
    pool: PgPool,
    mut listener: PgListener,
    notices: broadcast::Sender<ChangeNotice>,
) {
    loop {
        match listener.try_recv().await {
            Ok(Some(notification)) => {
                if let Some(collection) = payload_collection(notification.payload()) {
                    let _ = notices.send(ChangeNotice::Changed(collection.to_string()));
                }
                continue;
            }
            Ok(None) => tracing::warn!("Change listener connection lost"),
            Err(e) => tracing::warn!(error = %e, "Change listener failed"),
        }

        drop(listener);
        listener = reconnect(&pool).await;
        // Anything committed while disconnected was not notified.
        let _ = notices.send(ChangeNotice::Resync);
    }
}

async fn reconnect(pool: &PgPool) -> PgListener {
    let mut backoff = LISTEN_RETRY_INITIAL;
    loop {
        match listen(pool).await {
            Ok(listener) => {
                tracing::info!(channel = CHANGE_CHANNEL, "Change listener reconnected");
                return listener;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Change listener reconnect failed"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(LISTEN_RETRY_MAX);
            }
        }
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, path: &RecordPath) -> StoreResult<Option<Value>> {
        let data = sqlx::query_scalar::<_, Value>(
            "SELECT data FROM documents WHERE collection = $1 AND id = $2",
        )
        .bind(&path.collection)
        .bind(&path.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(data)
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<StoredRecord>> {
        Self::fetch(&self.pool, query).await
    }

    async fn set(&self, path: &RecordPath, value: Value, options: SetOptions) -> StoreResult<()> {
        if options.must_exist {
            let result = sqlx::query(
                "UPDATE documents SET data = data || $3, updated_at = NOW() \
                 WHERE collection = $1 AND id = $2",
            )
            .bind(&path.collection)
            .bind(&path.id)
            .bind(value)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(path.to_string()));
            }
            return Ok(());
        }

        let sql = if options.merge {
            "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3) \
             ON CONFLICT (collection, id) \
             DO UPDATE SET data = documents.data || EXCLUDED.data, updated_at = NOW()"
        } else {
            "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3) \
             ON CONFLICT (collection, id) \
             DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()"
        };
        sqlx::query(sql)
            .bind(&path.collection)
            .bind(&path.id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &RecordPath) -> StoreResult<()> {
        sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(&path.collection)
            .bind(&path.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn transact(&self, path: &RecordPath, decide: TxnFn<'_>) -> StoreResult<TxnOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(path.to_string())
            .execute(&mut *tx)
            .await?;

        let previous = sqlx::query_scalar::<_, Value>(
            "SELECT data FROM documents WHERE collection = $1 AND id = $2 FOR UPDATE",
        )
        .bind(&path.collection)
        .bind(&path.id)
        .fetch_optional(&mut *tx)
        .await?;

        let op = decide(previous.as_ref());
        match &op {
            TxnOp::Put(value) => {
                sqlx::query(
                    "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3) \
                     ON CONFLICT (collection, id) \
                     DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()",
                )
                .bind(&path.collection)
                .bind(&path.id)
                .bind(value)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
            }
            TxnOp::Delete => {
                sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                    .bind(&path.collection)
                    .bind(&path.id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
            TxnOp::Abort => tx.rollback().await?,
        }

        Ok(TxnOutcome { previous, op })
    }

    /// Feeds share the store's listener connection; a feed costs a pool
    /// connection only while it re-queries. A failed re-query is sent down
    /// the feed and ends it.
    async fn watch(&self, query: Query) -> StoreResult<ChangeFeed> {
        // Subscribe before the first fetch so no change is missed.
        let mut notices = self.hub.subscribe().await?;
        let initial = Self::fetch(&self.pool, &query).await?;
        let (tx, feed) = ChangeFeed::channel();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let mut last = initial;
            if tx.send(Ok(last.clone())).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    notice = notices.recv() => match notice {
                        Ok(ChangeNotice::Changed(collection)) if collection != query.collection => continue,
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            tracing::debug!(missed, collection = %query.collection, "Change feed lagged, re-querying");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }

                match Self::fetch(&pool, &query).await {
                    Ok(snapshot) if snapshot == last => continue,
                    Ok(snapshot) => {
                        last = snapshot.clone();
                        if tx.send(Ok(snapshot)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, collection = %query.collection, "Change feed re-query failed");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Ok(feed)
    }
}
