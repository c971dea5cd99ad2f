//! Subscription bridge over [`DocumentStore::watch`].
//!
//! A store change feed is a raw channel of snapshots. The bridge wraps it in
//! a spawned delivery task and hands the caller a [`Subscription`] handle
//! whose [`unsubscribe`](Subscription::unsubscribe) stops delivery. Callers
//! can consume snapshots through a callback, a [`SnapshotStream`], or the
//! derived form that maps each snapshot to a typed value and re-evaluates it
//! on a timer.
//!
//! Every subscription owns its own feed, so independent subscriptions to the
//! same key never interfere. A feed that fails with a transient error is
//! reopened with exponential backoff; derived values keep re-evaluating
//! against the last snapshot meanwhile. Any other store error ends the
//! subscription: [`Subscription::is_active`] turns `false` and
//! [`Subscription::failure`] holds the error.

use std::future::{self, Future};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use cowork_db::store::FEED_CAPACITY;
use cowork_db::{ChangeFeed, DocumentStore, Query, StoreError, StoredRecord};
use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Delay before the first attempt to reopen a failed feed.
const RETRY_INITIAL: Duration = Duration::from_millis(100);

/// Upper bound for the reopen delay.
const RETRY_MAX: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

/// Handle to a running subscription.
///
/// Call [`unsubscribe`](Self::unsubscribe) exactly once when the consumer is
/// done; repeated calls are harmless. Dropping the handle also stops
/// delivery.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    cancel: CancellationToken,
    failure: Arc<OnceLock<StoreError>>,
}

impl Subscription {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            failure: Arc::new(OnceLock::new()),
        }
    }

    fn delivery(&self) -> Delivery {
        Delivery {
            id: self.id,
            cancel: self.cancel.clone(),
            failure: Arc::clone(&self.failure),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop delivery. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(subscription_id = %self.id, "Unsubscribed");
            self.cancel.cancel();
        }
    }

    /// `false` once unsubscribed or dropped, and once delivery has stopped
    /// on its own.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// The store error that ended delivery, if one did.
    pub fn failure(&self) -> Option<&StoreError> {
        self.failure.get()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Task-side half of a [`Subscription`]. Dropping it marks the
/// subscription inactive.
struct Delivery {
    id: Uuid,
    cancel: CancellationToken,
    failure: Arc<OnceLock<StoreError>>,
}

impl Delivery {
    fn fail(&self, error: StoreError) {
        tracing::warn!(subscription_id = %self.id, error = %error, "Subscription ended by store error");
        let _ = self.failure.set(error);
        self.cancel.cancel();
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Stream form
// ---------------------------------------------------------------------------

/// Snapshots of a query as a [`Stream`].
///
/// Bounded: while the consumer is behind, delivery waits and the store feed
/// buffers at most [`FEED_CAPACITY`] snapshots of its own. Ends when the
/// subscription stops. Dropping the stream unsubscribes.
#[derive(Debug)]
pub struct SnapshotStream {
    rx: mpsc::Receiver<Vec<StoredRecord>>,
    subscription: Subscription,
}

impl SnapshotStream {
    pub async fn next_snapshot(&mut self) -> Option<Vec<StoredRecord>> {
        self.rx.recv().await
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Stream for SnapshotStream {
    type Item = Vec<StoredRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Shared entry point for store subscriptions. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionBridge {
    store: Arc<dyn DocumentStore>,
}

impl SubscriptionBridge {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Deliver every snapshot of `query` to `on_snapshot`.
    ///
    /// Registration is immediate; the first snapshot arrives asynchronously.
    pub fn subscribe<F>(&self, query: Query, on_snapshot: F) -> Subscription
    where
        F: Fn(Vec<StoredRecord>) + Send + 'static,
    {
        let subscription = Subscription::new();
        let delivery = subscription.delivery();
        let feed = ReopeningFeed::new(Arc::clone(&self.store), query, subscription.id);

        tokio::spawn(async move {
            pump(feed, &delivery, move |snapshot| {
                on_snapshot(snapshot);
                future::ready(true)
            })
            .await;
            tracing::debug!(subscription_id = %delivery.id, "Subscription delivery stopped");
        });

        subscription
    }

    /// Snapshots of `query` as a stream.
    pub fn stream(&self, query: Query) -> SnapshotStream {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let subscription = Subscription::new();
        let delivery = subscription.delivery();
        let feed = ReopeningFeed::new(Arc::clone(&self.store), query, subscription.id);

        tokio::spawn(async move {
            pump(feed, &delivery, move |snapshot| {
                let tx = tx.clone();
                async move { tx.send(snapshot).await.is_ok() }
            })
            .await;
            tracing::debug!(subscription_id = %delivery.id, "Stream delivery stopped");
        });

        SnapshotStream { rx, subscription }
    }

    /// Deliver `derive(snapshot)` to `on_change` whenever it changes.
    ///
    /// The value is re-derived on every snapshot and additionally every
    /// `recheck_every`, against the most recent snapshot. Time-dependent
    /// derivations (expiry, staleness) therefore change without any write to
    /// the store, including while the feed is being reopened. Consecutive
    /// equal values are delivered once.
    pub fn subscribe_derived<T, D, F>(
        &self,
        query: Query,
        recheck_every: Duration,
        derive: D,
        on_change: F,
    ) -> Subscription
    where
        T: PartialEq + Clone + Send + 'static,
        D: Fn(&[StoredRecord]) -> T + Send + 'static,
        F: Fn(T) + Send + 'static,
    {
        let subscription = Subscription::new();
        let delivery = subscription.delivery();
        let mut feed = ReopeningFeed::new(Arc::clone(&self.store), query, subscription.id);

        tokio::spawn(async move {
            let mut recheck = tokio::time::interval(recheck_every);
            recheck.set_missed_tick_behavior(MissedTickBehavior::Skip);
            recheck.tick().await;

            let mut records: Option<Vec<StoredRecord>> = None;
            let mut last: Option<T> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = delivery.cancel.cancelled() => break,
                    next = feed.next() => match next {
                        Ok(snapshot) => records = Some(snapshot),
                        Err(e) => {
                            delivery.fail(e);
                            break;
                        }
                    },
                    _ = recheck.tick() => {}
                }

                // Nothing to evaluate until the first snapshot lands.
                let Some(current) = records.as_deref() else {
                    continue;
                };
                let value = derive(current);
                if last.as_ref() == Some(&value) {
                    continue;
                }
                last = Some(value.clone());
                if delivery.cancel.is_cancelled() {
                    break;
                }
                on_change(value);
            }
            tracing::debug!(subscription_id = %delivery.id, "Derived subscription delivery stopped");
        });

        subscription
    }
}

/// Feed snapshots to `deliver` until the subscription is cancelled, the
/// consumer reports it is gone, or the feed fails for good.
async fn pump<F, Fut>(mut feed: ReopeningFeed, delivery: &Delivery, mut deliver: F)
where
    F: FnMut(Vec<StoredRecord>) -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        let snapshot = tokio::select! {
            biased;
            _ = delivery.cancel.cancelled() => return,
            next = feed.next() => match next {
                Ok(snapshot) => snapshot,
                Err(e) => return delivery.fail(e),
            },
        };
        tokio::select! {
            biased;
            _ = delivery.cancel.cancelled() => return,
            delivered = deliver(snapshot) => {
                if !delivered {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reopening feed
// ---------------------------------------------------------------------------

/// A store feed that reopens itself after transient failures.
///
/// [`next`](Self::next) is cancel safe: the retry deadline lives in the
/// struct, so racing it against a timer does not restart the backoff.
struct ReopeningFeed {
    store: Arc<dyn DocumentStore>,
    query: Query,
    id: Uuid,
    feed: Option<ChangeFeed>,
    retry_at: Instant,
    backoff: Duration,
}

impl ReopeningFeed {
    fn new(store: Arc<dyn DocumentStore>, query: Query, id: Uuid) -> Self {
        Self {
            store,
            query,
            id,
            feed: None,
            retry_at: Instant::now(),
            backoff: RETRY_INITIAL,
        }
    }

    /// Next snapshot, or the error that ended the feed for good.
    async fn next(&mut self) -> Result<Vec<StoredRecord>, StoreError> {
        loop {
            let Some(feed) = self.feed.as_mut() else {
                tokio::time::sleep_until(self.retry_at).await;
                match self.store.watch(self.query.clone()).await {
                    Ok(feed) => {
                        tracing::debug!(
                            subscription_id = %self.id,
                            collection = %self.query.collection,
                            "Change feed opened"
                        );
                        self.feed = Some(feed);
                    }
                    Err(e) => self.back_off(e)?,
                }
                continue;
            };

            match feed.next().await {
                Some(Ok(snapshot)) => {
                    self.backoff = RETRY_INITIAL;
                    return Ok(snapshot);
                }
                Some(Err(e)) => {
                    self.feed = None;
                    self.back_off(e)?;
                }
                None => {
                    self.feed = None;
                    self.back_off(StoreError::Unavailable("change feed closed".into()))?;
                }
            }
        }
    }

    /// Schedule a reopen after a transient error; hand any other error back.
    fn back_off(&mut self, error: StoreError) -> Result<(), StoreError> {
        if !error.is_transient() {
            return Err(error);
        }
        tracing::warn!(
            subscription_id = %self.id,
            collection = %self.query.collection,
            error = %error,
            retry_in_ms = self.backoff.as_millis() as u64,
            "Change feed failed, reopening"
        );
        self.retry_at = Instant::now() + self.backoff;
        self.backoff = (self.backoff * 2).min(RETRY_MAX);
        Ok(())
    }
}
