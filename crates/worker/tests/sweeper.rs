//! Tests for the housekeeping `Sweeper` over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use cowork_core::types::Timestamp;
use cowork_core::{Clock, DocumentKey, Lease, ManualClock, PresenceAction, PresenceRecord, Requester};
use cowork_db::{DocumentStore, MemoryStore, RecordPath, SetOptions};
use cowork_worker::{SweepReport, Sweeper};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn setup() -> (MemoryStore, Arc<ManualClock>, Sweeper) {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(t0()));
    let sweeper = Sweeper::new(
        Arc::new(store.clone()),
        clock.clone(),
        chrono::Duration::seconds(30),
    );
    (store, clock, sweeper)
}

async fn put_lease(store: &MemoryStore, id: &str, owner: &str, acquired: Timestamp) {
    let key = DocumentKey::project(id);
    let lease = Lease::grant(
        &key,
        &Requester::new(owner, owner),
        acquired,
        chrono::Duration::seconds(300),
    );
    store
        .set(
            &RecordPath::lock(&key),
            serde_json::to_value(&lease).unwrap(),
            SetOptions::overwrite(),
        )
        .await
        .unwrap();
}

async fn put_presence(store: &MemoryStore, user: &str, last_seen: Timestamp) {
    let key = DocumentKey::project("p1");
    let record = PresenceRecord::new(&key, user, PresenceAction::Viewing, last_seen);
    store
        .set(
            &RecordPath::presence(&key, user),
            serde_json::to_value(&record).unwrap(),
            SetOptions::overwrite(),
        )
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Test: only dead records are removed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_removes_only_dead_records() {
    let (store, clock, sweeper) = setup();
    put_lease(&store, "old", "alice", t0()).await;
    put_presence(&store, "alice", t0()).await;

    clock.advance(chrono::Duration::seconds(200));
    put_lease(&store, "fresh", "bob", clock.now()).await;

    clock.advance(chrono::Duration::seconds(100));
    put_presence(&store, "bob", clock.now()).await;
    let report = sweeper.sweep_once().await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            leases_removed: 1,
            presence_removed: 1,
        }
    );
    assert!(store.get(&RecordPath::lock(&DocumentKey::project("old"))).await.unwrap().is_none());
    assert!(store.get(&RecordPath::lock(&DocumentKey::project("fresh"))).await.unwrap().is_some());
    assert_eq!(store.count("presence").await, 1);
    assert_eq!(store.count("locks").await, 1);
}

// ---------------------------------------------------------------------------
// Test: malformed records are left alone
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_skips_malformed_records() {
    let (store, _clock, sweeper) = setup();
    store
        .set(
            &RecordPath::new("locks", "project:junk"),
            json!({ "document_id": "junk" }),
            SetOptions::overwrite(),
        )
        .await
        .unwrap();

    let report = sweeper.sweep_once().await.unwrap();

    assert_eq!(report.total(), 0);
    assert_eq!(store.count("locks").await, 1);
}

// ---------------------------------------------------------------------------
// Test: a store failure is reported, not swallowed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_reports_store_failure() {
    let (store, _clock, sweeper) = setup();
    store.set_offline(true);

    let err = sweeper.sweep_once().await.unwrap_err();
    assert!(err.is_transient());
}

// ---------------------------------------------------------------------------
// Test: the run loop sweeps and stops on cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_loop_sweeps_until_cancelled() {
    let (store, clock, sweeper) = setup();
    put_lease(&store, "old", "alice", t0()).await;
    clock.advance(chrono::Duration::seconds(301));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(sweeper.run(Duration::from_millis(20), cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while store.count("locks").await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "sweeper never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sweeper should stop")
        .unwrap();
}
