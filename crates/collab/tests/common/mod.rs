#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use cowork_collab::{AdminAllowList, CollabConfig, Coordinator};
use cowork_core::types::Timestamp;
use cowork_core::{ManualClock, Requester};
use cowork_db::MemoryStore;
use tokio::sync::mpsc;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(2);

/// Fixed start time for the manual clock.
pub fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

/// Production lease and TTL lengths with millisecond heartbeats, so timers
/// fire quickly while expiry stays under the manual clock's control.
pub fn test_config() -> CollabConfig {
    CollabConfig {
        lease_duration: Duration::from_secs(300),
        lease_heartbeat: Duration::from_millis(20),
        presence_ttl: Duration::from_secs(30),
        presence_heartbeat: Duration::from_millis(20),
        subscription_recheck: Duration::from_millis(20),
        admin_ids: Vec::new(),
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub coordinator: Coordinator,
}

impl Harness {
    /// A second coordinator on the same store and clock, standing in for
    /// another client process.
    pub fn peer(&self) -> Coordinator {
        build(&self.store, &self.clock, test_config())
    }
}

fn build(store: &MemoryStore, clock: &Arc<ManualClock>, config: CollabConfig) -> Coordinator {
    Coordinator::builder(Arc::new(store.clone()))
        .config(config)
        .clock(clock.clone())
        .admin_policy(Arc::new(AdminAllowList::new(["root"])))
        .build()
        .expect("test config is valid")
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: CollabConfig) -> Harness {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(t0()));
    let coordinator = build(&store, &clock, config);
    Harness {
        store,
        clock,
        coordinator,
    }
}

pub fn alice() -> Requester {
    Requester::new("alice", "Alice").with_contact("alice@example.com")
}

pub fn bob() -> Requester {
    Requester::new("bob", "Bob")
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

/// Next delivered value, or panic after [`WAIT`].
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("delivery should arrive in time")
        .expect("channel should stay open")
}

/// Poll `check` until it holds, or panic after [`WAIT`].
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
