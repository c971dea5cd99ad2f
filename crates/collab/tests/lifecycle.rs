//! Session cleanup and the two-client scenarios.
//!
//! Covers explicit close, hidden/visible transitions, termination, a session
//! dropped without cleanup, and the full edit handoff between two clients.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::*;
use cowork_collab::{ClientSignal, CollabError, LeaseStatus};
use cowork_core::{DocumentKey, DocumentType, Lease, PresenceAction};
use cowork_db::{DocumentStore, MemoryStore, RecordPath};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn key() -> DocumentKey {
    DocumentKey::project("p1")
}

async fn has_lease(store: &MemoryStore) -> bool {
    store.get(&RecordPath::lock(&key())).await.unwrap().is_some()
}

async fn has_presence(store: &MemoryStore, user: &str) -> bool {
    store
        .get(&RecordPath::presence(&key(), user))
        .await
        .unwrap()
        .is_some()
}

async fn join_all(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }
}

// ---------------------------------------------------------------------------
// Test: open for edit takes the lease and announces editing; close undoes it
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_releases_lease_and_presence() {
    let h = harness();
    let session = h.coordinator.session(alice());

    let lease = session.open_for_edit(&key()).await.unwrap();
    assert_eq!(lease.owner_id, "alice");
    assert!(has_lease(&h.store).await);
    let present = h.coordinator.presence().current(&key(), None).await.unwrap();
    assert_eq!(present[0].action, PresenceAction::Editing);
    assert_matches!(session.lease_status(&key()), Some(LeaseStatus::Held { .. }));

    session.close(&key()).await.unwrap();

    assert!(!has_lease(&h.store).await);
    assert!(!has_presence(&h.store, "alice").await);
    assert!(session.open_documents().is_empty());
    assert_eq!(h.coordinator.locks().active_heartbeats(), 0);
}

// ---------------------------------------------------------------------------
// Test: hiding drops presence but keeps the lease; showing restores presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hidden_keeps_lease_and_visible_restores_presence() {
    let h = harness();
    let session = h.coordinator.session(alice());
    session.open_for_edit(&key()).await.unwrap();

    join_all(session.handle(ClientSignal::Hidden)).await;
    assert!(!has_presence(&h.store, "alice").await);
    assert!(has_lease(&h.store).await);
    assert!(session.lease_status(&key()).unwrap().is_held());

    join_all(session.handle(ClientSignal::Visible)).await;
    let present = h.coordinator.presence().current(&key(), None).await.unwrap();
    assert_eq!(present.len(), 1);
    assert_eq!(present[0].action, PresenceAction::Editing);

    // A second Visible without a Hidden in between does nothing.
    assert!(session.handle(ClientSignal::Visible).is_empty());
}

// ---------------------------------------------------------------------------
// Test: opening during an outage still ends up announced
// ---------------------------------------------------------------------------

#[tokio::test]
async fn presence_announced_after_outage_on_open() {
    let h = harness();
    let session = h.coordinator.session(alice());
    h.store.set_offline(true);

    session.open_for_view(&key()).await.unwrap();
    assert!(h.coordinator.presence().is_publishing(&key(), "alice"));
    assert_eq!(session.open_documents(), vec![key()]);

    h.store.set_offline(false);
    let store = h.store.clone();
    eventually("presence after outage", || {
        let store = store.clone();
        async move { has_presence(&store, "alice").await }
    })
    .await;

    session.close(&key()).await.unwrap();
    assert!(!has_presence(&h.store, "alice").await);
}

// ---------------------------------------------------------------------------
// Test: termination releases everything without being awaited by the caller
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminating_releases_everything() {
    let h = harness();
    let session = h.coordinator.session(alice());
    session.open_for_edit(&key()).await.unwrap();
    session.open_for_view(&DocumentKey::milestone("m1")).await.unwrap();

    let tasks = session.handle(ClientSignal::Terminating);
    assert_eq!(tasks.len(), 3);
    assert!(session.open_documents().is_empty());

    join_all(tasks).await;
    assert_eq!(h.store.count("locks").await, 0);
    assert_eq!(h.store.count("presence").await, 0);
}

// ---------------------------------------------------------------------------
// Test: close_all tears down every tracked document
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_all_tears_down_session() {
    let h = harness();
    let session = h.coordinator.session(alice());
    session.open_for_edit(&key()).await.unwrap();
    session.open_for_edit(&DocumentKey::milestone("m1")).await.unwrap();
    session.open_for_view(&DocumentKey::project("p2")).await.unwrap();
    assert_eq!(session.open_documents().len(), 3);

    session.close_all().await.unwrap();

    assert_eq!(h.store.count("locks").await, 0);
    assert_eq!(h.store.count("presence").await, 0);
}

// ---------------------------------------------------------------------------
// Test: a cancelled termination watcher leaves the session alone
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_watcher_does_not_release() {
    let h = harness();
    let session = Arc::new(h.coordinator.session(alice()));
    session.open_for_edit(&key()).await.unwrap();

    let cancel = CancellationToken::new();
    let watcher = session.watch_termination(cancel.clone());
    cancel.cancel();
    tokio::time::timeout(WAIT, watcher).await.unwrap().unwrap();

    assert!(has_lease(&h.store).await);
    assert!(session.lease_status(&key()).unwrap().is_held());
}

// ---------------------------------------------------------------------------
// Test: the edit handoff between two clients
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_editor_waits_for_first_to_close() {
    let h = harness();
    let client_b = h.peer();
    let alice_session = h.coordinator.session(alice());
    let bob_session = client_b.session(bob());

    alice_session.open_for_edit(&key()).await.unwrap();

    // Bob is refused, told who holds it, and falls back to viewing.
    let err = bob_session.open_for_edit(&key()).await.unwrap_err();
    assert_matches!(&err, CollabError::Conflict { holder } if holder.owner_display_name == "Alice");
    bob_session.open_for_view(&key()).await.unwrap();

    // Alice sees Bob viewing; Bob sees Alice editing.
    let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
    let _alice_sub = h
        .coordinator
        .subscribe_presence(DocumentType::Project, "p1", Some("alice"), move |list| {
            let _ = alice_tx.send(list);
        })
        .unwrap();
    let seen = recv(&mut alice_rx).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].user_id, "bob");
    assert_eq!(seen[0].action, PresenceAction::Viewing);

    let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
    let _bob_sub = client_b
        .subscribe_lock(DocumentType::Project, "p1", move |lease: Option<Lease>| {
            let _ = bob_tx.send(lease.map(|l| l.owner_id));
        })
        .unwrap();
    assert_eq!(recv(&mut bob_rx).await.as_deref(), Some("alice"));

    // Alice closes; Bob observes the key free and takes it.
    alice_session.close(&key()).await.unwrap();
    assert_eq!(recv(&mut bob_rx).await, None);

    let lease = bob_session.open_for_edit(&key()).await.unwrap();
    assert_eq!(lease.owner_id, "bob");
    assert_eq!(recv(&mut bob_rx).await.as_deref(), Some("bob"));
}

// ---------------------------------------------------------------------------
// Test: a client that dies without cleanup is recovered from by expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crashed_session_is_recovered_by_expiry() {
    let h = harness();
    let client_b = h.peer();

    let alice_session = h.coordinator.session(alice());
    alice_session.open_for_edit(&key()).await.unwrap();
    drop(alice_session);

    // Presence lapses first.
    h.clock.advance(secs(30));
    let present = client_b.presence().current(&key(), Some("bob")).await.unwrap();
    assert!(present.is_empty());

    // The lease is still live until its own expiry.
    let err = client_b.locks().acquire(&key(), &bob()).await.unwrap_err();
    assert!(err.conflict_holder().is_some());

    h.clock.advance(secs(270));
    let handle = client_b.locks().acquire(&key(), &bob()).await.unwrap();
    assert_eq!(handle.lease().owner_id, "bob");
    assert_eq!(handle.lease().expires_at, t0() + secs(600));
}
