//! In-process fan-out of [`CollabEvent`]s over `tokio::sync::broadcast`.
//!
//! The coordinator publishes one event per lock or presence transition.
//! Hosts either take every event with [`EventBus::subscribe`] or only those
//! about one document with [`EventBus::subscribe_document`]. Share the bus
//! as `Arc<EventBus>`.

use cowork_core::{CollabEvent, DocumentKey};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out bus for coordination events.
///
/// Slow receivers that fall more than the channel capacity behind lose the
/// oldest events and observe `RecvError::Lagged`.
///
/// ```rust
/// use cowork_core::{CollabEvent, DocumentType};
/// use cowork_events::EventBus;
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(CollabEvent::LockReleased {
///     document_type: DocumentType::Project,
///     document_id: "p1".into(),
///     user_id: "alice".into(),
/// });
/// assert_eq!(rx.try_recv().unwrap().event_type(), "lock.released");
/// ```
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<CollabEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send to every current receiver. With no receivers the event is
    /// dropped.
    pub fn publish(&self, event: CollabEvent) {
        tracing::trace!(event_type = event.event_type(), "Publishing collaboration event");
        let _ = self.sender.send(event);
    }

    /// Every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.sender.subscribe()
    }

    /// Only the events about `key`.
    pub fn subscribe_document(&self, key: DocumentKey) -> DocumentEvents {
        DocumentEvents {
            key,
            rx: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiver filtered to one document.
#[derive(Debug)]
pub struct DocumentEvents {
    key: DocumentKey,
    rx: broadcast::Receiver<CollabEvent>,
}

impl DocumentEvents {
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Next event about this document, or `None` once the bus is gone.
    ///
    /// Events lost to lag are skipped with a warning.
    pub async fn recv(&mut self) -> Option<CollabEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.document_key() == self.key => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(key = %self.key, missed, "Document event receiver lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use cowork_core::{DocumentType, PresenceAction};

    use super::*;

    fn join(document_id: &str, user: &str) -> CollabEvent {
        CollabEvent::PresenceJoin {
            document_type: DocumentType::Project,
            document_id: document_id.to_string(),
            user_id: user.to_string(),
            action: PresenceAction::Viewing,
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);

        bus.publish(join("p1", "alice"));

        assert_eq!(rx1.recv().await.unwrap(), join("p1", "alice"));
        assert_eq!(rx2.recv().await.unwrap().event_type(), "presence.join");
    }

    #[tokio::test]
    async fn document_receiver_skips_other_documents() {
        let bus = EventBus::default();
        let mut events = bus.subscribe_document(DocumentKey::project("p2"));

        bus.publish(join("p1", "alice"));
        bus.publish(join("p2", "bob"));

        assert_eq!(events.recv().await, Some(join("p2", "bob")));
        assert_eq!(events.key(), &DocumentKey::project("p2"));
    }

    #[tokio::test]
    async fn document_receiver_ends_with_the_bus() {
        let bus = EventBus::default();
        let mut events = bus.subscribe_document(DocumentKey::project("p1"));
        drop(bus);
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn publishing_without_receivers_is_harmless() {
        let bus = EventBus::new(4);
        bus.publish(join("p1", "orphan"));
        assert_eq!(bus.receiver_count(), 0);
    }
}
