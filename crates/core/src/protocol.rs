//! Coordination event protocol.
//!
//! Every lock and presence transition the coordinator performs is announced
//! as a [`CollabEvent`] on the in-process event bus, so host applications can
//! drive notifications or audit trails without polling the store.

use serde::{Deserialize, Serialize};

use crate::collaboration::{DocumentKey, DocumentType};
use crate::presence::PresenceAction;
use crate::types::{Timestamp, UserId};

/// Serialized as JSON with an internally-tagged `"type"` discriminator so
/// consumers can route events by type string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum CollabEvent {
    /// A user started viewing or editing a document.
    #[serde(rename = "presence.join")]
    PresenceJoin {
        document_type: DocumentType,
        document_id: String,
        user_id: UserId,
        action: PresenceAction,
    },

    /// A user explicitly left a document.
    #[serde(rename = "presence.leave")]
    PresenceLeave {
        document_type: DocumentType,
        document_id: String,
        user_id: UserId,
    },

    /// A lease was granted (or re-granted to its owner).
    #[serde(rename = "lock.acquired")]
    LockAcquired {
        document_type: DocumentType,
        document_id: String,
        user_id: UserId,
        expires_at: Timestamp,
    },

    /// The owner released its lease.
    #[serde(rename = "lock.released")]
    LockReleased {
        document_type: DocumentType,
        document_id: String,
        user_id: UserId,
    },

    /// An acquire was rejected because another owner holds a live lease.
    #[serde(rename = "lock.denied")]
    LockDenied {
        document_type: DocumentType,
        document_id: String,
        requester_id: UserId,
        holder_user_id: UserId,
        expires_at: Timestamp,
    },

    /// The owner's heartbeat stopped; the lease will lapse on its own.
    #[serde(rename = "lock.lost")]
    LockLost {
        document_type: DocumentType,
        document_id: String,
        user_id: UserId,
    },

    /// An administrator removed the lease.
    #[serde(rename = "lock.force_released")]
    LockForceReleased {
        document_type: DocumentType,
        document_id: String,
        admin_id: UserId,
        previous_owner_id: Option<UserId>,
    },
}

impl CollabEvent {
    /// Dot-separated event name, identical to the serialized `"type"` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            CollabEvent::PresenceJoin { .. } => "presence.join",
            CollabEvent::PresenceLeave { .. } => "presence.leave",
            CollabEvent::LockAcquired { .. } => "lock.acquired",
            CollabEvent::LockReleased { .. } => "lock.released",
            CollabEvent::LockDenied { .. } => "lock.denied",
            CollabEvent::LockLost { .. } => "lock.lost",
            CollabEvent::LockForceReleased { .. } => "lock.force_released",
        }
    }

    /// The document the event is about.
    pub fn document_key(&self) -> DocumentKey {
        let (document_type, document_id) = match self {
            CollabEvent::PresenceJoin { document_type, document_id, .. }
            | CollabEvent::PresenceLeave { document_type, document_id, .. }
            | CollabEvent::LockAcquired { document_type, document_id, .. }
            | CollabEvent::LockReleased { document_type, document_id, .. }
            | CollabEvent::LockDenied { document_type, document_id, .. }
            | CollabEvent::LockLost { document_type, document_id, .. }
            | CollabEvent::LockForceReleased { document_type, document_id, .. } => {
                (*document_type, document_id.clone())
            }
        };
        DocumentKey::new(document_type, document_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
