//! The lease record: a time-bounded exclusive claim on a document key.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::collaboration::{DocumentKey, DocumentType, Requester};
use crate::types::{Timestamp, UserId};

/// A row in the `locks` collection.
///
/// `active` is a fast-path hint only. Liveness is decided by `expires_at`
/// alone: a lease whose `expires_at` has passed is absent, whatever the flag
/// says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub document_type: DocumentType,
    pub document_id: String,
    pub owner_id: UserId,
    pub owner_display_name: String,
    pub owner_contact: Option<String>,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
    pub active: bool,
}

/// Merge patch written by the owner's heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRenewal {
    pub expires_at: Timestamp,
    pub active: bool,
}

impl Lease {
    /// Build a fresh lease for `requester` valid for `duration` from `now`.
    pub fn grant(key: &DocumentKey, requester: &Requester, now: Timestamp, duration: Duration) -> Self {
        Self {
            document_type: key.document_type,
            document_id: key.document_id.clone(),
            owner_id: requester.id.clone(),
            owner_display_name: requester.display_name.clone(),
            owner_contact: requester.contact.clone(),
            acquired_at: now,
            expires_at: now + duration,
            active: true,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.document_type, self.document_id.clone())
    }

    /// `true` while `now` is strictly before `expires_at`.
    pub fn is_live_at(&self, now: Timestamp) -> bool {
        self.expires_at > now
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    /// Time left before expiry, clamped at zero.
    pub fn remaining_at(&self, now: Timestamp) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// The heartbeat patch extending this lease to `now + duration`.
    pub fn renewal(now: Timestamp, duration: Duration) -> LeaseRenewal {
        LeaseRenewal {
            expires_at: now + duration,
            active: true,
        }
    }
}
