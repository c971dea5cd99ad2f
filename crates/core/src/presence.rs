//! The presence record: an advisory "who is here" marker.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::collaboration::{DocumentKey, DocumentType};
use crate::types::{Timestamp, UserId};

/// What a present user is doing with the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Viewing,
    Editing,
}

impl PresenceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceAction::Viewing => "viewing",
            PresenceAction::Editing => "editing",
        }
    }
}

/// A row in the `presence` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub document_type: DocumentType,
    pub document_id: String,
    pub action: PresenceAction,
    pub last_seen: Timestamp,
}

impl PresenceRecord {
    pub fn new(key: &DocumentKey, user_id: impl Into<UserId>, action: PresenceAction, now: Timestamp) -> Self {
        Self {
            user_id: user_id.into(),
            document_type: key.document_type,
            document_id: key.document_id.clone(),
            action,
            last_seen: now,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.document_type, self.document_id.clone())
    }

    /// Live iff `now - last_seen < ttl`. Evaluated by every reader.
    pub fn is_live_at(&self, now: Timestamp, ttl: Duration) -> bool {
        now - self.last_seen < ttl
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn test_staleness_boundary() {
        let now = Utc::now();
        let ttl = Duration::seconds(30);
        let key = DocumentKey::milestone("m1");

        let fresh = PresenceRecord::new(&key, "bob", PresenceAction::Viewing, now - Duration::seconds(29));
        let edge = PresenceRecord::new(&key, "bob", PresenceAction::Viewing, now - ttl);
        let stale = PresenceRecord::new(
            &key,
            "bob",
            PresenceAction::Editing,
            now - ttl - Duration::seconds(1),
        );

        assert!(fresh.is_live_at(now, ttl));
        assert!(!edge.is_live_at(now, ttl));
        assert!(!stale.is_live_at(now, ttl));
    }

    #[test]
    fn test_action_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(PresenceAction::Editing).unwrap(),
            serde_json::json!("editing")
        );
        assert_eq!(PresenceAction::Viewing.as_str(), "viewing");
    }
}
