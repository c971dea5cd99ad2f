//! Collaboration constants, document keys, requesters, and validation.
//!
//! This module lives in `core` (zero internal deps) so that the store, the
//! subscription bridge, the coordinator and the housekeeping worker all agree
//! on the same timing defaults, record ids and key rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::UserId;

// ---------------------------------------------------------------------------
// Lease timing constants
// ---------------------------------------------------------------------------

/// Default lease lifetime in seconds (5 minutes).
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 300;

/// How often a held lease is renewed (in seconds).
pub const DEFAULT_LEASE_HEARTBEAT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Presence timing constants
// ---------------------------------------------------------------------------

/// Presence records older than this many seconds are considered stale.
pub const DEFAULT_PRESENCE_TTL_SECS: u64 = 30;

/// How often a presence record is re-published (in seconds).
pub const DEFAULT_PRESENCE_HEARTBEAT_SECS: u64 = 15;

/// How often derived subscriptions re-evaluate expiry without a store change.
pub const DEFAULT_SUBSCRIPTION_RECHECK_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Record layout
// ---------------------------------------------------------------------------

/// Store collection names.
pub mod collections {
    /// One lease record per document key.
    pub const LOCKS: &str = "locks";
    /// One presence record per `(user, document key)`.
    pub const PRESENCE: &str = "presence";
}

/// Separator used when composing record ids. Forbidden inside ids.
pub const RECORD_ID_SEPARATOR: char = ':';

/// Maximum length of a document or user id.
pub const MAX_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// The kinds of business record that can be leased or have presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Project,
    Milestone,
}

impl DocumentType {
    /// Every known document type.
    pub const ALL: [DocumentType; 2] = [DocumentType::Project, DocumentType::Milestone];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Project => "project",
            DocumentType::Milestone => "milestone",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = DocumentType::ALL.iter().map(|t| t.as_str()).collect();
                CoreError::Validation(format!(
                    "Invalid document_type '{s}'. Must be one of: {}",
                    valid.join(", ")
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Document key
// ---------------------------------------------------------------------------

/// The unit of coordination: an opaque `(document_type, document_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub document_type: DocumentType,
    pub document_id: String,
}

impl DocumentKey {
    pub fn new(document_type: DocumentType, document_id: impl Into<String>) -> Self {
        Self {
            document_type,
            document_id: document_id.into(),
        }
    }

    /// Shorthand for a project key.
    pub fn project(document_id: impl Into<String>) -> Self {
        Self::new(DocumentType::Project, document_id)
    }

    /// Shorthand for a milestone key.
    pub fn milestone(document_id: impl Into<String>) -> Self {
        Self::new(DocumentType::Milestone, document_id)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        validate_id("document_id", &self.document_id)
    }

    /// Id of the lease record for this key in the `locks` collection.
    pub fn lock_record_id(&self) -> String {
        format!(
            "{}{RECORD_ID_SEPARATOR}{}",
            self.document_type, self.document_id
        )
    }

    /// Id of `user_id`'s presence record for this key in the `presence`
    /// collection.
    pub fn presence_record_id(&self, user_id: &str) -> String {
        format!(
            "{user_id}{RECORD_ID_SEPARATOR}{}{RECORD_ID_SEPARATOR}{}",
            self.document_type, self.document_id
        )
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.document_type, self.document_id)
    }
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

/// Identity of a client asking for a lease, denormalized onto the lease so
/// other clients can render the holder without a second lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Requester {
    pub id: UserId,
    #[validate(length(min = 1, max = 256))]
    pub display_name: String,
    /// Free-form: an email address, phone number or chat handle.
    #[validate(length(min = 1, max = 256))]
    pub contact: Option<String>,
}

impl Requester {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            contact: None,
        }
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    /// Validate the id rules and the display fields.
    pub fn check(&self) -> Result<(), CoreError> {
        validate_id("user_id", &self.id)?;
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Validate an opaque id used inside a record id.
///
/// Ids must be non-empty, at most [`MAX_ID_LEN`] bytes, and free of the
/// record-id separator, `/` and control characters.
pub fn validate_id(label: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::Validation(format!("{label} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(CoreError::Validation(format!(
            "{label} must be at most {MAX_ID_LEN} bytes, got {}",
            value.len()
        )));
    }
    if value
        .chars()
        .any(|c| c == RECORD_ID_SEPARATOR || c == '/' || c.is_control())
    {
        return Err(CoreError::Validation(format!(
            "{label} '{value}' contains a reserved character"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_type_parse() {
        assert_eq!("project".parse::<DocumentType>().unwrap(), DocumentType::Project);
        assert_eq!(
            "milestone".parse::<DocumentType>().unwrap(),
            DocumentType::Milestone
        );
    }

    #[test]
    fn test_document_type_parse_rejects_unknown() {
        let err = "Project".parse::<DocumentType>().unwrap_err();
        assert!(err.to_string().contains("Invalid document_type"));
        assert!("".parse::<DocumentType>().is_err());
        assert!("scene".parse::<DocumentType>().is_err());
    }

    #[test]
    fn test_document_type_serializes_lowercase() {
        let json = serde_json::to_string(&DocumentType::Milestone).unwrap();
        assert_eq!(json, r#""milestone""#);
    }

    #[test]
    fn test_record_ids() {
        let key = DocumentKey::project("p1");
        assert_eq!(key.lock_record_id(), "project:p1");
        assert_eq!(key.presence_record_id("alice"), "alice:project:p1");
        assert_eq!(key.to_string(), "project/p1");
    }

    #[test]
    fn test_key_validation() {
        assert!(DocumentKey::project("p1").validate().is_ok());
        assert!(DocumentKey::project("").validate().is_err());
        assert!(DocumentKey::project("a:b").validate().is_err());
        assert!(DocumentKey::milestone("a/b").validate().is_err());
        assert!(DocumentKey::milestone("x".repeat(MAX_ID_LEN + 1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_requester_check() {
        assert!(Requester::new("u1", "Alice").check().is_ok());
        assert!(Requester::new("u1", "Alice")
            .with_contact("alice@example.com")
            .check()
            .is_ok());
        assert!(Requester::new("u1", "Alice")
            .with_contact("+1 555 0100 ext. 12")
            .check()
            .is_ok());
    }

    #[test]
    fn test_requester_check_rejects_bad_fields() {
        assert!(Requester::new("", "Alice").check().is_err());
        assert!(Requester::new("u1", "").check().is_err());
        assert!(Requester::new("u1", "Alice").with_contact("").check().is_err());
        assert!(Requester::new("u1", "Alice")
            .with_contact("x".repeat(257))
            .check()
            .is_err());
    }

    #[test]
    fn test_heartbeat_defaults_fit_inside_ttls() {
        assert!(DEFAULT_LEASE_HEARTBEAT_SECS * 2 <= DEFAULT_LEASE_DURATION_SECS);
        assert!(DEFAULT_PRESENCE_HEARTBEAT_SECS < DEFAULT_PRESENCE_TTL_SECS);
    }
}
