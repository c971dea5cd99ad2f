//! Shared domain model for the collaborative editing coordinator.
//!
//! Holds the document keys, lease and presence record layouts, timing
//! defaults, the coordination event protocol and the [`Clock`] seam. Every
//! other crate in the workspace depends on this one; it depends on none of
//! them.

pub mod clock;
pub mod collaboration;
pub mod error;
pub mod lease;
pub mod presence;
pub mod protocol;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaboration::{DocumentKey, DocumentType, Requester};
pub use error::CoreError;
pub use lease::{Lease, LeaseRenewal};
pub use presence::{PresenceAction, PresenceRecord};
pub use protocol::CollabEvent;
