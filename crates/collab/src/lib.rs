//! Collaborative editing coordinator.
//!
//! - [`LockManager`] grants time-bounded, mutually exclusive edit leases on a
//!   document key and keeps them alive with a heartbeat owned by a
//!   [`LockHandle`].
//! - [`PresenceTracker`] publishes advisory "viewing / editing" records and
//!   reports who else is on a document, filtering stale entries on read.
//! - [`LifecycleController`] releases a session's leases and presence early
//!   when the client is known to be leaving.
//! - [`Coordinator`] wires them to one store and exposes the caller-facing API.
//!
//! Correctness rests on the store's single-record transaction; every
//! proactive release is an optimization over lease and presence expiry.

pub mod admin;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod presence;

pub use admin::{AdminAllowList, AdminCredential, AdminPolicy};
pub use config::CollabConfig;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{CollabError, CollabResult};
pub use lifecycle::{termination_signal, ClientSignal, LifecycleController};
pub use lock::{LeaseStatus, LockHandle, LockManager};
pub use presence::PresenceTracker;
