//! Change delivery for the collaborative editing coordinator.
//!
//! This crate provides:
//!
//! - [`SubscriptionBridge`]: turns a store's change feeds into callback or
//!   stream subscriptions with an explicit [`Subscription`] handle, including
//!   the derived (re-evaluated, de-duplicated) form used for lease expiry and
//!   presence staleness.
//! - [`EventBus`]: in-process publish/subscribe hub for [`CollabEvent`]s,
//!   backed by `tokio::sync::broadcast`.
//!
//! [`CollabEvent`]: cowork_core::CollabEvent

pub mod bridge;
pub mod bus;

pub use bridge::{SnapshotStream, Subscription, SubscriptionBridge};
pub use bus::{DocumentEvents, EventBus};
