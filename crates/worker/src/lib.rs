//! Housekeeping for the shared store.
//!
//! Readers already ignore expired leases and stale presence, so nothing here
//! is needed for correctness. The sweeper only keeps dead records from
//! piling up.

pub mod config;
pub mod sweeper;

pub use config::WorkerConfig;
pub use sweeper::{SweepReport, Sweeper};
