//! flotilla-state — durable repository and instance tracking.
//!
//! Backed by [redb](https://docs.rs/redb) for persistence, this crate
//! owns the canonical view of declared state (the group tree and
//! versioned run specs) and running state (instances and their tasks).
//!
//! # Architecture
//!
//! The `Repository` stores JSON-serialized domain types in redb tables.
//! The `InstanceTracker` is the single writer over instances: every
//! mutation runs the pure lifecycle state machine, commits to the
//! repository, and only then becomes visible to readers and the event
//! bus. The `ExpungeReaper` (periodic unreachable sweeps plus the
//! event-driven re-observation kill) and the `ReconciliationJob` are
//! policy loops layered on the tracker.

pub mod error;
pub mod lifecycle;
pub mod reaper;
pub mod reconcile;
pub mod repository;
pub mod tables;
pub mod tracker;

pub use error::{StateError, StateResult};
pub use lifecycle::{InstanceUpdateOp, UpdateEffect};
pub use reaper::{sort_for_kill, ExpungeReaper};
pub use reconcile::ReconciliationJob;
pub use repository::Repository;
pub use tracker::InstanceTracker;
