//! flotilla-launch — launch demand and offer consumption.
//!
//! Deployment controllers push per-spec launch demand into the
//! `LaunchQueue`; the `OfferProcessor` drains it against incoming offers
//! through the matcher, gated by the per-spec exponential launch delay.

pub mod backoff;
pub mod processor;
pub mod queue;

pub use backoff::LaunchDelay;
pub use processor::OfferProcessor;
pub use queue::{LaunchQueue, QueuedSpecInfo};
