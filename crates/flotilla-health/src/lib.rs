//! flotilla-health — health probing and readiness tracking.
//!
//! One worker per (app, check definition) probes instances over
//! HTTP/HTTPS/TCP, suppresses failures inside the launch grace window,
//! publishes health transitions, and kills instances that exhaust their
//! consecutive-failure budget (unless they are unreachable). Readiness
//! tracking gates deployment progress separately from steady-state
//! health.

pub mod probe;
pub mod readiness;
pub mod record;
pub mod worker;

pub use probe::{http_probe, tcp_probe, NetworkProber, ProbeResult, Prober, ProbeSpec};
pub use readiness::{
    rollout_ready, HttpReadinessExecutor, ReadinessExecutor, ReadinessResult, ReadinessTracker,
};
pub use record::{HealthRecord, HealthTransition};
pub use worker::{HealthCheckWorker, HealthEngine};
