//! Per-spec operational strategies: upgrades, launch backoff, unreachable
//! handling, and victim selection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capacity bounds honored while replacing instances of a spec.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    /// Lower bound on the fraction of `instances` that must stay ready
    /// during a rollout. In `[0, 1]`.
    pub minimum_health_capacity: f64,
    /// Upper bound on the bubble above `instances` a rollout may create.
    /// In `[0, 1]`.
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

impl UpgradeStrategy {
    /// Strategy for resident specs: no over-capacity, full health floor.
    pub fn for_resident() -> Self {
        Self {
            minimum_health_capacity: 0.5,
            maximum_over_capacity: 0.0,
        }
    }
}

/// Exponential launch-delay parameters applied after failed launches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffStrategy {
    /// Initial delay.
    pub backoff: Duration,
    /// Multiplier applied per consecutive failure.
    pub factor: f64,
    /// Cap on the delay.
    pub max_launch_delay: Duration,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            factor: 1.15,
            max_launch_delay: Duration::from_secs(300),
        }
    }
}

/// What happens to instances on agents the manager reports as lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreachableStrategy {
    /// Unreachable → UnreachableInactive after this long without
    /// re-observation.
    pub time_until_inactive: Duration,
    /// UnreachableInactive → expunged after this long.
    pub time_until_expunge: Duration,
}

impl Default for UnreachableStrategy {
    fn default() -> Self {
        Self {
            time_until_inactive: Duration::from_secs(900),
            time_until_expunge: Duration::from_secs(1800),
        }
    }
}

/// Which instance dies first when the orchestrator must pick a victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSelection {
    #[default]
    YoungestFirst,
    OldestFirst,
}

/// Marker for specs that hold persistent reservations and volumes.
///
/// Resident specs may never run over capacity: each instance is pinned to
/// a reservation, and there is nothing to launch a bubble instance on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Residency {
    /// Seconds a dead reservation is retained before being unreserved.
    pub relaunch_escalation_timeout_secs: u64,
}

impl Default for Residency {
    fn default() -> Self {
        Self {
            relaunch_escalation_timeout_secs: 3600,
        }
    }
}
