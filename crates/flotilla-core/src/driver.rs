//! Contracts toward the external resource manager.
//!
//! The concrete wire protocol lives outside the core; these traits are
//! what the runtime layers call, and what tests fake.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::condition::TaskState;
use crate::instance::{Instance, TaskId};
use crate::spec::Timestamp;

/// A status update pushed by the external manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub state: TaskState,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub timestamp: Timestamp,
    /// IP addresses reported with the update, if any.
    pub ip_addresses: Vec<String>,
}

/// Errors crossing the manager boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("manager rejected the call: {0}")]
    Rejected(String),

    #[error("manager unavailable: {0}")]
    Unavailable(String),
}

/// Launch/decline operations against a single offer.
///
/// `task_infos` is opaque to the core; the matcher produces the payloads
/// and the driver forwards them verbatim.
#[async_trait]
pub trait OfferLauncher: Send + Sync {
    async fn launch(&self, offer_id: &str, task_infos: Vec<serde_json::Value>)
        -> Result<(), DriverError>;

    async fn decline(&self, offer_id: &str) -> Result<(), DriverError>;
}

/// Low-level task operations.
#[async_trait]
pub trait TaskOps: Send + Sync {
    async fn kill(&self, task_id: &TaskId) -> Result<(), DriverError>;

    /// Ask the manager to re-send status for the given tasks.
    async fn reconcile(&self, task_ids: Vec<TaskId>) -> Result<(), DriverError>;

    async fn acknowledge(&self, update: &StatusUpdate) -> Result<(), DriverError>;
}

/// Why an instance is being killed. Carried into events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    FailedHealthChecks,
    OverCapacity,
    ScalingDown,
    Upgrading,
    StoppingApp,
    DuplicateAfterReachability,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KillReason::FailedHealthChecks => "failed health checks",
            KillReason::OverCapacity => "over capacity",
            KillReason::ScalingDown => "scaling down",
            KillReason::Upgrading => "upgrading",
            KillReason::StoppingApp => "stopping app",
            KillReason::DuplicateAfterReachability => "duplicate after reachability",
        };
        f.write_str(s)
    }
}

/// Instance-level kill, resolved when terminal updates arrive.
///
/// Callers must not hand over unreachable instances; the manager cannot
/// act on them, and the reaper owns their fate.
#[async_trait]
pub trait KillService: Send + Sync {
    async fn kill_instance(&self, instance: &Instance, reason: KillReason)
        -> Result<(), DriverError>;

    async fn kill_instances(
        &self,
        instances: &[Instance],
        reason: KillReason,
    ) -> Result<(), DriverError> {
        for instance in instances {
            self.kill_instance(instance, reason).await?;
        }
        Ok(())
    }
}

/// Shared handles, the shape controllers receive them in.
pub type SharedKillService = Arc<dyn KillService>;
pub type SharedOfferLauncher = Arc<dyn OfferLauncher>;
pub type SharedTaskOps = Arc<dyn TaskOps>;
