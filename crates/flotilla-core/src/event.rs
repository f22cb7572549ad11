//! Typed orchestrator events and the in-process bus.
//!
//! Events are broadcast to whoever subscribes; delivery is at-most-once
//! within the process and there is no ordering guarantee across distinct
//! publishers. Per-instance events do preserve the tracker's
//! acknowledgement order because the tracker is their only publisher.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::condition::Condition;
use crate::instance::{InstanceId, TaskId};
use crate::path::PathId;
use crate::spec::Timestamp;

/// Event type names on the wire.
pub mod event_types {
    pub const DEPLOYMENT_INFO: &str = "deployment_info";
    pub const DEPLOYMENT_SUCCESS: &str = "deployment_success";
    pub const DEPLOYMENT_FAILED: &str = "deployment_failed";
    pub const DEPLOYMENT_STEP_SUCCESS: &str = "deployment_step_success";
    pub const DEPLOYMENT_STEP_FAILURE: &str = "deployment_step_failure";
    pub const STATUS_UPDATE: &str = "status_update_event";
    pub const INSTANCE_CHANGED: &str = "instance_changed_event";
    pub const INSTANCE_HEALTH_CHANGED: &str = "instance_health_changed_event";
    pub const FAILED_HEALTH_CHECK: &str = "failed_health_check_event";
    pub const UNHEALTHY_INSTANCE_KILL: &str = "unhealthy_task_kill_event";
    pub const GROUP_CHANGE_SUCCESS: &str = "group_change_success";
    pub const GROUP_CHANGE_FAILED: &str = "group_change_failed";
    pub const API_POST: &str = "api_post_event";
}

/// Everything observers can see happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    DeploymentInfo {
        plan_id: String,
        step_index: usize,
        at: Timestamp,
    },
    DeploymentSuccess {
        plan_id: String,
        at: Timestamp,
    },
    DeploymentFailed {
        plan_id: String,
        reason: String,
        at: Timestamp,
    },
    DeploymentStepSuccess {
        plan_id: String,
        step_index: usize,
        at: Timestamp,
    },
    DeploymentStepFailure {
        plan_id: String,
        step_index: usize,
        reason: String,
        at: Timestamp,
    },
    StatusUpdate {
        instance_id: InstanceId,
        task_id: TaskId,
        condition: Condition,
        at: Timestamp,
    },
    InstanceChanged {
        instance_id: InstanceId,
        run_spec: PathId,
        condition: Condition,
        run_spec_version: Timestamp,
        at: Timestamp,
    },
    InstanceHealthChanged {
        instance_id: InstanceId,
        run_spec: PathId,
        healthy: bool,
        at: Timestamp,
    },
    FailedHealthCheck {
        instance_id: InstanceId,
        run_spec: PathId,
        at: Timestamp,
    },
    UnhealthyInstanceKill {
        instance_id: InstanceId,
        run_spec: PathId,
        consecutive_failures: u32,
        at: Timestamp,
    },
    GroupChangeSuccess {
        group: PathId,
        version: Timestamp,
        at: Timestamp,
    },
    GroupChangeFailed {
        group: PathId,
        reason: String,
        at: Timestamp,
    },
    ApiPost {
        path: PathId,
        at: Timestamp,
    },
}

impl OrchestratorEvent {
    /// Wire name of this event's type.
    pub fn type_name(&self) -> &'static str {
        use event_types::*;
        match self {
            OrchestratorEvent::DeploymentInfo { .. } => DEPLOYMENT_INFO,
            OrchestratorEvent::DeploymentSuccess { .. } => DEPLOYMENT_SUCCESS,
            OrchestratorEvent::DeploymentFailed { .. } => DEPLOYMENT_FAILED,
            OrchestratorEvent::DeploymentStepSuccess { .. } => DEPLOYMENT_STEP_SUCCESS,
            OrchestratorEvent::DeploymentStepFailure { .. } => DEPLOYMENT_STEP_FAILURE,
            OrchestratorEvent::StatusUpdate { .. } => STATUS_UPDATE,
            OrchestratorEvent::InstanceChanged { .. } => INSTANCE_CHANGED,
            OrchestratorEvent::InstanceHealthChanged { .. } => INSTANCE_HEALTH_CHANGED,
            OrchestratorEvent::FailedHealthCheck { .. } => FAILED_HEALTH_CHECK,
            OrchestratorEvent::UnhealthyInstanceKill { .. } => UNHEALTHY_INSTANCE_KILL,
            OrchestratorEvent::GroupChangeSuccess { .. } => GROUP_CHANGE_SUCCESS,
            OrchestratorEvent::GroupChangeFailed { .. } => GROUP_CHANGE_FAILED,
            OrchestratorEvent::ApiPost { .. } => API_POST,
        }
    }
}

/// In-process publish/subscribe bus.
///
/// Thin wrapper over a broadcast channel; slow subscribers lose events
/// rather than applying backpressure to publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. Publishing with no subscribers
    /// is fine.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> OrchestratorEvent {
        OrchestratorEvent::DeploymentSuccess {
            plan_id: "plan-1".to_string(),
            at: 1000,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(sample_event());
        let got = rx.recv().await.unwrap();
        assert_eq!(got, sample_event());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::default();
        bus.publish(sample_event());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(sample_event());
        assert_eq!(a.recv().await.unwrap(), sample_event());
        assert_eq!(b.recv().await.unwrap(), sample_event());
    }

    #[test]
    fn event_type_names_match_the_wire_contract() {
        assert_eq!(sample_event().type_name(), "deployment_success");
        let kill = OrchestratorEvent::UnhealthyInstanceKill {
            instance_id: crate::instance::InstanceId::new(
                &crate::path::PathId::parse("/a").unwrap(),
            ),
            run_spec: crate::path::PathId::parse("/a").unwrap(),
            consecutive_failures: 3,
            at: 0,
        };
        assert_eq!(kill.type_name(), "unhealthy_task_kill_event");
    }

    #[test]
    fn events_serialize_with_tagged_type() {
        let json = serde_json::to_string(&sample_event()).unwrap();
        assert!(json.contains("\"event_type\":\"deployment_success\""));
    }
}
