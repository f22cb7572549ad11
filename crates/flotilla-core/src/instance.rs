//! Instances and tasks: the scheduled units of a run spec.
//!
//! Instances are owned by the tracker and referenced everywhere else by
//! id; tasks point back at their instance through the id prefix. No
//! ownership edges cross the tracker boundary.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::ValidationError;
use crate::path::PathId;
use crate::spec::Timestamp;
use crate::strategy::UnreachableStrategy;

/// Identifier of an instance: run-spec path plus an opaque suffix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId {
    pub run_spec: PathId,
    pub suffix: String,
}

impl InstanceId {
    /// Mint a fresh id for the given run spec.
    pub fn new(run_spec: &PathId) -> Self {
        Self {
            run_spec: run_spec.clone(),
            suffix: Uuid::new_v4().to_string(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let (path_part, suffix) = raw
            .rsplit_once('.')
            .ok_or_else(|| ValidationError::Invalid(format!("malformed instance id: {raw}")))?;
        let run_spec = PathId::parse(&format!("/{}", path_part.replace('_', "/")))?;
        Ok(Self {
            run_spec,
            suffix: suffix.to_string(),
        })
    }

    /// Task id for a single-container instance.
    pub fn task_id(&self) -> TaskId {
        TaskId(format!("{self}"))
    }

    /// Task id for a named pod container.
    pub fn container_task_id(&self, container: &str) -> TaskId {
        TaskId(format!("{self}.{container}"))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.run_spec.safe_id(), self.suffix)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InstanceId> for String {
    fn from(value: InstanceId) -> Self {
        value.to_string()
    }
}

/// Identifier of an executor-level task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an instance is placed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    pub host: String,
    pub agent_id: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Condition of the whole instance, with bookkeeping timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub condition: Condition,
    /// When this condition was entered.
    pub since: Timestamp,
    /// When the instance last became active, if it ever did.
    pub active_since: Option<Timestamp>,
    /// Aggregate health; `None` until a probe reported.
    pub healthy: Option<bool>,
}

impl InstanceState {
    pub fn new(condition: Condition, now: Timestamp) -> Self {
        Self {
            condition,
            since: now,
            active_since: condition.is_active().then_some(now),
            healthy: None,
        }
    }
}

/// Network facts reported for a running task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ip_addresses: Vec<String>,
    /// Host ports in declared order.
    pub host_ports: Vec<u32>,
}

/// Resources held on behalf of a resident instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reservation {
    pub volume_ids: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// How a task relates to reservations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Resources held, nothing running.
    Reserved { reservation: Reservation },
    /// Plain task without reservations.
    LaunchedEphemeral,
    /// Running on top of a reservation.
    LaunchedOnReservation { reservation: Reservation },
}

impl TaskKind {
    pub fn is_reserved(&self) -> bool {
        matches!(self, TaskKind::Reserved { .. })
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            TaskKind::Reserved { reservation } | TaskKind::LaunchedOnReservation { reservation } => {
                Some(reservation)
            }
            TaskKind::LaunchedEphemeral => None,
        }
    }
}

/// Status of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub staged_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub condition: Condition,
    pub net_info: NetworkInfo,
}

/// An executor-level workload belonging to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub kind: TaskKind,
}

/// A single scheduled unit of a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub agent: AgentInfo,
    pub state: InstanceState,
    pub tasks: BTreeMap<TaskId, Task>,
    /// Version of the run spec this instance was launched from. Never
    /// decreases across updates to the same instance.
    pub run_spec_version: Timestamp,
    pub unreachable_strategy: UnreachableStrategy,
}

impl Instance {
    /// Fresh instance in `Created`, about to be scheduled.
    pub fn provisioned(
        id: InstanceId,
        agent: AgentInfo,
        run_spec_version: Timestamp,
        unreachable_strategy: UnreachableStrategy,
        tasks: Vec<Task>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            agent,
            state: InstanceState::new(Condition::Created, now),
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            run_spec_version,
            unreachable_strategy,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.condition.is_active()
    }

    pub fn is_unreachable(&self) -> bool {
        self.state.condition.is_lost()
    }

    /// Healthy defaults to true for instances without health information.
    pub fn is_healthy(&self) -> bool {
        self.state.healthy.unwrap_or(true)
    }

    /// Instance condition derived from its tasks: the least-advanced task
    /// wins, so a pod is only Running once every container runs.
    pub fn derived_condition(&self) -> Condition {
        let mut result = Condition::Running;
        for task in self.tasks.values() {
            let c = task.status.condition;
            if c.is_terminal() || c.is_lost() {
                return c;
            }
            if priority(c) < priority(result) {
                result = c;
            }
        }
        result
    }
}

/// Lower = earlier in the lifecycle.
fn priority(c: Condition) -> u8 {
    match c {
        Condition::Created => 0,
        Condition::Reserved => 1,
        Condition::Staging => 2,
        Condition::Starting => 3,
        Condition::Running => 4,
        Condition::Killing => 5,
        _ => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_path() -> PathId {
        PathId::parse("/prod/web/api").unwrap()
    }

    #[test]
    fn instance_id_round_trips_through_display() {
        let id = InstanceId::new(&spec_path());
        let rendered = id.to_string();
        let parsed = InstanceId::parse(&rendered).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.run_spec, spec_path());
    }

    #[test]
    fn task_ids_derive_from_instance_id() {
        let id = InstanceId::new(&spec_path());
        assert!(id.task_id().0.starts_with("prod_web_api."));
        let container = id.container_task_id("sidecar");
        assert!(container.0.ends_with(".sidecar"));
    }

    #[test]
    fn malformed_instance_ids_are_rejected() {
        assert!(InstanceId::parse("no-dot-here").is_err());
    }

    #[test]
    fn provisioned_instance_starts_created() {
        let id = InstanceId::new(&spec_path());
        let inst = Instance::provisioned(
            id,
            AgentInfo::default(),
            42,
            UnreachableStrategy::default(),
            Vec::new(),
            1000,
        );
        assert_eq!(inst.state.condition, Condition::Created);
        assert_eq!(inst.state.since, 1000);
        assert_eq!(inst.state.active_since, None);
        assert_eq!(inst.run_spec_version, 42);
        assert!(inst.is_healthy());
    }

    fn task(id: &TaskId, condition: Condition) -> Task {
        Task {
            id: id.clone(),
            status: TaskStatus {
                staged_at: 0,
                started_at: None,
                condition,
                net_info: NetworkInfo::default(),
            },
            kind: TaskKind::LaunchedEphemeral,
        }
    }

    #[test]
    fn derived_condition_takes_least_advanced_task() {
        let id = InstanceId::new(&spec_path());
        let t1 = id.container_task_id("a");
        let t2 = id.container_task_id("b");
        let mut inst = Instance::provisioned(
            id,
            AgentInfo::default(),
            1,
            UnreachableStrategy::default(),
            vec![task(&t1, Condition::Running), task(&t2, Condition::Staging)],
            0,
        );
        assert_eq!(inst.derived_condition(), Condition::Staging);

        inst.tasks.get_mut(&t2).unwrap().status.condition = Condition::Running;
        assert_eq!(inst.derived_condition(), Condition::Running);
    }

    #[test]
    fn derived_condition_propagates_terminal_tasks() {
        let id = InstanceId::new(&spec_path());
        let t1 = id.container_task_id("a");
        let t2 = id.container_task_id("b");
        let inst = Instance::provisioned(
            id,
            AgentInfo::default(),
            1,
            UnreachableStrategy::default(),
            vec![task(&t1, Condition::Running), task(&t2, Condition::Failed)],
            0,
        );
        assert_eq!(inst.derived_condition(), Condition::Failed);
    }

    #[test]
    fn reserved_kind_exposes_reservation() {
        let kind = TaskKind::Reserved {
            reservation: Reservation {
                volume_ids: vec!["vol-1".to_string()],
                labels: BTreeMap::new(),
            },
        };
        assert!(kind.is_reserved());
        assert_eq!(kind.reservation().unwrap().volume_ids, vec!["vol-1"]);
        assert!(TaskKind::LaunchedEphemeral.reservation().is_none());
    }
}
