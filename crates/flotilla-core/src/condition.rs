//! Lifecycle conditions for tasks and instances, and the mapping from the
//! external manager's task states.

use serde::{Deserialize, Serialize};

/// Closed set of lifecycle states a task or instance can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Created,
    Reserved,
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Finished,
    Failed,
    Error,
    Gone,
    Dropped,
    Unknown,
    Unreachable,
    UnreachableInactive,
}

impl Condition {
    /// Active conditions occupy capacity: the instance is launched and the
    /// external manager still considers it placed.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Condition::Staging
                | Condition::Starting
                | Condition::Running
                | Condition::Killing
                | Condition::Unreachable
        )
    }

    /// Terminal conditions end the task; the instance is expunged or falls
    /// back to its reservation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Condition::Killed
                | Condition::Finished
                | Condition::Failed
                | Condition::Error
                | Condition::Gone
                | Condition::Dropped
                | Condition::Unknown
        )
    }

    pub fn is_lost(self) -> bool {
        matches!(self, Condition::Unreachable | Condition::UnreachableInactive)
    }
}

/// Task states as reported by the external resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    TaskStaging,
    TaskStarting,
    TaskRunning,
    TaskKilling,
    TaskFinished,
    TaskFailed,
    TaskKilled,
    TaskError,
    TaskLost,
    TaskUnreachable,
    TaskGone,
    TaskDropped,
    TaskUnknown,
}

impl TaskState {
    /// The condition a status update in this state drives a task toward.
    pub fn condition(self) -> Condition {
        match self {
            TaskState::TaskStaging => Condition::Staging,
            TaskState::TaskStarting => Condition::Starting,
            TaskState::TaskRunning => Condition::Running,
            TaskState::TaskKilling => Condition::Killing,
            TaskState::TaskFinished => Condition::Finished,
            TaskState::TaskFailed => Condition::Failed,
            TaskState::TaskKilled => Condition::Killed,
            TaskState::TaskError => Condition::Error,
            TaskState::TaskLost | TaskState::TaskUnreachable => Condition::Unreachable,
            TaskState::TaskGone => Condition::Gone,
            TaskState::TaskDropped => Condition::Dropped,
            TaskState::TaskUnknown => Condition::Unknown,
        }
    }
}
