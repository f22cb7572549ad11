//! Instance lifecycle state machine.
//!
//! A pure transition function: given the current instance (if any) and an
//! update operation, compute the resulting effect. The tracker is the only
//! caller; it persists and publishes whatever this function decides.

use flotilla_core::{
    Condition, Instance, InstanceId, StatusUpdate, TaskId, TaskKind, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Mutations the tracker accepts.
#[derive(Debug, Clone)]
pub enum InstanceUpdateOp {
    /// Create a plain instance without reservations.
    LaunchEphemeral(Instance),
    /// Relaunch an instance on top of its existing reservation.
    LaunchOnReservation(Instance),
    /// Create a reserved-but-not-running instance.
    Reserve(Instance),
    /// Fold a status update from the external manager into a task.
    ///
    /// `condition` is passed alongside the raw update so that internally
    /// synthesized transitions (UnreachableInactive) flow through the same
    /// path as real manager updates.
    MesosUpdate {
        instance_id: InstanceId,
        task_id: TaskId,
        condition: Condition,
        status: StatusUpdate,
        now: Timestamp,
    },
    /// A reservation expired before anything was launched on it.
    ReservationTimeout { instance_id: InstanceId },
    /// Remove the instance unconditionally.
    ForceExpunge { instance_id: InstanceId },
}

impl InstanceUpdateOp {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            InstanceUpdateOp::LaunchEphemeral(i)
            | InstanceUpdateOp::LaunchOnReservation(i)
            | InstanceUpdateOp::Reserve(i) => &i.id,
            InstanceUpdateOp::MesosUpdate { instance_id, .. }
            | InstanceUpdateOp::ReservationTimeout { instance_id }
            | InstanceUpdateOp::ForceExpunge { instance_id } => instance_id,
        }
    }
}

/// Outcome of applying an update op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateEffect {
    /// The instance changed; `old` is `None` for newly created instances.
    Update {
        old: Option<Box<Instance>>,
        new: Box<Instance>,
    },
    /// The instance is gone.
    Expunge(Box<Instance>),
    /// Nothing to do (duplicate or stale update).
    Noop,
    /// The op is illegal for the current state. A bug upstream, surfaced
    /// as an error event, never a panic.
    Failure(String),
}

/// Apply `op` to the current view of the instance.
pub fn apply(existing: Option<&Instance>, op: InstanceUpdateOp) -> UpdateEffect {
    match op {
        InstanceUpdateOp::LaunchEphemeral(instance)
        | InstanceUpdateOp::Reserve(instance) => match existing {
            Some(old) => UpdateEffect::Failure(format!(
                "instance {} already exists in condition {:?}",
                old.id, old.state.condition
            )),
            None => UpdateEffect::Update {
                old: None,
                new: Box::new(instance),
            },
        },

        InstanceUpdateOp::LaunchOnReservation(mut instance) => match existing {
            Some(old) if old.state.condition == Condition::Reserved => {
                // A relaunch may carry a newer spec version, never an older.
                instance.run_spec_version = instance.run_spec_version.max(old.run_spec_version);
                UpdateEffect::Update {
                    old: Some(Box::new(old.clone())),
                    new: Box::new(instance),
                }
            }
            Some(old) => UpdateEffect::Failure(format!(
                "cannot launch on reservation: instance {} is {:?}, not Reserved",
                old.id, old.state.condition
            )),
            None => UpdateEffect::Failure(format!(
                "cannot launch on reservation: instance {} unknown",
                instance.id
            )),
        },

        InstanceUpdateOp::MesosUpdate {
            instance_id,
            task_id,
            condition,
            status,
            now,
        } => match existing {
            None => UpdateEffect::Failure(format!(
                "status update for unknown instance {instance_id}"
            )),
            Some(old) => apply_status(old, &task_id, condition, &status, now),
        },

        InstanceUpdateOp::ReservationTimeout { instance_id } => match existing {
            Some(old) if old.state.condition == Condition::Reserved => {
                UpdateEffect::Expunge(Box::new(old.clone()))
            }
            Some(old) => UpdateEffect::Failure(format!(
                "reservation timeout for instance {} in condition {:?}",
                old.id, old.state.condition
            )),
            None => UpdateEffect::Failure(format!(
                "reservation timeout for unknown instance {instance_id}"
            )),
        },

        InstanceUpdateOp::ForceExpunge { instance_id: _ } => match existing {
            Some(old) => UpdateEffect::Expunge(Box::new(old.clone())),
            None => UpdateEffect::Noop,
        },
    }
}

fn apply_status(
    old: &Instance,
    task_id: &TaskId,
    condition: Condition,
    status: &StatusUpdate,
    now: Timestamp,
) -> UpdateEffect {
    let Some(task) = old.tasks.get(task_id) else {
        return UpdateEffect::Failure(format!(
            "status update for unknown task {task_id} of instance {}",
            old.id
        ));
    };

    // Reserved tasks are not running; the manager has nothing to say
    // about them.
    if task.kind.is_reserved() {
        return UpdateEffect::Failure(format!(
            "status update {:?} for reserved task {task_id}",
            status.state
        ));
    }

    let previous = task.status.condition;
    if previous == condition && condition != Condition::Running {
        return UpdateEffect::Noop;
    }
    if previous == condition && condition == Condition::Running && status.ip_addresses.is_empty() {
        // Periodic TASK_RUNNING re-confirmation without new facts.
        return UpdateEffect::Noop;
    }

    let mut new = old.clone();
    {
        let task = new.tasks.get_mut(task_id).expect("checked above");
        task.status.condition = condition;
        if condition == Condition::Running && task.status.started_at.is_none() {
            task.status.started_at = Some(now);
        }
        if !status.ip_addresses.is_empty() {
            task.status.net_info.ip_addresses = status.ip_addresses.clone();
        }
    }

    let derived = new.derived_condition();
    if derived != new.state.condition {
        let was_active = new.state.condition.is_active();
        new.state.condition = derived;
        new.state.since = now;
        if derived.is_active() && !was_active {
            new.state.active_since = Some(now);
        }
        if derived == Condition::Running && previous.is_lost() {
            // Re-observation of a lost instance.
            new.state.active_since = Some(now);
        }
    }

    if derived.is_terminal() {
        // Resident instances fall back to their reservation instead of
        // disappearing.
        if new.tasks.values().any(|t| t.kind.reservation().is_some()) {
            for task in new.tasks.values_mut() {
                if let TaskKind::LaunchedOnReservation { reservation } = task.kind.clone() {
                    task.kind = TaskKind::Reserved { reservation };
                    task.status.condition = Condition::Reserved;
                    task.status.started_at = None;
                }
            }
            new.state.condition = Condition::Reserved;
            new.state.since = now;
            new.state.active_since = None;
            new.state.healthy = None;
            return UpdateEffect::Update {
                old: Some(Box::new(old.clone())),
                new: Box::new(new),
            };
        }
        return UpdateEffect::Expunge(Box::new(new));
    }

    UpdateEffect::Update {
        old: Some(Box::new(old.clone())),
        new: Box::new(new),
    }
}
