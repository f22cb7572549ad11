//! Step controllers — one per in-flight deployment action.
//!
//! Each controller is an isolated consumer: it subscribes to the event
//! bus, drives the launch queue and the kill service, and resolves when
//! its action's goal state is reached. A `Shutdown` signal (watch flip)
//! fails the controller with a cancellation reason and leaves launched
//! instances in place.

pub mod artifacts;
pub mod restart;
pub mod scale;
pub mod start;
pub mod stop;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use flotilla_core::{
    ConstraintOp, EventBus, Instance, OrchestratorConfig, RunSpec, SharedKillService,
};
use flotilla_health::ReadinessExecutor;
use flotilla_launch::LaunchQueue;
use flotilla_state::{sort_for_kill, InstanceTracker};

use crate::error::DeployResult;
use crate::plan::DeploymentAction;

/// Shared handles every controller runs against.
#[derive(Clone)]
pub struct StepContext {
    pub tracker: InstanceTracker,
    pub queue: LaunchQueue,
    pub kill_service: SharedKillService,
    pub bus: EventBus,
    pub config: OrchestratorConfig,
    pub readiness_executor: Arc<dyn ReadinessExecutor>,
}

/// Run one action to completion (or cancellation).
pub async fn run_action(
    ctx: StepContext,
    action: DeploymentAction,
    shutdown: watch::Receiver<bool>,
) -> DeployResult<()> {
    match action {
        DeploymentAction::StartApplication { spec, scale_to } => {
            start::run(ctx, spec, scale_to, shutdown).await
        }
        DeploymentAction::ScaleApplication {
            spec,
            scale_to,
            to_kill,
        } => scale::run(ctx, spec, scale_to, to_kill, shutdown).await,
        DeploymentAction::RestartApplication { spec } => restart::run(ctx, spec, shutdown).await,
        DeploymentAction::StopApplication { spec } => stop::run(ctx, spec, shutdown).await,
        DeploymentAction::ResolveArtifacts { spec, urls } => {
            artifacts::run(ctx, spec, urls, shutdown).await
        }
    }
}

/// Pick `excess` victims to kill when scaling down.
///
/// The spec's kill selection orders candidates; instances from
/// over-represented GROUP_BY buckets go first so the remaining fleet
/// stays balanced. UNIQUE and MAX_PER are upper bounds — removing
/// instances cannot violate them.
pub(crate) fn select_victims(
    mut candidates: Vec<Instance>,
    excess: usize,
    spec: &RunSpec,
) -> Vec<Instance> {
    sort_for_kill(&mut candidates, spec.kill_selection());

    let group_by_fields: Vec<&str> = spec
        .constraints()
        .iter()
        .filter(|c| matches!(c.operator, ConstraintOp::GroupBy(_)))
        .map(|c| c.field.as_str())
        .collect();

    if let Some(field) = group_by_fields.first() {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for instance in &candidates {
            if let Some(value) = field_value(instance, field) {
                *counts.entry(value).or_insert(0) += 1;
            }
        }
        // Stable: ties keep the kill-selection order.
        candidates.sort_by_key(|i| {
            std::cmp::Reverse(
                field_value(i, field)
                    .and_then(|v| counts.get(&v).copied())
                    .unwrap_or(0),
            )
        });
    }

    candidates.into_iter().take(excess).collect()
}

fn field_value(instance: &Instance, field: &str) -> Option<String> {
    if field == "hostname" {
        Some(instance.agent.host.clone())
    } else {
        instance.agent.attributes.get(field).cloned()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use flotilla_core::{
        AgentInfo, AppSpec, Condition, DriverError, InstanceId, KillReason, KillService,
        NetworkInfo, PathId, ReadinessCheck, Task, TaskKind, TaskStatus, Timestamp,
        UnreachableStrategy,
    };
    use flotilla_health::ReadinessResult;
    use flotilla_state::Repository;

    /// Kill service that records victims without producing terminal
    /// updates; tests drive those explicitly.
    #[derive(Default)]
    pub struct RecordingKillService {
        pub killed: Mutex<Vec<(InstanceId, KillReason)>>,
    }

    impl RecordingKillService {
        pub fn killed_ids(&self) -> Vec<InstanceId> {
            self.killed.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
        }
    }

    #[async_trait]
    impl KillService for RecordingKillService {
        async fn kill_instance(
            &self,
            instance: &Instance,
            reason: KillReason,
        ) -> Result<(), DriverError> {
            self.killed
                .lock()
                .unwrap()
                .push((instance.id.clone(), reason));
            Ok(())
        }
    }

    /// Readiness executor that always reports ready.
    pub struct AlwaysReadyExecutor;

    #[async_trait]
    impl ReadinessExecutor for AlwaysReadyExecutor {
        async fn probe(
            &self,
            check: &ReadinessCheck,
            _spec: &AppSpec,
            instance: &Instance,
        ) -> ReadinessResult {
            ReadinessResult {
                name: check.name.clone(),
                task_id: instance.id.task_id(),
                ready: true,
                last_response: None,
            }
        }
    }

    pub struct Harness {
        pub ctx: StepContext,
        pub kills: Arc<RecordingKillService>,
    }

    pub fn harness() -> Harness {
        let repo = Repository::open_in_memory().unwrap();
        let bus = EventBus::default();
        let (tracker, _) = InstanceTracker::spawn(repo, bus.clone()).unwrap();
        let kills = Arc::new(RecordingKillService::default());
        let ctx = StepContext {
            tracker,
            queue: LaunchQueue::new(),
            kill_service: kills.clone(),
            bus,
            config: OrchestratorConfig::default(),
            readiness_executor: Arc::new(AlwaysReadyExecutor),
        };
        Harness { ctx, kills }
    }

    pub fn instance_for(spec: &RunSpec, condition: Condition, since: Timestamp) -> Instance {
        let id = InstanceId::new(spec.id());
        let task = Task {
            id: id.task_id(),
            status: TaskStatus {
                staged_at: since,
                started_at: condition.is_active().then_some(since),
                condition,
                net_info: NetworkInfo::default(),
            },
            kind: TaskKind::LaunchedEphemeral,
        };
        let mut instance = Instance::provisioned(
            id,
            AgentInfo {
                host: "host-1".to_string(),
                agent_id: None,
                attributes: Default::default(),
            },
            spec.version(),
            UnreachableStrategy::default(),
            vec![task],
            since,
        );
        instance.state.condition = condition;
        instance.state.active_since = condition.is_active().then_some(since);
        instance
    }

    /// Flip a tracked instance into a terminal condition through the
    /// tracker, as a real status update would.
    pub async fn make_terminal(ctx: &StepContext, instance: &Instance) {
        let task_id = instance.tasks.keys().next().unwrap().clone();
        let _ = ctx
            .tracker
            .process(flotilla_state::InstanceUpdateOp::MesosUpdate {
                instance_id: instance.id.clone(),
                task_id: task_id.clone(),
                condition: Condition::Killed,
                status: flotilla_core::StatusUpdate {
                    task_id,
                    state: flotilla_core::TaskState::TaskKilled,
                    reason: None,
                    message: None,
                    timestamp: 0,
                    ip_addresses: Vec::new(),
                },
                now: 1,
            })
            .await;
    }

    /// Flip a tracked instance into Running through the tracker.
    pub async fn make_running(ctx: &StepContext, instance: &Instance) {
        let task_id = instance.tasks.keys().next().unwrap().clone();
        let _ = ctx
            .tracker
            .process(flotilla_state::InstanceUpdateOp::MesosUpdate {
                instance_id: instance.id.clone(),
                task_id: task_id.clone(),
                condition: Condition::Running,
                status: flotilla_core::StatusUpdate {
                    task_id,
                    state: flotilla_core::TaskState::TaskRunning,
                    reason: None,
                    message: None,
                    timestamp: 0,
                    ip_addresses: Vec::new(),
                },
                now: 1,
            })
            .await;
    }

    pub fn path(p: &str) -> PathId {
        PathId::parse(p).unwrap()
    }
}
