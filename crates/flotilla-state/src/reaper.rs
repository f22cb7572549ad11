//! Reachability reaper — policy over lost instances.
//!
//! Periodically demotes Unreachable instances to UnreachableInactive once
//! their strategy's `time_until_inactive` has elapsed and expunges
//! UnreachableInactive instances past `time_until_expunge`. Separately it
//! watches instance events: when a lost instance is observed Running
//! again, the surplus replacement launched in the meantime is killed per
//! the spec's kill selection. The kill fires only on that re-observation
//! transition — a fleet legitimately over its declared count (a rollout
//! bubble, a scale-up still converging) is left to its step controller.
//! Lost instances themselves are never handed to the kill service; the
//! manager cannot act on them.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flotilla_core::{
    Condition, EventBus, Instance, InstanceId, KillReason, KillSelection, OrchestratorConfig,
    OrchestratorEvent, PathId, SharedKillService, StatusUpdate, TaskState, Timestamp,
};

use crate::lifecycle::InstanceUpdateOp;
use crate::repository::Repository;
use crate::tracker::InstanceTracker;

/// Owns the periodic sweep and the re-observation watch. `sweep_once`
/// and `observe` are separately callable so tests can drive time and
/// events explicitly.
pub struct ExpungeReaper {
    tracker: InstanceTracker,
    repo: Repository,
    kill_service: SharedKillService,
    bus: EventBus,
    /// Instances currently known lost, maintained from instance events.
    lost: BTreeSet<InstanceId>,
}

impl ExpungeReaper {
    pub fn new(
        tracker: InstanceTracker,
        repo: Repository,
        kill_service: SharedKillService,
        bus: EventBus,
    ) -> Self {
        Self {
            tracker,
            repo,
            kill_service,
            bus,
            lost: BTreeSet::new(),
        }
    }

    /// Spawn the driving loop: periodic sweeps per the configured delays,
    /// instance events as they arrive.
    pub fn spawn(
        mut self,
        config: &OrchestratorConfig,
    ) -> (JoinHandle<()>, watch::Sender<bool>) {
        let initial = config.expunge_initial_delay;
        let interval = config.expunge_interval;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut events = self.bus.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(initial) => {}
                _ = shutdown_rx.changed() => return,
            }
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once(now_ms()).await;
                    }
                    result = events.recv() => {
                        match result {
                            Ok(event) => self.observe(&event).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                debug!(skipped = n, "reaper event stream lagged");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reaper shutting down");
                        return;
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }

    /// One demote/expunge sweep at the given time.
    pub async fn sweep_once(&mut self, now: Timestamp) {
        // Drop lost-set entries the tracker no longer knows (expunged).
        let mut gone = Vec::new();
        for id in &self.lost {
            if self.tracker.instance(id).await.is_none() {
                gone.push(id.clone());
            }
        }
        for id in gone {
            self.lost.remove(&id);
        }

        for (_, instances) in self.tracker.instances_by_spec().await {
            for instance in instances {
                let elapsed = Duration::from_millis(now.saturating_sub(instance.state.since));
                match instance.state.condition {
                    Condition::Unreachable
                        if elapsed >= instance.unreachable_strategy.time_until_inactive =>
                    {
                        info!(
                            instance_id = %instance.id,
                            since_ms = instance.state.since,
                            "unreachable instance became inactive"
                        );
                        self.demote(&instance, now).await;
                    }
                    Condition::UnreachableInactive
                        if elapsed >= instance.unreachable_strategy.time_until_expunge =>
                    {
                        info!(instance_id = %instance.id, "expunging unreachable instance");
                        let _ = self
                            .tracker
                            .process(InstanceUpdateOp::ForceExpunge {
                                instance_id: instance.id.clone(),
                            })
                            .await;
                        self.lost.remove(&instance.id);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Fold one instance event into the lost set; a lost instance seen
    /// Running again triggers the replacement kill.
    pub async fn observe(&mut self, event: &OrchestratorEvent) {
        let OrchestratorEvent::InstanceChanged {
            instance_id,
            run_spec,
            condition,
            ..
        } = event
        else {
            return;
        };
        match condition {
            Condition::Unreachable | Condition::UnreachableInactive => {
                self.lost.insert(instance_id.clone());
            }
            c if c.is_terminal() => {
                self.lost.remove(instance_id);
            }
            Condition::Running => {
                if self.lost.remove(instance_id) {
                    info!(instance_id = %instance_id, "lost instance observed again");
                    self.kill_surplus_replacements(run_spec).await;
                }
            }
            _ => {}
        }
    }

    async fn demote(&self, instance: &Instance, now: Timestamp) {
        for task_id in instance.tasks.keys() {
            let result = self
                .tracker
                .process(InstanceUpdateOp::MesosUpdate {
                    instance_id: instance.id.clone(),
                    task_id: task_id.clone(),
                    condition: Condition::UnreachableInactive,
                    status: StatusUpdate {
                        task_id: task_id.clone(),
                        state: TaskState::TaskUnreachable,
                        reason: Some("unreachable past inactivity deadline".to_string()),
                        message: None,
                        timestamp: now,
                        ip_addresses: Vec::new(),
                    },
                    now,
                })
                .await;
            if let Err(e) = result {
                warn!(instance_id = %instance.id, error = %e, "failed to demote instance");
            }
        }
    }

    /// A lost instance came back: the fleet now has one reachable
    /// instance too many, and the victim choice follows the spec's kill
    /// selection (the default YoungestFirst picks the replacement).
    async fn kill_surplus_replacements(&self, path: &PathId) {
        let Ok(Some(root)) = self.repo.root() else {
            return;
        };
        let Some(spec) = root.run_spec(path) else {
            return;
        };
        let mut reachable: Vec<Instance> = self
            .tracker
            .spec_instances(path)
            .await
            .into_iter()
            .filter(|i| i.is_active() && !i.is_unreachable())
            .collect();
        let declared = spec.instances() as usize;
        if reachable.len() <= declared {
            return;
        }
        let surplus = reachable.len() - declared;
        sort_for_kill(&mut reachable, spec.kill_selection());
        let victims: Vec<Instance> = reachable.into_iter().take(surplus).collect();
        info!(
            run_spec = %path,
            surplus,
            "killing surplus instances after reachability change"
        );
        if let Err(e) = self
            .kill_service
            .kill_instances(&victims, KillReason::DuplicateAfterReachability)
            .await
        {
            warn!(run_spec = %path, error = %e, "failed to kill surplus instances");
        }
    }
}

/// Order instances so the preferred victims come first.
pub fn sort_for_kill(instances: &mut [Instance], selection: KillSelection) {
    match selection {
        KillSelection::YoungestFirst => {
            instances.sort_by_key(|i| std::cmp::Reverse(i.state.active_since.unwrap_or(i.state.since)));
        }
        KillSelection::OldestFirst => {
            instances.sort_by_key(|i| i.state.active_since.unwrap_or(i.state.since));
        }
    }
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
