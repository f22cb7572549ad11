//! Rolling-restart controller: replace every instance not at the spec's
//! version, honoring the upgrade strategy's capacity bounds.
//!
//! The controller never lets ready capacity drop below
//! `ceil(N × minimum_health_capacity)` (except for resident specs in the
//! degenerate equal-bounds case) and never exceeds
//! `floor(N × (1 + maximum_over_capacity))` active instances, plus the
//! single bubble instance the equal-bounds case grants ephemeral specs.

use std::collections::{BTreeSet, VecDeque};

use tokio::sync::watch;
use tracing::{debug, info};

use flotilla_core::{Instance, InstanceId, KillReason, OrchestratorEvent, RunSpec};
use flotilla_state::sort_for_kill;

use crate::error::{DeployError, DeployResult};
use crate::readiness_behavior::{ReadinessBehavior, ReadySignal};
use crate::steps::StepContext;

/// Capacity arithmetic fixed at controller start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartStrategy {
    pub min_healthy: u32,
    pub max_capacity: u32,
    pub kill_immediately: u32,
}

/// Compute the restart strategy for `instance_count` declared instances
/// of which `old_count` must be replaced.
///
/// In the degenerate case `min_healthy == max_capacity <= old_count`
/// nothing could ever move: resident specs briefly dip one below the
/// health floor (their reservations forbid running over capacity), all
/// other specs get a one-instance over-capacity bubble.
pub fn restart_strategy(spec: &RunSpec, old_count: u32) -> RestartStrategy {
    let n = spec.instances() as f64;
    let strategy = spec.upgrade_strategy();
    let min_healthy = (n * strategy.minimum_health_capacity).ceil() as u32;
    let mut max_capacity = (n * (1.0 + strategy.maximum_over_capacity)).floor() as u32;
    let mut kill_immediately = old_count.saturating_sub(min_healthy);

    if min_healthy == max_capacity && max_capacity <= old_count {
        if spec.is_resident() {
            kill_immediately = old_count - min_healthy + 1;
        } else {
            max_capacity += 1;
        }
    }

    RestartStrategy {
        min_healthy,
        max_capacity,
        kill_immediately,
    }
}

pub async fn run(ctx: StepContext, spec: RunSpec, shutdown: watch::Receiver<bool>) -> DeployResult<()> {
    let path = spec.id().clone();
    let target_version = spec.version();
    let n = spec.instances();

    // Partition the active fleet by version.
    let instances = ctx.tracker.spec_instances(&path).await;
    let mut old: Vec<Instance> = Vec::new();
    let mut current: Vec<Instance> = Vec::new();
    for instance in instances.into_iter().filter(Instance::is_active) {
        if instance.run_spec_version == target_version {
            current.push(instance);
        } else {
            old.push(instance);
        }
    }

    let strategy = restart_strategy(&spec, old.len() as u32);
    info!(
        run_spec = %path,
        old = old.len(),
        kept = current.len(),
        ?strategy,
        "rolling restart starting"
    );

    // Oldest first into the kill queue; the victims the strategy says to
    // kill up front go immediately.
    sort_for_kill(&mut old, flotilla_core::KillSelection::OldestFirst);

    let mut controller = RestartRun {
        ctx,
        spec,
        n,
        strategy,
        old_active: old.iter().map(|i| i.id.clone()).collect(),
        kill_queue: old.iter().map(|i| i.id.clone()).collect(),
        started: current.len() as u32,
        shutdown,
    };
    controller.run(current).await
}

struct RestartRun {
    ctx: StepContext,
    spec: RunSpec,
    n: u32,
    strategy: RestartStrategy,
    /// Old instances still occupying capacity (killed or not).
    old_active: BTreeSet<InstanceId>,
    /// Old instances not yet told to die, oldest first.
    kill_queue: VecDeque<InstanceId>,
    /// New-version instances launched or inherited.
    started: u32,
    shutdown: watch::Receiver<bool>,
}

impl RestartRun {
    async fn run(&mut self, current: Vec<Instance>) -> DeployResult<()> {
        let path = self.spec.id().clone();
        let target_version = self.spec.version();
        let mut behavior =
            ReadinessBehavior::new(self.spec.clone(), self.ctx.readiness_executor.clone());
        let mut readiness_rx = behavior.take_readiness_results();
        let mut events = self.ctx.bus.subscribe();

        // A restart is a fresh start for the launch delay.
        self.ctx.queue.reset_delay(&path);

        // Reconcile instances already at the target version.
        for instance in &current {
            behavior.on_instance_changed(instance);
        }

        // Kill the up-front victims; instances already ready at the
        // target version release one old instance each, as a fresh ready
        // event would.
        let pre_ready = behavior.ready_count() as u32;
        let up_front = (self.strategy.kill_immediately + pre_ready)
            .min(self.kill_queue.len() as u32) as usize;
        let immediate: Vec<InstanceId> = self.kill_queue.drain(..up_front).collect();
        self.kill_ids(&immediate).await?;

        self.launch_as_capacity_allows();

        if self.is_done(&behavior) {
            info!(run_spec = %path, "rolling restart complete");
            return Ok(());
        }

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    // Launched-but-not-ready instances stay; they are part
                    // of the next plan's input state.
                    return Err(DeployError::Cancelled(format!(
                        "restart of {path} shut down"
                    )));
                }

                result = events.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(run_spec = %path, skipped = n, "event stream lagged");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            return Err(DeployError::StepFailed(
                                "event bus closed".to_string(),
                            ));
                        }
                    };
                    match event {
                        OrchestratorEvent::InstanceChanged {
                            instance_id,
                            run_spec,
                            condition,
                            run_spec_version,
                            ..
                        } if run_spec == path => {
                            if self.old_active.contains(&instance_id) {
                                if condition.is_terminal() {
                                    // An old instance is finally gone.
                                    self.old_active.remove(&instance_id);
                                    self.kill_queue.retain(|id| id != &instance_id);
                                    self.launch_as_capacity_allows();
                                }
                            } else if run_spec_version == target_version {
                                if condition.is_terminal() {
                                    // A new instance died during ramp-up.
                                    behavior.note_terminal(&instance_id);
                                    self.started = self.started.saturating_sub(1);
                                    self.launch_as_capacity_allows();
                                } else if let Some(instance) =
                                    self.ctx.tracker.instance(&instance_id).await
                                {
                                    let signal = behavior.on_instance_changed(&instance);
                                    self.handle_signal(signal).await?;
                                }
                            }
                        }
                        OrchestratorEvent::InstanceHealthChanged {
                            instance_id,
                            run_spec,
                            healthy,
                            ..
                        } if run_spec == path => {
                            if let Some(instance) =
                                self.ctx.tracker.instance(&instance_id).await
                            {
                                if instance.run_spec_version == target_version {
                                    let signal = behavior.on_health_changed(&instance, healthy);
                                    self.handle_signal(signal).await?;
                                }
                            }
                        }
                        _ => {}
                    }
                }

                result = readiness_rx.recv() => {
                    if let Some((id, readiness)) = result {
                        let signal = behavior.on_readiness_result(&id, &readiness);
                        self.handle_signal(signal).await?;
                    }
                }
            }

            if self.is_done(&behavior) {
                info!(run_spec = %path, "rolling restart complete");
                return Ok(());
            }
        }
    }

    /// A new instance became ready: one more old instance may die.
    async fn handle_signal(&mut self, signal: ReadySignal) -> DeployResult<()> {
        if let ReadySignal::Ready(_) = signal {
            if let Some(victim) = self.kill_queue.pop_front() {
                self.kill_ids(&[victim]).await?;
            }
            self.launch_as_capacity_allows();
        }
        Ok(())
    }

    /// Step 3 of the runtime loop: launch whatever fits under the
    /// capacity ceiling.
    fn launch_as_capacity_allows(&mut self) {
        let occupied = self.old_active.len() as u32 + self.started;
        let left_capacity = self.strategy.max_capacity.saturating_sub(occupied);
        let not_yet_started = self.n.saturating_sub(self.started);
        let launch_now = not_yet_started.min(left_capacity);
        if launch_now > 0 {
            debug!(
                run_spec = %self.spec.id(),
                launch_now,
                started = self.started,
                old_remaining = self.old_active.len(),
                "requesting launches"
            );
            self.ctx.queue.add(self.spec.clone(), launch_now);
            self.started += launch_now;
        }
    }

    async fn kill_ids(&self, ids: &[InstanceId]) -> DeployResult<()> {
        for id in ids {
            if let Some(instance) = self.ctx.tracker.instance(id).await {
                if instance.is_unreachable() {
                    // The reaper owns lost instances; skip the kill but
                    // keep the instance in the books until it resolves.
                    debug!(instance_id = %id, "skipping kill of unreachable instance");
                    continue;
                }
                self.ctx
                    .kill_service
                    .kill_instance(&instance, KillReason::Upgrading)
                    .await?;
            }
        }
        Ok(())
    }

    fn is_done(&self, behavior: &ReadinessBehavior) -> bool {
        self.old_active.is_empty() && behavior.ready_count() as u32 >= self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{AppSpec, Condition, Residency, UpgradeStrategy};
    use flotilla_state::InstanceUpdateOp;

    use crate::steps::testutil::*;

    fn app(instances: u32, min_healthy: f64, over: f64) -> RunSpec {
        let mut spec = AppSpec::new(path("/api"));
        spec.instances = instances;
        spec.version = 10;
        spec.upgrade_strategy = UpgradeStrategy {
            minimum_health_capacity: min_healthy,
            maximum_over_capacity: over,
        };
        RunSpec::App(spec)
    }

    fn old_version(spec: &RunSpec) -> RunSpec {
        let RunSpec::App(app) = spec else { unreachable!() };
        let mut old = app.clone();
        old.version = 1;
        RunSpec::App(old)
    }

    // ── Strategy arithmetic ────────────────────────────────────────

    #[test]
    fn strategy_basic_arithmetic() {
        // N=4, minHealth=0.5, over=0.5: floor/ceil per contract.
        let s = restart_strategy(&app(4, 0.5, 0.5), 4);
        assert_eq!(s.min_healthy, 2);
        assert_eq!(s.max_capacity, 6);
        assert_eq!(s.kill_immediately, 2);
    }

    #[test]
    fn strategy_equal_bounds_gets_a_bubble() {
        // N=2, minHealth=1.0, over=0.0: bounds coincide at 2.
        let s = restart_strategy(&app(2, 1.0, 0.0), 2);
        assert_eq!(s.min_healthy, 2);
        assert_eq!(s.max_capacity, 3); // One bubble instance.
        assert_eq!(s.kill_immediately, 0);
    }

    #[test]
    fn strategy_equal_bounds_resident_dips_below_floor() {
        let RunSpec::App(mut a) = app(2, 1.0, 0.0) else {
            unreachable!()
        };
        a.residency = Some(Residency::default());
        let spec = RunSpec::App(a);
        let s = restart_strategy(&spec, 2);
        assert_eq!(s.min_healthy, 2);
        assert_eq!(s.max_capacity, 2); // No bubble for resident specs.
        assert_eq!(s.kill_immediately, 1); // M - minHealthy + 1.
    }

    #[test]
    fn strategy_no_special_case_when_old_below_bounds() {
        // Bounds coincide but only 1 old instance: progress is possible.
        let s = restart_strategy(&app(2, 1.0, 0.0), 1);
        assert_eq!(s.max_capacity, 2);
        assert_eq!(s.kill_immediately, 0);
    }

    #[test]
    fn strategy_zero_instances() {
        let s = restart_strategy(&app(0, 1.0, 1.0), 0);
        assert_eq!(s.min_healthy, 0);
        assert_eq!(s.kill_immediately, 0);
    }

    // ── Controller behavior ────────────────────────────────────────

    async fn seed(h: &Harness, spec: &RunSpec, condition: Condition, since: u64) -> Instance {
        let instance = instance_for(spec, condition, since);
        h.ctx
            .tracker
            .process(InstanceUpdateOp::LaunchEphemeral(instance.clone()))
            .await
            .unwrap();
        instance
    }

    #[tokio::test]
    async fn empty_spec_restart_is_a_completed_noop() {
        let h = harness();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run(h.ctx.clone(), app(0, 1.0, 1.0), rx),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(h.kills.killed_ids().is_empty());
    }

    #[tokio::test]
    async fn conservative_rollout_replaces_one_by_one() {
        // Scenario: minHealth=1.0, over=1.0, N=2. Both v1 instances stay
        // until a v2 instance is ready.
        let h = harness();
        let spec = app(2, 1.0, 1.0);
        let old_spec = old_version(&spec);
        let v1a = seed(&h, &old_spec, Condition::Running, 100).await;
        let v1b = seed(&h, &old_spec, Condition::Running, 200).await;

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(run(h.ctx.clone(), spec.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // minHealthy=2: nothing killed up front, two launches requested.
        assert!(h.kills.killed_ids().is_empty());
        assert_eq!(h.ctx.queue.pending(&path("/api")), 2);

        // First v2 instance becomes ready → oldest v1 dies.
        let v2a = seed(&h, &spec, Condition::Staging, 300).await;
        make_running(&h.ctx, &v2a).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.kills.killed_ids(), vec![v1a.id.clone()]);
        make_terminal(&h.ctx, &v1a).await;

        // Second v2 ready → second v1 dies.
        let v2b = seed(&h, &spec, Condition::Staging, 400).await;
        make_running(&h.ctx, &v2b).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(
            h.kills.killed_ids(),
            vec![v1a.id.clone(), v1b.id.clone()]
        );
        make_terminal(&h.ctx, &v1b).await;

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn relaxed_floor_kills_immediately() {
        // minHealth=0.5, N=2: one old instance may die up front.
        let h = harness();
        let spec = app(2, 0.5, 0.0);
        let old_spec = old_version(&spec);
        let v1a = seed(&h, &old_spec, Condition::Running, 100).await;
        let _v1b = seed(&h, &old_spec, Condition::Running, 200).await;

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let _handle = tokio::spawn(run(h.ctx.clone(), spec.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // kill_immediately = 2 - 1 = 1; the oldest goes first.
        assert_eq!(h.kills.killed_ids(), vec![v1a.id.clone()]);
        // Capacity: max=2, occupied=2 (both v1 still active) → nothing
        // launched yet.
        assert_eq!(h.ctx.queue.pending(&path("/api")), 0);

        // The killed instance terminates → capacity frees → launch.
        make_terminal(&h.ctx, &v1a).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.ctx.queue.pending(&path("/api")), 1);
    }

    #[tokio::test]
    async fn failed_new_instance_is_relaunched() {
        let h = harness();
        let spec = app(1, 0.0, 0.0);
        let old_spec = old_version(&spec);
        let v1 = seed(&h, &old_spec, Condition::Running, 100).await;

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(run(h.ctx.clone(), spec.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // minHealthy=0 → v1 killed immediately.
        assert_eq!(h.kills.killed_ids(), vec![v1.id.clone()]);
        make_terminal(&h.ctx, &v1).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.ctx.queue.pending(&path("/api")), 1);
        h.ctx.queue.mark_launched(&path("/api"), 1);

        // The v2 instance fails before ready → demand comes back.
        let doomed = seed(&h, &spec, Condition::Staging, 300).await;
        make_terminal(&h.ctx, &doomed).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.ctx.queue.pending(&path("/api")), 1);

        // A healthy replacement completes the rollout.
        let v2 = seed(&h, &spec, Condition::Staging, 400).await;
        make_running(&h.ctx, &v2).await;
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn capacity_ceiling_is_never_exceeded() {
        // N=2, over=0.0, minHealth=1.0 → bubble grants max 3 active.
        let h = harness();
        let spec = app(2, 1.0, 0.0);
        let old_spec = old_version(&spec);
        let _v1a = seed(&h, &old_spec, Condition::Running, 100).await;
        let _v1b = seed(&h, &old_spec, Condition::Running, 200).await;

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let _handle = tokio::spawn(run(h.ctx.clone(), spec.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Only the bubble slot is free: one launch, not two.
        assert_eq!(h.ctx.queue.pending(&path("/api")), 1);
    }

    #[tokio::test]
    async fn shutdown_leaves_started_instances_alone() {
        let h = harness();
        let spec = app(2, 1.0, 1.0);
        let old_spec = old_version(&spec);
        let _v1 = seed(&h, &old_spec, Condition::Running, 100).await;

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(run(h.ctx.clone(), spec.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // A v2 instance is mid-launch when the shutdown arrives.
        let v2 = seed(&h, &spec, Condition::Staging, 300).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DeployError::Cancelled(_))));
        // The launched instance was not killed.
        let killed = h.kills.killed_ids();
        assert!(!killed.contains(&v2.id));
        assert!(h.ctx.tracker.instance(&v2.id).await.is_some());
    }

    #[tokio::test]
    async fn instances_already_at_target_are_kept() {
        let h = harness();
        let spec = app(2, 0.5, 1.0);
        let old_spec = old_version(&spec);
        let v1 = seed(&h, &old_spec, Condition::Running, 100).await;
        let v2 = seed(&h, &spec, Condition::Running, 200).await;

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(run(h.ctx.clone(), spec.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Only the old instance is replaced; the v2 one stays.
        assert!(!h.kills.killed_ids().contains(&v2.id));

        // One more launch (N=2, started=1), then v1 replaced.
        assert_eq!(h.ctx.queue.pending(&path("/api")), 1);
        let v2b = seed(&h, &spec, Condition::Staging, 300).await;
        make_running(&h.ctx, &v2b).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(h.kills.killed_ids().contains(&v1.id));
        make_terminal(&h.ctx, &v1).await;

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
