//! Scale controller: converge the active instance count to a target.

use tokio::sync::watch;
use tracing::{debug, info};

use flotilla_core::{Instance, InstanceId, KillReason, OrchestratorEvent, RunSpec};

use crate::error::{DeployError, DeployResult};
use crate::readiness_behavior::ReadinessBehavior;
use crate::steps::{select_victims, StepContext};

pub async fn run(
    ctx: StepContext,
    spec: RunSpec,
    scale_to: u32,
    to_kill: Option<Vec<InstanceId>>,
    mut shutdown: watch::Receiver<bool>,
) -> DeployResult<()> {
    let path = spec.id().clone();
    let mut behavior = ReadinessBehavior::new(spec.clone(), ctx.readiness_executor.clone());
    let mut readiness_rx = behavior.take_readiness_results();
    let mut events = ctx.bus.subscribe();

    let instances = ctx.tracker.spec_instances(&path).await;
    let active: Vec<Instance> = instances.into_iter().filter(Instance::is_active).collect();
    for instance in &active {
        behavior.on_instance_changed(instance);
    }
    let current = active.len() as u32;
    let scaling_down = current > scale_to;
    info!(run_spec = %path, current, scale_to, "scale controller running");

    if current > scale_to {
        let excess = (current - scale_to) as usize;
        let victims: Vec<Instance> = match &to_kill {
            Some(ids) => active
                .iter()
                .filter(|i| ids.contains(&i.id))
                .take(excess)
                .cloned()
                .collect(),
            None => select_victims(
                active.iter().filter(|i| !i.is_unreachable()).cloned().collect(),
                excess,
                &spec,
            ),
        };
        debug!(run_spec = %path, victims = victims.len(), "killing surplus instances");
        ctx.kill_service
            .kill_instances(&victims, KillReason::ScalingDown)
            .await?;
    } else if current < scale_to {
        let demand = scale_to - current - ctx.queue.pending(&path).min(scale_to - current);
        if demand > 0 {
            ctx.queue.add(spec.clone(), demand);
        }
    }

    loop {
        let active_now = ctx
            .tracker
            .spec_instances(&path)
            .await
            .iter()
            .filter(|i| i.is_active())
            .count() as u32;
        let done = if scaling_down {
            active_now <= scale_to
        } else {
            behavior.ready_count() as u32 >= scale_to
        };
        if done {
            info!(run_spec = %path, scale_to, "scale complete");
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.changed() => {
                return Err(DeployError::Cancelled(format!("scale of {path} shut down")));
            }

            result = events.recv() => {
                let event = match result {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(DeployError::StepFailed("event bus closed".to_string()));
                    }
                };
                match event {
                    OrchestratorEvent::InstanceChanged {
                        instance_id,
                        run_spec,
                        condition,
                        ..
                    } if run_spec == path => {
                        if condition.is_terminal() {
                            behavior.note_terminal(&instance_id);
                        } else if let Some(instance) = ctx.tracker.instance(&instance_id).await {
                            behavior.on_instance_changed(&instance);
                        }
                    }
                    OrchestratorEvent::InstanceHealthChanged {
                        instance_id,
                        run_spec,
                        healthy,
                        ..
                    } if run_spec == path => {
                        if let Some(instance) = ctx.tracker.instance(&instance_id).await {
                            behavior.on_health_changed(&instance, healthy);
                        }
                    }
                    _ => {}
                }
            }

            result = readiness_rx.recv() => {
                if let Some((id, readiness)) = result {
                    behavior.on_readiness_result(&id, &readiness);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{AppSpec, Condition};
    use flotilla_state::InstanceUpdateOp;

    use crate::steps::testutil::*;

    fn app() -> RunSpec {
        let mut spec = AppSpec::new(path("/api"));
        spec.version = 3;
        RunSpec::App(spec)
    }

    #[tokio::test]
    async fn scale_down_kills_youngest_and_waits_for_terminals() {
        let h = harness();
        let spec = app();
        let old = instance_for(&spec, Condition::Running, 100);
        let young = instance_for(&spec, Condition::Running, 200);
        for i in [&old, &young] {
            h.ctx
                .tracker
                .process(InstanceUpdateOp::LaunchEphemeral(i.clone()))
                .await
                .unwrap();
        }

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(run(h.ctx.clone(), spec.clone(), 1, None, rx));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.kills.killed_ids(), vec![young.id.clone()]);

        // Controller is still waiting: the victim is not yet terminal.
        assert!(!handle.is_finished());
        make_terminal(&h.ctx, &young).await;

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn explicit_to_kill_wins_over_selection() {
        let h = harness();
        let spec = app();
        let a = instance_for(&spec, Condition::Running, 100);
        let b = instance_for(&spec, Condition::Running, 200);
        for i in [&a, &b] {
            h.ctx
                .tracker
                .process(InstanceUpdateOp::LaunchEphemeral(i.clone()))
                .await
                .unwrap();
        }

        // Kill the *older* instance explicitly.
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(run(
            h.ctx.clone(),
            spec.clone(),
            1,
            Some(vec![a.id.clone()]),
            rx,
        ));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.kills.killed_ids(), vec![a.id.clone()]);

        make_terminal(&h.ctx, &a).await;
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn scale_up_requests_launches_and_waits_for_ready() {
        let h = harness();
        let spec = app();
        let existing = instance_for(&spec, Condition::Running, 100);
        h.ctx
            .tracker
            .process(InstanceUpdateOp::LaunchEphemeral(existing.clone()))
            .await
            .unwrap();

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(run(h.ctx.clone(), spec.clone(), 3, None, rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.ctx.queue.pending(&path("/api")), 2);

        for _ in 0..2 {
            let fresh = instance_for(&spec, Condition::Staging, 0);
            h.ctx
                .tracker
                .process(InstanceUpdateOp::LaunchEphemeral(fresh.clone()))
                .await
                .unwrap();
            make_running(&h.ctx, &fresh).await;
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn already_at_target_completes_immediately() {
        let h = harness();
        let spec = app();
        let existing = instance_for(&spec, Condition::Running, 100);
        h.ctx
            .tracker
            .process(InstanceUpdateOp::LaunchEphemeral(existing))
            .await
            .unwrap();

        let (_tx, rx) = tokio::sync::watch::channel(false);
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run(h.ctx.clone(), spec, 1, None, rx),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(h.kills.killed_ids().is_empty());
    }

    #[tokio::test]
    async fn unreachable_instances_are_never_victims() {
        let h = harness();
        let spec = app();
        let lost = instance_for(&spec, Condition::Unreachable, 300);
        let running = instance_for(&spec, Condition::Running, 100);
        for i in [&lost, &running] {
            h.ctx
                .tracker
                .process(InstanceUpdateOp::LaunchEphemeral(i.clone()))
                .await
                .unwrap();
        }

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(run(h.ctx.clone(), spec.clone(), 1, None, rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // The lost instance is younger, but the reachable one is killed.
        assert_eq!(h.kills.killed_ids(), vec![running.id.clone()]);
        make_terminal(&h.ctx, &running).await;
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
