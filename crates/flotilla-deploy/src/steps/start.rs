//! Start controller: bring a new spec up to its target ready count.

use tokio::sync::watch;
use tracing::{debug, info};

use flotilla_core::{OrchestratorEvent, RunSpec};

use crate::error::{DeployError, DeployResult};
use crate::readiness_behavior::ReadinessBehavior;
use crate::steps::StepContext;

pub async fn run(
    ctx: StepContext,
    spec: RunSpec,
    scale_to: u32,
    mut shutdown: watch::Receiver<bool>,
) -> DeployResult<()> {
    let path = spec.id().clone();
    let target_version = spec.version();
    let mut behavior = ReadinessBehavior::new(spec.clone(), ctx.readiness_executor.clone());
    let mut readiness_rx = behavior.take_readiness_results();
    let mut events = ctx.bus.subscribe();

    // Reconcile instances that already exist (a retried step).
    let existing = ctx.tracker.spec_instances(&path).await;
    let mut active = 0u32;
    for instance in &existing {
        if instance.run_spec_version == target_version && instance.is_active() {
            active += 1;
            behavior.on_instance_changed(instance);
        }
    }

    let demand = scale_to.saturating_sub(active + ctx.queue.pending(&path));
    if demand > 0 {
        ctx.queue.add(spec.clone(), demand);
    }
    info!(run_spec = %path, scale_to, demand, "start controller running");

    if behavior.ready_count() >= scale_to as usize {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                return Err(DeployError::Cancelled(format!("start of {path} shut down")));
            }

            result = events.recv() => {
                let event = match result {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(run_spec = %path, skipped = n, "event stream lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(DeployError::StepFailed("event bus closed".to_string()));
                    }
                };
                match event {
                    OrchestratorEvent::InstanceChanged {
                        instance_id,
                        run_spec,
                        condition,
                        run_spec_version,
                        ..
                    } if run_spec == path && run_spec_version == target_version => {
                        if condition.is_terminal() {
                            behavior.note_terminal(&instance_id);
                            // The loss flows back into the queue.
                            ctx.queue.add(spec.clone(), 1);
                            debug!(run_spec = %path, %instance_id, "instance lost during start");
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
                            if instance.run_spec_version == target_version {
                                behavior.on_health_changed(&instance, healthy);
                            }
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

        if behavior.ready_count() >= scale_to as usize {
            info!(run_spec = %path, scale_to, "start complete");
            return Ok(());
        }
    }
}
