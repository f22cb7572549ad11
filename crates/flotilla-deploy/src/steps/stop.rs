//! Stop controller: kill every instance of a spec and forget it.

use tokio::sync::watch;
use tracing::{debug, info};

use flotilla_core::{Instance, KillReason, OrchestratorEvent, RunSpec};
use flotilla_state::InstanceUpdateOp;

use crate::error::{DeployError, DeployResult};
use crate::steps::StepContext;

pub async fn run(
    ctx: StepContext,
    spec: RunSpec,
    mut shutdown: watch::Receiver<bool>,
) -> DeployResult<()> {
    let path = spec.id().clone();
    let mut events = ctx.bus.subscribe();

    // No more launches for this spec, ever.
    ctx.queue.purge(&path);

    let instances = ctx.tracker.spec_instances(&path).await;
    info!(run_spec = %path, count = instances.len(), "stop controller running");

    let mut to_kill: Vec<Instance> = Vec::new();
    for instance in instances {
        if instance.is_unreachable() || !instance.is_active() {
            // Lost instances cannot be killed, and reserved/created ones
            // have nothing running: drop them from the books directly.
            debug!(instance_id = %instance.id, "force-expunging instead of killing");
            ctx.tracker
                .process(InstanceUpdateOp::ForceExpunge {
                    instance_id: instance.id.clone(),
                })
                .await?;
        } else {
            to_kill.push(instance);
        }
    }
    ctx.kill_service
        .kill_instances(&to_kill, KillReason::StoppingApp)
        .await?;

    loop {
        let remaining = ctx.tracker.spec_instances(&path).await;
        if remaining.is_empty() {
            info!(run_spec = %path, "stop complete");
            return Ok(());
        }
        // Resident instances fall back to Reserved on terminal updates;
        // stopping also releases those.
        for instance in &remaining {
            if !instance.is_active() {
                ctx.tracker
                    .process(InstanceUpdateOp::ForceExpunge {
                        instance_id: instance.id.clone(),
                    })
                    .await?;
            }
        }
        if ctx.tracker.spec_instances(&path).await.is_empty() {
            info!(run_spec = %path, "stop complete");
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.changed() => {
                return Err(DeployError::Cancelled(format!("stop of {path} shut down")));
            }
            result = events.recv() => {
                match result {
                    Ok(OrchestratorEvent::InstanceChanged { run_spec, .. })
                        if run_spec == path => {}
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(DeployError::StepFailed("event bus closed".to_string()));
                    }
                }
            }
        }
    }
}
