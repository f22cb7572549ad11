//! The deployment executor — drives plans step by step.
//!
//! Steps run strictly sequentially; the actions of one step run
//! concurrently (they touch disjoint specs by construction). Cancelling
//! without force rolls the deployment back to the original tree;
//! cancelling with force stops the controllers and leaves whatever state
//! was reached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use flotilla_core::{OrchestratorEvent, Timestamp};

use crate::error::{DeployError, DeployResult};
use crate::plan::DeploymentPlan;
use crate::planner;
use crate::steps::{run_action, StepContext};

/// How a running plan has been asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelMode {
    /// Keep going.
    Run,
    /// Stop and execute the rollback plan.
    Rollback,
    /// Stop, no rollback.
    Force,
}

struct ActivePlan {
    plan: DeploymentPlan,
    cancel_tx: watch::Sender<CancelMode>,
    handle: Option<JoinHandle<()>>,
}

/// Owns all in-flight deployments and the conflict rule between them.
#[derive(Clone)]
pub struct DeploymentManager {
    ctx: StepContext,
    active: Arc<Mutex<HashMap<String, ActivePlan>>>,
}

impl DeploymentManager {
    pub fn new(ctx: StepContext) -> Self {
        Self {
            ctx,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start executing a plan.
    ///
    /// A plan conflicting with an in-flight one fails with `Conflict`
    /// unless `force` is set, in which case the in-flight plan is
    /// force-cancelled first.
    pub async fn start(&self, plan: DeploymentPlan, force: bool) -> DeployResult<String> {
        let mut conflicting = Vec::new();
        {
            let mut active = self.active.lock().await;
            active.retain(|_, p| p.handle.as_ref().is_some_and(|h| !h.is_finished()));
            for (id, running) in active.iter() {
                if running.plan.conflicts_with(&plan) {
                    if !force {
                        let path = running
                            .plan
                            .affected_paths()
                            .into_iter()
                            .find(|p| plan.affected_paths().contains(p))
                            .map(|p| p.to_string())
                            .unwrap_or_default();
                        return Err(DeployError::Conflict {
                            existing: id.clone(),
                            path,
                        });
                    }
                    conflicting.push(id.clone());
                }
            }
        }

        for id in conflicting {
            self.cancel(&id, true).await;
            self.wait(&id).await;
        }

        let plan_id = plan.id.clone();
        let (cancel_tx, cancel_rx) = watch::channel(CancelMode::Run);
        let ctx = self.ctx.clone();
        let task_plan = plan.clone();
        let handle = tokio::spawn(async move {
            execute_plan(ctx, task_plan, cancel_rx).await;
        });

        self.active.lock().await.insert(
            plan_id.clone(),
            ActivePlan {
                plan,
                cancel_tx,
                handle: Some(handle),
            },
        );
        info!(plan_id = %plan_id, "deployment started");
        Ok(plan_id)
    }

    /// Cancel a running plan. `force=false` rolls back; `force=true`
    /// stops where it is.
    pub async fn cancel(&self, plan_id: &str, force: bool) {
        let active = self.active.lock().await;
        if let Some(running) = active.get(plan_id) {
            let mode = if force {
                CancelMode::Force
            } else {
                CancelMode::Rollback
            };
            let _ = running.cancel_tx.send(mode);
            info!(plan_id = %plan_id, force, "deployment cancel requested");
        }
    }

    /// Wait for a plan to finish (success, failure, or cancellation).
    pub async fn wait(&self, plan_id: &str) {
        let handle = {
            let mut active = self.active.lock().await;
            active.get_mut(plan_id).and_then(|p| p.handle.take())
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.active.lock().await.remove(plan_id);
    }

    /// Plan ids currently in flight.
    pub async fn running(&self) -> Vec<String> {
        let mut active = self.active.lock().await;
        active.retain(|_, p| p.handle.as_ref().is_some_and(|h| !h.is_finished()));
        active.keys().cloned().collect()
    }

    /// Leadership lost: force-stop every live plan.
    pub async fn shutdown_all(&self) {
        let ids = self.running().await;
        for id in &ids {
            self.cancel(id, true).await;
        }
        for id in &ids {
            self.wait(id).await;
        }
    }
}

/// Outcome of driving the steps of one plan.
enum StepsOutcome {
    Completed,
    Failed(String),
    Cancelled { force: bool },
}

async fn execute_plan(ctx: StepContext, plan: DeploymentPlan, cancel_rx: watch::Receiver<CancelMode>) {
    let plan_id = plan.id.clone();
    match run_steps(&ctx, &plan, Some(cancel_rx)).await {
        StepsOutcome::Completed => {
            ctx.bus.publish(OrchestratorEvent::DeploymentSuccess {
                plan_id,
                at: now_ms(),
            });
        }
        StepsOutcome::Failed(reason) => {
            ctx.bus.publish(OrchestratorEvent::DeploymentFailed {
                plan_id,
                reason,
                at: now_ms(),
            });
        }
        StepsOutcome::Cancelled { force } => {
            ctx.bus.publish(OrchestratorEvent::DeploymentFailed {
                plan_id: plan_id.clone(),
                reason: "cancelled".to_string(),
                at: now_ms(),
            });
            if force {
                // A force-stopped deployment leaves no dangling demand.
                for path in plan.affected_paths() {
                    ctx.queue.purge(&path);
                }
                return;
            }
            // Roll back: from where the cancelled plan was heading, to
            // where it started.
            match planner::plan(&plan.target, &plan.original, now_ms()) {
                Ok(rollback) => {
                    info!(
                        plan_id = %plan_id,
                        rollback_id = %rollback.id,
                        "executing rollback plan"
                    );
                    let rollback_id = rollback.id.clone();
                    match run_steps(&ctx, &rollback, None).await {
                        StepsOutcome::Completed => {
                            ctx.bus.publish(OrchestratorEvent::DeploymentSuccess {
                                plan_id: rollback_id,
                                at: now_ms(),
                            });
                        }
                        StepsOutcome::Failed(reason) => {
                            ctx.bus.publish(OrchestratorEvent::DeploymentFailed {
                                plan_id: rollback_id,
                                reason,
                                at: now_ms(),
                            });
                        }
                        StepsOutcome::Cancelled { .. } => {}
                    }
                }
                Err(e) => {
                    warn!(plan_id = %plan_id, error = %e, "rollback planning failed");
                }
            }
        }
    }
}

/// Drive the steps of a plan. `cancel_rx = None` makes the run
/// uncancellable (used for rollbacks).
async fn run_steps(
    ctx: &StepContext,
    plan: &DeploymentPlan,
    mut cancel_rx: Option<watch::Receiver<CancelMode>>,
) -> StepsOutcome {
    for (step_index, step) in plan.steps.iter().enumerate() {
        if step.is_empty() {
            continue;
        }
        ctx.bus.publish(OrchestratorEvent::DeploymentInfo {
            plan_id: plan.id.clone(),
            step_index,
            at: now_ms(),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: JoinSet<DeployResult<()>> = JoinSet::new();
        for action in &step.actions {
            info!(
                plan_id = %plan.id,
                step = step_index,
                kind = action.kind(),
                run_spec = %action.path(),
                "starting action"
            );
            tasks.spawn(run_action(ctx.clone(), action.clone(), stop_rx.clone()));
        }

        let mut failure: Option<String> = None;
        let mut cancelled: Option<bool> = None;
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(e))) => {
                            failure.get_or_insert(e.to_string());
                            // One failed action fails the step; stop the rest.
                            let _ = stop_tx.send(true);
                        }
                        Some(Err(e)) => {
                            failure.get_or_insert(format!("controller panicked: {e}"));
                            let _ = stop_tx.send(true);
                        }
                    }
                }
                mode = watch_cancel(&mut cancel_rx) => {
                    if mode != CancelMode::Run && cancelled.is_none() {
                        cancelled = Some(mode == CancelMode::Force);
                        let _ = stop_tx.send(true);
                        // Bounded grace, then unconditional stop.
                        let grace = ctx.config.controller_shutdown_grace;
                        let drained = tokio::time::timeout(grace, async {
                            while tasks.join_next().await.is_some() {}
                        })
                        .await;
                        if drained.is_err() {
                            warn!(plan_id = %plan.id, "controllers exceeded shutdown grace");
                            tasks.abort_all();
                        }
                        break;
                    }
                }
            }
        }

        if let Some(force) = cancelled {
            return StepsOutcome::Cancelled { force };
        }

        match failure {
            Some(reason) => {
                ctx.bus.publish(OrchestratorEvent::DeploymentStepFailure {
                    plan_id: plan.id.clone(),
                    step_index,
                    reason: reason.clone(),
                    at: now_ms(),
                });
                return StepsOutcome::Failed(reason);
            }
            None => {
                ctx.bus.publish(OrchestratorEvent::DeploymentStepSuccess {
                    plan_id: plan.id.clone(),
                    step_index,
                    at: now_ms(),
                });
            }
        }
    }
    StepsOutcome::Completed
}

/// Wait for a cancel signal; pends forever without a receiver.
async fn watch_cancel(cancel_rx: &mut Option<watch::Receiver<CancelMode>>) -> CancelMode {
    match cancel_rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => *rx.borrow(),
            // Sender gone: nobody can cancel this run anymore.
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
