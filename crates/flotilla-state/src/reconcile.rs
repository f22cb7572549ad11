//! Task reconciliation — periodically asks the external manager to
//! re-send status for every task the tracker believes is live, so state
//! diverging during a partition converges again.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flotilla_core::{OrchestratorConfig, SharedTaskOps, TaskId};

use crate::tracker::InstanceTracker;

pub struct ReconciliationJob {
    tracker: InstanceTracker,
    task_ops: SharedTaskOps,
}

impl ReconciliationJob {
    pub fn new(tracker: InstanceTracker, task_ops: SharedTaskOps) -> Self {
        Self { tracker, task_ops }
    }

    pub fn spawn(self, config: &OrchestratorConfig) -> (JoinHandle<()>, watch::Sender<bool>) {
        let initial = config.reconciliation_initial_delay;
        let interval = config.reconciliation_interval;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(initial) => {}
                _ = shutdown_rx.changed() => return,
            }
            loop {
                self.reconcile_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("reconciliation job shutting down");
                        return;
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }

    /// One reconciliation pass over every live task.
    pub async fn reconcile_once(&self) {
        let mut task_ids: Vec<TaskId> = Vec::new();
        for (_, instances) in self.tracker.instances_by_spec().await {
            for instance in instances {
                for (task_id, task) in &instance.tasks {
                    if !task.status.condition.is_terminal() && !task.kind.is_reserved() {
                        task_ids.push(task_id.clone());
                    }
                }
            }
        }
        if task_ids.is_empty() {
            return;
        }
        info!(tasks = task_ids.len(), "requesting task reconciliation");
        if let Err(e) = self.task_ops.reconcile(task_ids).await {
            warn!(error = %e, "reconciliation request failed");
        }
    }
}
