//! Instance tracker — the single writer over all instance state.
//!
//! All mutations funnel through one background task: the lifecycle state
//! machine decides the effect, the repository write commits, and only then
//! does the read view change and the corresponding events go out. Readers
//! therefore never observe a partially applied update, and per-instance
//! events preserve acknowledgement order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use flotilla_core::{
    EventBus, Instance, InstanceId, OrchestratorEvent, PathId, Task, TaskId, Timestamp,
};

use crate::error::{StateError, StateResult};
use crate::lifecycle::{self, InstanceUpdateOp, UpdateEffect};
use crate::repository::Repository;

struct Command {
    op: InstanceUpdateOp,
    reply: oneshot::Sender<StateResult<UpdateEffect>>,
}

#[derive(Default)]
struct View {
    by_spec: BTreeMap<PathId, BTreeMap<InstanceId, Instance>>,
    task_index: BTreeMap<TaskId, InstanceId>,
}

impl View {
    fn insert(&mut self, instance: Instance) {
        for task_id in instance.tasks.keys() {
            self.task_index.insert(task_id.clone(), instance.id.clone());
        }
        self.by_spec
            .entry(instance.id.run_spec.clone())
            .or_default()
            .insert(instance.id.clone(), instance);
    }

    fn remove(&mut self, id: &InstanceId) -> Option<Instance> {
        let spec_map = self.by_spec.get_mut(&id.run_spec)?;
        let removed = spec_map.remove(id);
        if spec_map.is_empty() {
            self.by_spec.remove(&id.run_spec);
        }
        if let Some(instance) = &removed {
            for task_id in instance.tasks.keys() {
                self.task_index.remove(task_id);
            }
        }
        removed
    }

    fn instance(&self, id: &InstanceId) -> Option<&Instance> {
        self.by_spec.get(&id.run_spec)?.get(id)
    }
}

/// Cloneable handle to the tracker. Reads hit the committed view; writes
/// go through the single writer task.
#[derive(Clone)]
pub struct InstanceTracker {
    tx: mpsc::Sender<Command>,
    view: Arc<RwLock<View>>,
}

impl InstanceTracker {
    /// Spawn the writer task, recovering any instances the repository
    /// already holds.
    pub fn spawn(repo: Repository, bus: EventBus) -> StateResult<(Self, JoinHandle<()>)> {
        let mut view = View::default();
        for instance in repo.instances()? {
            view.insert(instance);
        }
        let recovered = view.task_index.len();
        if recovered > 0 {
            info!(instances = recovered, "tracker recovered instances from repository");
        }

        let view = Arc::new(RwLock::new(view));
        let (tx, rx) = mpsc::channel(256);
        let writer_view = Arc::clone(&view);
        let handle = tokio::spawn(async move {
            writer_loop(repo, bus, writer_view, rx).await;
        });
        Ok((Self { tx, view }, handle))
    }

    /// Apply an update op. Resolves once the effect is durable and
    /// visible to readers.
    pub async fn process(&self, op: InstanceUpdateOp) -> StateResult<UpdateEffect> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command { op, reply })
            .await
            .map_err(|_| StateError::TrackerStopped)?;
        rx.await.map_err(|_| StateError::TrackerStopped)?
    }

    /// All instances grouped by run spec.
    pub async fn instances_by_spec(&self) -> BTreeMap<PathId, Vec<Instance>> {
        let view = self.view.read().await;
        view.by_spec
            .iter()
            .map(|(path, instances)| (path.clone(), instances.values().cloned().collect()))
            .collect()
    }

    /// Instances of a single run spec.
    pub async fn spec_instances(&self, path: &PathId) -> Vec<Instance> {
        let view = self.view.read().await;
        view.by_spec
            .get(path)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn instance(&self, id: &InstanceId) -> Option<Instance> {
        self.view.read().await.instance(id).cloned()
    }

    /// Resolve a task id to its owning instance.
    pub async fn instance_by_task(&self, task_id: &TaskId) -> Option<Instance> {
        let view = self.view.read().await;
        let id = view.task_index.get(task_id)?;
        view.instance(id).cloned()
    }

    /// Launched (non-reserved) tasks of a run spec.
    pub async fn launched_tasks(&self, path: &PathId) -> Vec<Task> {
        let view = self.view.read().await;
        view.by_spec
            .get(path)
            .map(|instances| {
                instances
                    .values()
                    .flat_map(|i| i.tasks.values())
                    .filter(|t| !t.kind.is_reserved())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

async fn writer_loop(
    repo: Repository,
    bus: EventBus,
    view: Arc<RwLock<View>>,
    mut rx: mpsc::Receiver<Command>,
) {
    while let Some(Command { op, reply }) = rx.recv().await {
        let result = handle_op(&repo, &bus, &view, op).await;
        let _ = reply.send(result);
    }
    debug!("tracker writer stopped");
}

async fn handle_op(
    repo: &Repository,
    bus: &EventBus,
    view: &Arc<RwLock<View>>,
    op: InstanceUpdateOp,
) -> StateResult<UpdateEffect> {
    let id = op.instance_id().clone();
    let current = view.read().await.instance(&id).cloned();
    let effect = lifecycle::apply(current.as_ref(), op);

    match &effect {
        UpdateEffect::Update { new, .. } => {
            // Durable before visible.
            repo.put_instance(new)?;
            view.write().await.insert((**new).clone());
            publish_changed(bus, new);
        }
        UpdateEffect::Expunge(old) => {
            repo.delete_instance(&old.id)?;
            view.write().await.remove(&old.id);
            publish_changed(bus, old);
        }
        UpdateEffect::Noop => {}
        UpdateEffect::Failure(reason) => {
            error!(instance_id = %id, %reason, "illegal instance update");
        }
    }
    Ok(effect)
}

fn publish_changed(bus: &EventBus, instance: &Instance) {
    let at = now_ms();
    bus.publish(OrchestratorEvent::InstanceChanged {
        instance_id: instance.id.clone(),
        run_spec: instance.id.run_spec.clone(),
        condition: instance.state.condition,
        run_spec_version: instance.run_spec_version,
        at,
    });
    for task in instance.tasks.values() {
        bus.publish(OrchestratorEvent::StatusUpdate {
            instance_id: instance.id.clone(),
            task_id: task.id.clone(),
            condition: task.status.condition,
            at,
        });
    }
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
