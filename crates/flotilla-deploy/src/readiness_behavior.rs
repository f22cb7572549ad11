//! Readiness behavior composed into step controllers.
//!
//! Tracks which instances of a spec count as "ready for rollout
//! purposes": Running, plus healthy when the spec has health checks,
//! plus all readiness checks passed when it declares any. Once ready, an
//! instance stays ready until a terminal event removes it.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use flotilla_core::{Condition, Instance, InstanceId, RunSpec};
use flotilla_health::{
    rollout_ready, ReadinessExecutor, ReadinessResult, ReadinessTracker,
};

/// What an event meant for rollout accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySignal {
    /// The instance just became ready.
    Ready(InstanceId),
    /// The instance left the fleet (terminal).
    Terminated(InstanceId),
    /// Nothing interesting.
    None,
}

pub struct ReadinessBehavior {
    spec: RunSpec,
    has_health: bool,
    readiness: ReadinessTracker,
    executor: Arc<dyn ReadinessExecutor>,
    running: BTreeSet<InstanceId>,
    healthy: BTreeSet<InstanceId>,
    ready: BTreeSet<InstanceId>,
}

impl ReadinessBehavior {
    pub fn new(spec: RunSpec, executor: Arc<dyn ReadinessExecutor>) -> Self {
        let readiness = ReadinessTracker::for_spec(&spec);
        let has_health = !spec.health_checks().is_empty();
        Self {
            spec,
            has_health,
            readiness,
            executor,
            running: BTreeSet::new(),
            healthy: BTreeSet::new(),
            ready: BTreeSet::new(),
        }
    }

    pub fn is_ready(&self, id: &InstanceId) -> bool {
        self.ready.contains(id)
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Fold an instance condition change.
    pub fn on_instance_changed(&mut self, instance: &Instance) -> ReadySignal {
        let id = instance.id.clone();
        let condition = instance.state.condition;
        if condition.is_terminal() || condition.is_lost() {
            self.running.remove(&id);
            self.healthy.remove(&id);
            self.readiness.unsubscribe(&id);
            if self.ready.remove(&id) || condition.is_terminal() {
                return ReadySignal::Terminated(id);
            }
            return ReadySignal::None;
        }
        if condition == Condition::Running && self.running.insert(id.clone()) {
            // Begin readiness probing once the instance runs (and, with
            // health checks, once it is healthy).
            if self.readiness.has_readiness_checks() && self.health_ok(&id) {
                self.start_readiness(instance);
            }
            return self.promote(&id);
        }
        ReadySignal::None
    }

    /// Fold a terminal observed only through an event (the tracker has
    /// already expunged the instance).
    pub fn note_terminal(&mut self, id: &InstanceId) -> ReadySignal {
        self.running.remove(id);
        self.healthy.remove(id);
        self.readiness.unsubscribe(id);
        self.ready.remove(id);
        ReadySignal::Terminated(id.clone())
    }

    /// Fold a health transition.
    pub fn on_health_changed(&mut self, instance: &Instance, healthy: bool) -> ReadySignal {
        let id = instance.id.clone();
        if healthy {
            self.healthy.insert(id.clone());
            if self.readiness.has_readiness_checks() && self.running.contains(&id) {
                self.start_readiness(instance);
            }
            self.promote(&id)
        } else {
            self.healthy.remove(&id);
            // Ready stays ready: only terminal events unready an instance.
            ReadySignal::None
        }
    }

    /// Fold a readiness probe result.
    pub fn on_readiness_result(&mut self, id: &InstanceId, result: &ReadinessResult) -> ReadySignal {
        if self.readiness.handle_result(id, result) {
            return self.promote(id);
        }
        ReadySignal::None
    }

    /// Wait for the next readiness result from the subscriptions.
    pub async fn next_readiness_result(&mut self) -> Option<(InstanceId, ReadinessResult)> {
        self.readiness.next_result().await
    }

    /// Move the readiness result stream out so a controller can select
    /// over it while still mutating `self` in other arms. The stream
    /// never closes while the behavior is alive; with no readiness
    /// checks it simply stays silent.
    pub fn take_readiness_results(
        &mut self,
    ) -> tokio::sync::mpsc::UnboundedReceiver<(InstanceId, ReadinessResult)> {
        self.readiness
            .take_results()
            .expect("readiness results taken twice")
    }

    pub fn has_readiness_checks(&self) -> bool {
        self.readiness.has_readiness_checks()
    }

    fn health_ok(&self, id: &InstanceId) -> bool {
        !self.has_health || self.healthy.contains(id)
    }

    fn start_readiness(&mut self, instance: &Instance) {
        let spec = self.spec.clone();
        if let RunSpec::App(app) = &spec {
            self.readiness.subscribe(app, instance, self.executor.clone());
        }
    }

    fn promote(&mut self, id: &InstanceId) -> ReadySignal {
        if self.ready.contains(id) {
            return ReadySignal::None;
        }
        let condition = if self.running.contains(id) {
            Condition::Running
        } else {
            Condition::Staging
        };
        let ready = rollout_ready(
            self.has_health,
            self.readiness.has_readiness_checks(),
            condition,
            if self.healthy.contains(id) {
                Some(true)
            } else if self.has_health {
                Some(false)
            } else {
                None
            },
            self.readiness.is_ready(id),
        );
        if ready {
            self.ready.insert(id.clone());
            debug!(instance_id = %id, "instance ready for rollout");
            return ReadySignal::Ready(id.clone());
        }
        ReadySignal::None
    }
}
