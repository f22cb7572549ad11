//! Per-check health workers and the engine managing them.
//!
//! One worker per (app, check definition). The worker probes every
//! running instance of the spec on the check's interval, folds results
//! into per-instance records, publishes health transitions, and asks the
//! kill service to replace instances that exhaust the failure budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flotilla_core::{
    AppSpec, EventBus, HealthCheck, Instance, InstanceId, KillReason, OrchestratorEvent, PathId,
    PortReference, SharedKillService, Timestamp,
};
use flotilla_state::InstanceTracker;

use crate::probe::{Prober, ProbeSpec};
use crate::record::{HealthRecord, HealthTransition};

/// Probes begin quickly even for long intervals.
const FIRST_PROBE_CAP: Duration = Duration::from_secs(5);

/// One health-check worker for a single check of a single app.
pub struct HealthCheckWorker {
    spec_id: PathId,
    check: HealthCheck,
    tracker: InstanceTracker,
    bus: EventBus,
    kill_service: SharedKillService,
    prober: Arc<dyn Prober>,
    records: HashMap<InstanceId, HealthRecord>,
}

impl HealthCheckWorker {
    pub fn new(
        spec_id: PathId,
        check: HealthCheck,
        tracker: InstanceTracker,
        bus: EventBus,
        kill_service: SharedKillService,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            spec_id,
            check,
            tracker,
            bus,
            kill_service,
            prober,
            records: HashMap::new(),
        }
    }

    /// Drive the worker on its timer until shutdown.
    pub fn spawn(mut self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let interval = self.check.policy().interval;
        let first = interval.min(FIRST_PROBE_CAP);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(first) => {}
                _ = shutdown_rx.changed() => return,
            }
            loop {
                self.run_check_pass(now_ms()).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        debug!(run_spec = %self.spec_id, "health worker shutting down");
                        return;
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }

    /// Whether the worker currently considers the instance alive.
    pub fn alive(&self, id: &InstanceId) -> Option<bool> {
        self.records.get(id).and_then(HealthRecord::alive)
    }

    /// One probing pass over all instances of the spec.
    pub async fn run_check_pass(&mut self, now: Timestamp) {
        let instances = self.tracker.spec_instances(&self.spec_id).await;

        // Forget instances that no longer exist.
        let live: Vec<InstanceId> = instances.iter().map(|i| i.id.clone()).collect();
        self.records.retain(|id, _| live.contains(id));

        for instance in instances {
            self.check_instance(&instance, now).await;
        }
    }

    async fn check_instance(&mut self, instance: &Instance, now: Timestamp) {
        let Some(task) = instance.tasks.values().next() else {
            return;
        };
        // Non-running tasks suppress failures entirely.
        if task.status.condition != flotilla_core::Condition::Running {
            return;
        }

        let Some(probe_spec) = self.probe_spec(instance) else {
            warn!(
                instance_id = %instance.id,
                "health check has no resolvable port, skipping"
            );
            return;
        };

        let policy = self.check.policy().clone();
        let result = self.prober.probe(&probe_spec, policy.timeout).await;

        let started_at = task.status.started_at.unwrap_or(task.status.staged_at);
        let record = self
            .records
            .entry(instance.id.clone())
            .or_insert_with(|| HealthRecord::new(started_at));

        // Failures inside the launch grace window are suppressed until the
        // first success.
        if !result.is_healthy() && record.in_grace(policy.grace_period.as_millis() as u64, now) {
            debug!(instance_id = %instance.id, "failure suppressed by grace period");
            return;
        }

        let transition = record.on_result(result);
        match transition {
            HealthTransition::BecameHealthy => {
                info!(instance_id = %instance.id, "instance became healthy");
                self.bus.publish(OrchestratorEvent::InstanceHealthChanged {
                    instance_id: instance.id.clone(),
                    run_spec: self.spec_id.clone(),
                    healthy: true,
                    at: now,
                });
            }
            HealthTransition::BecameUnhealthy => {
                warn!(
                    instance_id = %instance.id,
                    failures = record.consecutive_failures(),
                    "instance became unhealthy"
                );
                self.bus.publish(OrchestratorEvent::InstanceHealthChanged {
                    instance_id: instance.id.clone(),
                    run_spec: self.spec_id.clone(),
                    healthy: false,
                    at: now,
                });
            }
            HealthTransition::None => {}
        }

        if !result.is_healthy() && record.exceeds_failures(policy.max_consecutive_failures) {
            let consecutive = record.consecutive_failures();
            if instance.is_unreachable() {
                // The manager cannot kill what it cannot reach; the reaper
                // owns lost instances.
                info!(
                    instance_id = %instance.id,
                    "unhealthy but unreachable, skipping kill"
                );
                return;
            }
            self.bus.publish(OrchestratorEvent::FailedHealthCheck {
                instance_id: instance.id.clone(),
                run_spec: self.spec_id.clone(),
                at: now,
            });
            self.bus.publish(OrchestratorEvent::UnhealthyInstanceKill {
                instance_id: instance.id.clone(),
                run_spec: self.spec_id.clone(),
                consecutive_failures: consecutive,
                at: now,
            });
            info!(
                instance_id = %instance.id,
                consecutive,
                "killing instance after failed health checks"
            );
            if let Err(e) = self
                .kill_service
                .kill_instance(instance, KillReason::FailedHealthChecks)
                .await
            {
                warn!(instance_id = %instance.id, error = %e, "health kill failed");
            }
        }
    }

    /// Resolve the probe target for an instance, or `None` for delegated
    /// checks and unresolvable ports.
    fn probe_spec(&self, instance: &Instance) -> Option<ProbeSpec> {
        let host = instance.agent.host.clone();
        let port = match self.check.port()? {
            PortReference::Literal(p) => u32::from(p),
            PortReference::Index(i) => {
                let task = instance.tasks.values().next()?;
                *task.status.net_info.host_ports.get(i)?
            }
        };
        match &self.check {
            HealthCheck::Http { path, .. } => Some(ProbeSpec::Http {
                host,
                port,
                path: path.clone(),
            }),
            HealthCheck::Https { path, .. } => Some(ProbeSpec::Https {
                host,
                port,
                path: path.clone(),
            }),
            HealthCheck::Tcp { .. } => Some(ProbeSpec::Tcp { host, port }),
            _ => None,
        }
    }
}

struct WorkerSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages health workers for all monitored apps.
pub struct HealthEngine {
    tracker: InstanceTracker,
    bus: EventBus,
    kill_service: SharedKillService,
    prober: Arc<dyn Prober>,
    workers: Arc<RwLock<HashMap<PathId, Vec<WorkerSlot>>>>,
}

impl HealthEngine {
    pub fn new(
        tracker: InstanceTracker,
        bus: EventBus,
        kill_service: SharedKillService,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            tracker,
            bus,
            kill_service,
            prober,
            workers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start one worker per orchestrator-executed check of the app.
    /// Replaces any workers already running for the same path.
    pub async fn start_monitoring(&self, spec: &AppSpec) {
        let mut slots = Vec::new();
        for check in spec.health_checks.iter().filter(|c| !c.delegated()) {
            let worker = HealthCheckWorker::new(
                spec.id.clone(),
                check.clone(),
                self.tracker.clone(),
                self.bus.clone(),
                self.kill_service.clone(),
                self.prober.clone(),
            );
            let (handle, shutdown_tx) = worker.spawn();
            slots.push(WorkerSlot {
                handle,
                shutdown_tx,
            });
        }
        let count = slots.len();
        let mut workers = self.workers.write().await;
        if let Some(old) = workers.insert(spec.id.clone(), slots) {
            for slot in old {
                let _ = slot.shutdown_tx.send(true);
                slot.handle.abort();
            }
        }
        info!(run_spec = %spec.id, checks = count, "health monitoring started");
    }

    /// Stop all workers of a spec.
    pub async fn stop_monitoring(&self, spec_id: &PathId) {
        let mut workers = self.workers.write().await;
        if let Some(slots) = workers.remove(spec_id) {
            for slot in slots {
                let _ = slot.shutdown_tx.send(true);
                slot.handle.abort();
            }
            info!(run_spec = %spec_id, "health monitoring stopped");
        }
    }

    pub async fn stop_all(&self) {
        let mut workers = self.workers.write().await;
        for (id, slots) in workers.drain() {
            for slot in slots {
                let _ = slot.shutdown_tx.send(true);
                slot.handle.abort();
            }
            debug!(run_spec = %id, "health monitoring stopped");
        }
    }

    pub async fn monitored(&self) -> Vec<PathId> {
        self.workers.read().await.keys().cloned().collect()
    }
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
