//! The offer processor — consumes offers on behalf of the launch queue.
//!
//! For each incoming offer it walks the overdue queue entries, runs the
//! matcher, registers the new instance with the tracker, and hands the
//! launch descriptors to the driver in one atomic accept. Offers nothing
//! matched are declined.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use flotilla_core::{
    AgentInfo, Condition, Instance, NetworkInfo, OrchestratorConfig, RunSpec,
    SharedOfferLauncher, StatusUpdate, Task, TaskKind, TaskStatus, Timestamp,
};
use flotilla_match::{
    match_offer, OfferMatch, OfferMatchResult, ResourceOffer, ResourceValue,
};
use flotilla_state::{InstanceTracker, InstanceUpdateOp, UpdateEffect};

use crate::queue::LaunchQueue;

pub struct OfferProcessor {
    queue: LaunchQueue,
    tracker: InstanceTracker,
    launcher: SharedOfferLauncher,
    config: OrchestratorConfig,
}

impl OfferProcessor {
    pub fn new(
        queue: LaunchQueue,
        tracker: InstanceTracker,
        launcher: SharedOfferLauncher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            tracker,
            launcher,
            config,
        }
    }

    /// Process one offer. Returns the number of instances launched.
    pub async fn process_offer(&self, offer: &ResourceOffer) -> usize {
        let now = now_ms();
        let mut remaining = offer.clone();
        let mut payloads = Vec::new();
        let mut launched = 0usize;

        'specs: for spec in self.queue.matchable(now) {
            let path = spec.id().clone();
            while self.queue.pending(&path) > 0 {
                if launched >= self.config.max_instances_per_offer as usize {
                    break 'specs;
                }
                let running = self.tracker.spec_instances(&path).await;
                match match_offer(&spec, &remaining, &running, &self.config) {
                    OfferMatchResult::Match(m) => {
                        let instance = instance_from_match(&m, &spec, &remaining, now);
                        match self
                            .tracker
                            .process(InstanceUpdateOp::LaunchEphemeral(instance))
                            .await
                        {
                            Ok(UpdateEffect::Update { .. }) => {}
                            Ok(other) => {
                                warn!(run_spec = %path, ?other, "unexpected launch effect");
                                break;
                            }
                            Err(e) => {
                                warn!(run_spec = %path, error = %e, "tracker rejected launch");
                                break 'specs;
                            }
                        }
                        shrink_offer(&mut remaining, &m);
                        payloads.push(m.descriptor.to_payload());
                        self.queue.mark_launched(&path, 1);
                        launched += 1;
                        debug!(run_spec = %path, offer = %offer.id, "instance matched");
                    }
                    OfferMatchResult::NoMatch(reasons) => {
                        debug!(run_spec = %path, offer = %offer.id, ?reasons, "no match");
                        break;
                    }
                }
            }
        }

        if payloads.is_empty() {
            if let Err(e) = self.launcher.decline(&offer.id).await {
                warn!(offer = %offer.id, error = %e, "decline failed");
            }
            return 0;
        }

        info!(offer = %offer.id, count = launched, "launching tasks");
        if let Err(e) = self.launcher.launch(&offer.id, payloads).await {
            // The manager will time the offer out; the instances will be
            // reconciled away as unknown.
            warn!(offer = %offer.id, error = %e, "launch failed");
        }
        launched
    }

    /// Fold a status update into the tracker and the backoff state.
    pub async fn handle_status_update(&self, update: StatusUpdate) {
        let Some(instance) = self.tracker.instance_by_task(&update.task_id).await else {
            debug!(task_id = %update.task_id, "status update for unknown task");
            return;
        };
        let path = instance.id.run_spec.clone();
        let condition = update.state.condition();
        let now = now_ms();
        let was_running = instance
            .tasks
            .get(&update.task_id)
            .is_some_and(|t| t.status.started_at.is_some());

        let result = self
            .tracker
            .process(InstanceUpdateOp::MesosUpdate {
                instance_id: instance.id.clone(),
                task_id: update.task_id.clone(),
                condition,
                status: update.clone(),
                now,
            })
            .await;
        if let Err(e) = result {
            warn!(task_id = %update.task_id, error = %e, "status update failed");
            return;
        }

        match condition {
            Condition::Running => self.queue.on_launch_succeeded(&path),
            c if c.is_terminal() && !was_running => {
                // Died before ever running: counts against the backoff.
                self.queue.on_launch_failed(&path, now);
            }
            _ => {}
        }
    }
}

/// Build the provisional instance for a successful match.
fn instance_from_match(
    m: &OfferMatch,
    spec: &RunSpec,
    offer: &ResourceOffer,
    now: Timestamp,
) -> Instance {
    let host_ports: Vec<u32> = m.port_bindings.iter().flatten().copied().collect();
    let task_status = TaskStatus {
        staged_at: now,
        started_at: None,
        condition: Condition::Created,
        net_info: NetworkInfo {
            ip_addresses: Vec::new(),
            host_ports,
        },
    };
    let tasks = match spec {
        RunSpec::App(_) => vec![Task {
            id: m.instance_id.task_id(),
            status: task_status,
            kind: TaskKind::LaunchedEphemeral,
        }],
        RunSpec::Pod(pod) => pod
            .containers
            .iter()
            .map(|c| Task {
                id: m.instance_id.container_task_id(&c.name),
                status: task_status.clone(),
                kind: TaskKind::LaunchedEphemeral,
            })
            .collect(),
    };
    Instance::provisioned(
        m.instance_id.clone(),
        AgentInfo {
            host: offer.hostname.clone(),
            agent_id: Some(offer.agent_id.clone()),
            attributes: offer.attributes.clone(),
        },
        spec.version(),
        spec.unreachable_strategy(),
        tasks,
        now,
    )
}

/// Remove the consumed portions from the offer so further matches in the
/// same pass see only what is left.
fn shrink_offer(offer: &mut ResourceOffer, m: &OfferMatch) {
    for portion in &m.selection {
        for res in offer.resources.iter_mut() {
            if res.name == portion.name && res.role == portion.role {
                if let ResourceValue::Scalar(v) = &mut res.value {
                    if *v >= portion.amount {
                        *v -= portion.amount;
                        break;
                    }
                }
            }
        }
    }
    let mut allocated: Vec<u32> = m.port_bindings.iter().flatten().copied().collect();
    if allocated.is_empty() {
        return;
    }
    allocated.sort_unstable();
    for res in offer.resources.iter_mut() {
        if let ResourceValue::Ranges(ranges) = &mut res.value {
            let mut next = Vec::new();
            for range in ranges.iter() {
                let mut begin = range.begin;
                for port in allocated.iter().filter(|p| range.contains(**p)) {
                    if *port > begin {
                        next.push(flotilla_match::PortRange {
                            begin,
                            end: port - 1,
                        });
                    }
                    begin = port + 1;
                }
                if begin <= range.end {
                    next.push(flotilla_match::PortRange {
                        begin,
                        end: range.end,
                    });
                }
            }
            *ranges = next;
        }
    }
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
