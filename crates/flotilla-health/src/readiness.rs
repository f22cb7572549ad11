//! Readiness tracking — deployment-time gating, separate from
//! steady-state health.
//!
//! A readiness tracker is composed into a deployment step controller: it
//! subscribes to instances as they start running, polls their readiness
//! endpoints, and reports when every declared check of an instance has
//! passed at least once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use flotilla_core::{AppSpec, Condition, Instance, InstanceId, ReadinessCheck, RunSpec, TaskId};

/// One readiness probe outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessResult {
    pub name: String,
    pub task_id: TaskId,
    pub ready: bool,
    pub last_response: Option<String>,
}

/// Executes one readiness probe against one instance.
#[async_trait]
pub trait ReadinessExecutor: Send + Sync {
    async fn probe(
        &self,
        check: &ReadinessCheck,
        spec: &AppSpec,
        instance: &Instance,
    ) -> ReadinessResult;
}

/// HTTP readiness executor: ready iff the response status is in the
/// check's accepted set.
pub struct HttpReadinessExecutor;

#[async_trait]
impl ReadinessExecutor for HttpReadinessExecutor {
    async fn probe(
        &self,
        check: &ReadinessCheck,
        spec: &AppSpec,
        instance: &Instance,
    ) -> ReadinessResult {
        let task_id = instance
            .tasks
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| instance.id.task_id());
        let Some(port) = resolve_port(check, spec, instance) else {
            return ReadinessResult {
                name: check.name.clone(),
                task_id,
                ready: false,
                last_response: None,
            };
        };
        // The decision compares the actual status code against the
        // configured set, so the request is issued directly instead of
        // going through the 2xx-collapsing health probe.
        match fetch_status(
            &instance.agent.host,
            port,
            &check.path,
            check.timeout,
            check.preserve_last_response,
        )
        .await
        {
            Some((status, body)) => ReadinessResult {
                name: check.name.clone(),
                task_id,
                ready: check.ready_status_codes.contains(&status),
                last_response: body,
            },
            None => ReadinessResult {
                name: check.name.clone(),
                task_id,
                ready: false,
                last_response: None,
            },
        }
    }
}

/// GET the readiness endpoint and report the raw status code, plus the
/// body when the check preserves responses. `None` on transport errors
/// and timeouts.
async fn fetch_status(
    host: &str,
    port: u32,
    path: &str,
    timeout: Duration,
    want_body: bool,
) -> Option<(u16, Option<String>)> {
    let address = format!("{host}:{port}");
    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(%address, error = %e, "readiness probe connection failed");
                return None;
            }
        };
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(%address, error = %e, "readiness probe handshake failed");
                return None;
            }
        };
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", host)
            .header("user-agent", "flotilla-health/0.4")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .ok()?;
        let resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(%address, error = %e, "readiness probe request failed");
                return None;
            }
        };
        let status = resp.status().as_u16();
        let body = if want_body {
            use http_body_util::BodyExt;
            resp.into_body()
                .collect()
                .await
                .ok()
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
        } else {
            None
        };
        Some((status, body))
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%address, "readiness probe timed out");
            None
        }
    }
}

/// Find the host port the named declared port was bound to.
fn resolve_port(check: &ReadinessCheck, spec: &AppSpec, instance: &Instance) -> Option<u32> {
    let declared = spec.declared_ports();
    let index = declared
        .iter()
        .position(|p| p.name.as_deref() == Some(check.port_name.as_str()))?;
    let task = instance.tasks.values().next()?;
    task.status.net_info.host_ports.get(index).copied()
}

/// Tracks readiness of instances during one deployment step.
pub struct ReadinessTracker {
    checks: Vec<ReadinessCheck>,
    /// Check names that passed, per instance.
    passed: BTreeMap<InstanceId, BTreeSet<String>>,
    ready: BTreeSet<InstanceId>,
    subscriptions: BTreeMap<InstanceId, Vec<JoinHandle<()>>>,
    results_tx: mpsc::UnboundedSender<(InstanceId, ReadinessResult)>,
    results_rx: Option<mpsc::UnboundedReceiver<(InstanceId, ReadinessResult)>>,
}

impl ReadinessTracker {
    pub fn for_spec(spec: &RunSpec) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            checks: spec.readiness_checks().to_vec(),
            passed: BTreeMap::new(),
            ready: BTreeSet::new(),
            subscriptions: BTreeMap::new(),
            results_tx,
            results_rx: Some(results_rx),
        }
    }

    pub fn has_readiness_checks(&self) -> bool {
        !self.checks.is_empty()
    }

    pub fn is_ready(&self, id: &InstanceId) -> bool {
        self.ready.contains(id)
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Mark an instance ready directly (no readiness checks declared).
    pub fn mark_ready(&mut self, id: InstanceId) -> bool {
        self.ready.insert(id)
    }

    /// Begin polling the readiness endpoints of a running instance.
    ///
    /// Each declared check gets its own poll loop; loops stop once their
    /// check reports ready, or when the instance is unsubscribed.
    pub fn subscribe(
        &mut self,
        spec: &AppSpec,
        instance: &Instance,
        executor: Arc<dyn ReadinessExecutor>,
    ) {
        if self.subscriptions.contains_key(&instance.id) {
            return;
        }
        let mut handles = Vec::new();
        for check in &self.checks {
            let check = check.clone();
            let spec = spec.clone();
            let instance = instance.clone();
            let tx = self.results_tx.clone();
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let result = executor.probe(&check, &spec, &instance).await;
                    let ready = result.ready;
                    if tx.send((instance.id.clone(), result)).is_err() {
                        return;
                    }
                    if ready {
                        return;
                    }
                    tokio::time::sleep(check.interval).await;
                }
            }));
        }
        debug!(instance_id = %instance.id, checks = self.checks.len(), "readiness subscription started");
        self.subscriptions.insert(instance.id.clone(), handles);
    }

    /// Drop an instance entirely (terminal or lost during the rollout).
    pub fn unsubscribe(&mut self, id: &InstanceId) {
        if let Some(handles) = self.subscriptions.remove(id) {
            for handle in handles {
                handle.abort();
            }
        }
        self.passed.remove(id);
        self.ready.remove(id);
    }

    /// Wait for the next readiness result. `None` when the receiver was
    /// taken out with [`Self::take_results`].
    pub async fn next_result(&mut self) -> Option<(InstanceId, ReadinessResult)> {
        match self.results_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Move the result stream out, for callers that select over it
    /// alongside other event sources.
    pub fn take_results(&mut self) -> Option<mpsc::UnboundedReceiver<(InstanceId, ReadinessResult)>> {
        self.results_rx.take()
    }

    /// Fold a result; returns true when the instance just became fully
    /// ready (every declared check passed at least once).
    pub fn handle_result(&mut self, id: &InstanceId, result: &ReadinessResult) -> bool {
        if !result.ready {
            return false;
        }
        let passed = self.passed.entry(id.clone()).or_default();
        passed.insert(result.name.clone());
        let all = self
            .checks
            .iter()
            .all(|c| passed.contains(&c.name));
        if all && self.ready.insert(id.clone()) {
            info!(instance_id = %id, "instance passed all readiness checks");
            return true;
        }
        false
    }
}

/// The per-instance "ready for rollout purposes" decision rule.
///
/// - no health checks, no readiness checks: ready on Running
/// - health only: ready when healthy
/// - readiness only: ready when all checks passed on a Running instance
/// - both: healthy AND all checks passed
pub fn rollout_ready(
    has_health_checks: bool,
    has_readiness_checks: bool,
    condition: Condition,
    healthy: Option<bool>,
    readiness_passed: bool,
) -> bool {
    if condition != Condition::Running {
        return false;
    }
    let health_ok = !has_health_checks || healthy == Some(true);
    let readiness_ok = !has_readiness_checks || readiness_passed;
    health_ok && readiness_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{AgentInfo, PathId, UnreachableStrategy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec_with_checks(names: &[&str]) -> RunSpec {
        let mut app = AppSpec::new(PathId::parse("/api").unwrap());
        app.readiness_checks = names
            .iter()
            .map(|n| ReadinessCheck {
                name: n.to_string(),
                interval: Duration::from_millis(10),
                ..ReadinessCheck::default()
            })
            .collect();
        RunSpec::App(app)
    }

    fn instance() -> Instance {
        Instance::provisioned(
            InstanceId::new(&PathId::parse("/api").unwrap()),
            AgentInfo::default(),
            1,
            UnreachableStrategy::default(),
            Vec::new(),
            0,
        )
    }

    fn result(name: &str, ready: bool) -> ReadinessResult {
        ReadinessResult {
            name: name.to_string(),
            task_id: TaskId("t".to_string()),
            ready,
            last_response: None,
        }
    }

    #[tokio::test]
    async fn instance_ready_when_all_checks_pass_once() {
        let spec = spec_with_checks(&["a", "b"]);
        let mut tracker = ReadinessTracker::for_spec(&spec);
        let id = instance().id;

        assert!(!tracker.handle_result(&id, &result("a", true)));
        assert!(!tracker.is_ready(&id));
        assert!(tracker.handle_result(&id, &result("b", true)));
        assert!(tracker.is_ready(&id));
        // Idempotent.
        assert!(!tracker.handle_result(&id, &result("b", true)));
    }

    #[tokio::test]
    async fn not_ready_results_do_not_advance() {
        let spec = spec_with_checks(&["a"]);
        let mut tracker = ReadinessTracker::for_spec(&spec);
        let id = instance().id;
        assert!(!tracker.handle_result(&id, &result("a", false)));
        assert!(!tracker.is_ready(&id));
    }

    #[tokio::test]
    async fn unsubscribe_removes_all_traces() {
        let spec = spec_with_checks(&["a"]);
        let mut tracker = ReadinessTracker::for_spec(&spec);
        let id = instance().id;
        tracker.handle_result(&id, &result("a", true));
        assert!(tracker.is_ready(&id));
        tracker.unsubscribe(&id);
        assert!(!tracker.is_ready(&id));
        assert_eq!(tracker.ready_count(), 0);
    }

    struct CountingExecutor {
        calls: AtomicUsize,
        ready_after: usize,
    }

    #[async_trait]
    impl ReadinessExecutor for CountingExecutor {
        async fn probe(
            &self,
            check: &ReadinessCheck,
            _spec: &AppSpec,
            instance: &Instance,
        ) -> ReadinessResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            ReadinessResult {
                name: check.name.clone(),
                task_id: instance.id.task_id(),
                ready: n >= self.ready_after,
                last_response: None,
            }
        }
    }

    #[tokio::test]
    async fn subscription_polls_until_ready() {
        let spec = spec_with_checks(&["a"]);
        let RunSpec::App(app) = &spec else { unreachable!() };
        let mut tracker = ReadinessTracker::for_spec(&spec);
        let inst = instance();
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
            ready_after: 3,
        });
        tracker.subscribe(app, &inst, executor.clone());

        let mut became_ready = false;
        while let Some((id, result)) = tracker.next_result().await {
            if tracker.handle_result(&id, &result) {
                became_ready = true;
                break;
            }
        }
        assert!(became_ready);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    async fn status_listener(response: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn served_app_and_instance(port: u16) -> (AppSpec, Instance) {
        use flotilla_core::{Condition, NetworkInfo, PortDefinition, Task, TaskKind, TaskStatus};

        let mut app = AppSpec::new(PathId::parse("/api").unwrap());
        app.port_definitions = vec![PortDefinition {
            port: 0,
            name: Some("http-api".to_string()),
            ..PortDefinition::default()
        }];

        let id = InstanceId::new(&app.id);
        let task = Task {
            id: id.task_id(),
            status: TaskStatus {
                staged_at: 0,
                started_at: Some(0),
                condition: Condition::Running,
                net_info: NetworkInfo {
                    ip_addresses: Vec::new(),
                    host_ports: vec![u32::from(port)],
                },
            },
            kind: TaskKind::LaunchedEphemeral,
        };
        let mut instance = Instance::provisioned(
            id,
            AgentInfo {
                host: "127.0.0.1".to_string(),
                agent_id: None,
                attributes: Default::default(),
            },
            1,
            UnreachableStrategy::default(),
            vec![task],
            0,
        );
        instance.state.condition = Condition::Running;
        (app, instance)
    }

    fn check_accepting(codes: Vec<u16>) -> ReadinessCheck {
        ReadinessCheck {
            ready_status_codes: codes,
            timeout: Duration::from_secs(1),
            ..ReadinessCheck::default()
        }
    }

    #[tokio::test]
    async fn http_executor_accepts_a_configured_status_code() {
        let port = status_listener("HTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n").await;
        let (app, instance) = served_app_and_instance(port);

        let result = HttpReadinessExecutor
            .probe(&check_accepting(vec![201]), &app, &instance)
            .await;
        assert!(result.ready);
    }

    #[tokio::test]
    async fn http_executor_rejects_an_unconfigured_2xx() {
        // A plain 200 must not satisfy a check that only accepts 201.
        let port = status_listener("HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n").await;
        let (app, instance) = served_app_and_instance(port);

        let result = HttpReadinessExecutor
            .probe(&check_accepting(vec![201]), &app, &instance)
            .await;
        assert!(!result.ready);

        let result = HttpReadinessExecutor
            .probe(&check_accepting(vec![200]), &app, &instance)
            .await;
        assert!(result.ready);
    }

    #[tokio::test]
    async fn http_executor_preserves_the_body_when_asked() {
        let port = status_listener("HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nready").await;
        let (app, instance) = served_app_and_instance(port);

        let mut check = check_accepting(vec![200]);
        check.preserve_last_response = true;
        let result = HttpReadinessExecutor.probe(&check, &app, &instance).await;
        assert!(result.ready);
        assert_eq!(result.last_response.as_deref(), Some("ready"));
    }

    #[tokio::test]
    async fn http_executor_not_ready_on_transport_failure() {
        let (app, instance) = served_app_and_instance(1);
        let result = HttpReadinessExecutor
            .probe(&check_accepting(vec![200]), &app, &instance)
            .await;
        assert!(!result.ready);
        assert!(result.last_response.is_none());
    }

    #[test]
    fn decision_rule_matrix() {
        use Condition::Running;
        // No checks at all: Running is enough.
        assert!(rollout_ready(false, false, Running, None, false));
        assert!(!rollout_ready(false, false, Condition::Staging, None, false));
        // Health only.
        assert!(rollout_ready(true, false, Running, Some(true), false));
        assert!(!rollout_ready(true, false, Running, None, false));
        assert!(!rollout_ready(true, false, Running, Some(false), false));
        // Readiness only.
        assert!(rollout_ready(false, true, Running, None, true));
        assert!(!rollout_ready(false, true, Running, None, false));
        // Both.
        assert!(rollout_ready(true, true, Running, Some(true), true));
        assert!(!rollout_ready(true, true, Running, Some(true), false));
        assert!(!rollout_ready(true, true, Running, Some(false), true));
    }
}
