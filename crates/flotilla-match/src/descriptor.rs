//! Launch descriptors — the concrete payload handed to the external
//! manager when a match succeeds.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flotilla_core::{
    AppSpec, DeclaredPort, HealthCheck, Network, Protocol, TaskId, VolumeSpec,
};

use crate::offer::ResourcePortion;

/// Scope of a discovery port entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortScope {
    Host,
    Container,
}

/// One discovery entry per declared port, in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPort {
    pub name: Option<String>,
    pub protocol: Protocol,
    pub scope: PortScope,
    /// Allocated host port, or the container port for container scope.
    pub number: u32,
}

/// Container section of the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub image: String,
    pub force_pull: bool,
    /// (host port, container port, protocol) triples for bridged ports.
    pub port_mappings: Vec<(u32, u32, Protocol)>,
    pub volumes: Vec<VolumeSpec>,
}

/// A delegated health check, translated for the manager to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelegatedCheck {
    Http {
        path: String,
        port: u32,
        scheme: String,
        interval_secs: u64,
        timeout_secs: u64,
        grace_period_secs: u64,
        max_consecutive_failures: u32,
    },
    Tcp {
        port: u32,
        interval_secs: u64,
        timeout_secs: u64,
        grace_period_secs: u64,
        max_consecutive_failures: u32,
    },
    Command {
        command: String,
        interval_secs: u64,
        timeout_secs: u64,
        grace_period_secs: u64,
        max_consecutive_failures: u32,
    },
}

/// Everything needed to launch one task out of one offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    pub task_id: TaskId,
    pub offer_id: String,
    pub agent_id: String,
    pub hostname: String,
    pub resources: Vec<ResourcePortion>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub container: Option<ContainerInfo>,
    pub discovery: Vec<DiscoveryPort>,
    pub networks: Vec<Network>,
    pub delegated_checks: Vec<DelegatedCheck>,
    pub kill_grace_period: Option<Duration>,
    pub labels: BTreeMap<String, String>,
    /// Host ports in declared order, `None` for container-only slots.
    pub port_bindings: Vec<Option<u32>>,
}

impl LaunchDescriptor {
    /// Serialize for the driver boundary.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Discovery info: one entry per declared port, host scope when a host
/// port was allocated, container scope otherwise.
pub fn discovery_ports(
    declared: &[DeclaredPort],
    bindings: &[Option<u32>],
    container_ports: &[u32],
) -> Vec<DiscoveryPort> {
    declared
        .iter()
        .enumerate()
        .map(|(i, slot)| match bindings.get(i).copied().flatten() {
            Some(host_port) => DiscoveryPort {
                name: slot.name.clone(),
                protocol: slot.protocol,
                scope: PortScope::Host,
                number: host_port,
            },
            None => DiscoveryPort {
                name: slot.name.clone(),
                protocol: slot.protocol,
                scope: PortScope::Container,
                number: container_ports.get(i).copied().unwrap_or(0),
            },
        })
        .collect()
}

/// Translate the delegated health checks of a spec.
pub fn delegated_checks(spec: &AppSpec, bindings: &[Option<u32>]) -> Vec<DelegatedCheck> {
    spec.health_checks
        .iter()
        .filter(|c| c.delegated())
        .filter_map(|check| {
            let policy = check.policy();
            let resolve = |port: flotilla_core::PortReference| -> Option<u32> {
                match port {
                    flotilla_core::PortReference::Literal(p) => Some(u32::from(p)),
                    flotilla_core::PortReference::Index(i) => bindings.get(i).copied().flatten(),
                }
            };
            match check {
                HealthCheck::MesosHttp { path, port, .. } => Some(DelegatedCheck::Http {
                    path: path.clone(),
                    port: resolve(*port)?,
                    scheme: "http".to_string(),
                    interval_secs: policy.interval.as_secs(),
                    timeout_secs: policy.timeout.as_secs(),
                    grace_period_secs: policy.grace_period.as_secs(),
                    max_consecutive_failures: policy.max_consecutive_failures,
                }),
                HealthCheck::MesosHttps { path, port, .. } => Some(DelegatedCheck::Http {
                    path: path.clone(),
                    port: resolve(*port)?,
                    scheme: "https".to_string(),
                    interval_secs: policy.interval.as_secs(),
                    timeout_secs: policy.timeout.as_secs(),
                    grace_period_secs: policy.grace_period.as_secs(),
                    max_consecutive_failures: policy.max_consecutive_failures,
                }),
                HealthCheck::MesosTcp { port, .. } => Some(DelegatedCheck::Tcp {
                    port: resolve(*port)?,
                    interval_secs: policy.interval.as_secs(),
                    timeout_secs: policy.timeout.as_secs(),
                    grace_period_secs: policy.grace_period.as_secs(),
                    max_consecutive_failures: policy.max_consecutive_failures,
                }),
                HealthCheck::Command { command, .. } => Some(DelegatedCheck::Command {
                    command: command.clone(),
                    interval_secs: policy.interval.as_secs(),
                    timeout_secs: policy.timeout.as_secs(),
                    grace_period_secs: policy.grace_period.as_secs(),
                    max_consecutive_failures: policy.max_consecutive_failures,
                }),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{CheckPolicy, PathId, PortReference};

    #[test]
    fn discovery_scopes_follow_bindings() {
        let declared = vec![
            DeclaredPort {
                host_port: Some(0),
                name: Some("http".to_string()),
                protocol: Protocol::Tcp,
                labels: BTreeMap::new(),
            },
            DeclaredPort {
                host_port: None,
                name: Some("admin".to_string()),
                protocol: Protocol::Tcp,
                labels: BTreeMap::new(),
            },
        ];
        let ports = discovery_ports(&declared, &[Some(31000), None], &[8080, 9090]);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].scope, PortScope::Host);
        assert_eq!(ports[0].number, 31000);
        assert_eq!(ports[1].scope, PortScope::Container);
        assert_eq!(ports[1].number, 9090);
    }

    #[test]
    fn only_delegated_checks_are_translated() {
        let mut spec = AppSpec::new(PathId::parse("/a").unwrap());
        spec.health_checks = vec![
            HealthCheck::Http {
                path: "/health".to_string(),
                port: PortReference::Index(0),
                policy: CheckPolicy::default(),
            },
            HealthCheck::Command {
                command: "pgrep app".to_string(),
                policy: CheckPolicy::default(),
            },
        ];
        let translated = delegated_checks(&spec, &[Some(31000)]);
        assert_eq!(translated.len(), 1);
        assert!(matches!(translated[0], DelegatedCheck::Command { .. }));
    }

    #[test]
    fn delegated_http_resolves_port_index() {
        let mut spec = AppSpec::new(PathId::parse("/a").unwrap());
        spec.health_checks = vec![HealthCheck::MesosHttp {
            path: "/ping".to_string(),
            port: PortReference::Index(0),
            policy: CheckPolicy::default(),
        }];
        let translated = delegated_checks(&spec, &[Some(31007)]);
        match &translated[0] {
            DelegatedCheck::Http { port, scheme, .. } => {
                assert_eq!(*port, 31007);
                assert_eq!(scheme, "http");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn payload_serializes() {
        let descriptor = LaunchDescriptor {
            task_id: TaskId("a.1".to_string()),
            offer_id: "o1".to_string(),
            agent_id: "agent".to_string(),
            hostname: "h".to_string(),
            resources: Vec::new(),
            command: Some("./run".to_string()),
            args: Vec::new(),
            env: BTreeMap::new(),
            container: None,
            discovery: Vec::new(),
            networks: Vec::new(),
            delegated_checks: Vec::new(),
            kill_grace_period: Some(Duration::from_secs(10)),
            labels: BTreeMap::new(),
            port_bindings: vec![Some(31000)],
        };
        let payload = descriptor.to_payload();
        assert_eq!(payload["task_id"], "a.1");
        assert_eq!(payload["command"], "./run");
    }
}
