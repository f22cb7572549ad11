//! Health and readiness check definitions carried by run specs.
//!
//! Protocol checks split into two capability classes: `Http`/`Https`/`Tcp`
//! are probed by the orchestrator itself, while the `Mesos*`/`Command`
//! variants are handed to the external manager inside the launch
//! descriptor. The split is a predicate on the variant, not a hierarchy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where a check finds the port to probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortReference {
    /// Positional index into the declared ports of the spec.
    Index(usize),
    /// Literal port number.
    Literal(u16),
}

impl Default for PortReference {
    fn default() -> Self {
        PortReference::Index(0)
    }
}

/// Knobs shared by every check variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPolicy {
    /// Failures within this window after launch are suppressed until the
    /// first success.
    pub grace_period: Duration,
    /// Time between probes.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Consecutive failures before the instance is killed.
    pub max_consecutive_failures: u32,
}

impl Default for CheckPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(20),
            max_consecutive_failures: 3,
        }
    }
}

/// A health check definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum HealthCheck {
    Http {
        path: String,
        port: PortReference,
        #[serde(flatten)]
        policy: CheckPolicy,
    },
    Https {
        path: String,
        port: PortReference,
        #[serde(flatten)]
        policy: CheckPolicy,
    },
    Tcp {
        port: PortReference,
        #[serde(flatten)]
        policy: CheckPolicy,
    },
    MesosHttp {
        path: String,
        port: PortReference,
        #[serde(flatten)]
        policy: CheckPolicy,
    },
    MesosHttps {
        path: String,
        port: PortReference,
        #[serde(flatten)]
        policy: CheckPolicy,
    },
    MesosTcp {
        port: PortReference,
        #[serde(flatten)]
        policy: CheckPolicy,
    },
    Command {
        command: String,
        #[serde(flatten)]
        policy: CheckPolicy,
    },
}

impl HealthCheck {
    /// True when the external manager executes this check and reports the
    /// outcome through status updates.
    pub fn delegated(&self) -> bool {
        matches!(
            self,
            HealthCheck::MesosHttp { .. }
                | HealthCheck::MesosHttps { .. }
                | HealthCheck::MesosTcp { .. }
                | HealthCheck::Command { .. }
        )
    }

    pub fn policy(&self) -> &CheckPolicy {
        match self {
            HealthCheck::Http { policy, .. }
            | HealthCheck::Https { policy, .. }
            | HealthCheck::Tcp { policy, .. }
            | HealthCheck::MesosHttp { policy, .. }
            | HealthCheck::MesosHttps { policy, .. }
            | HealthCheck::MesosTcp { policy, .. }
            | HealthCheck::Command { policy, .. } => policy,
        }
    }

    /// Port reference for protocol checks; `None` for command checks.
    pub fn port(&self) -> Option<PortReference> {
        match self {
            HealthCheck::Http { port, .. }
            | HealthCheck::Https { port, .. }
            | HealthCheck::Tcp { port, .. }
            | HealthCheck::MesosHttp { port, .. }
            | HealthCheck::MesosHttps { port, .. }
            | HealthCheck::MesosTcp { port, .. } => Some(*port),
            HealthCheck::Command { .. } => None,
        }
    }
}

/// Readiness checks gate deployment progress, not steady-state health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub name: String,
    /// HTTP path probed on the named port.
    pub path: String,
    /// Name of the declared port to probe.
    pub port_name: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Response codes counted as ready.
    pub ready_status_codes: Vec<u16>,
    /// Keep the last probe body for surfacing through the API layer.
    pub preserve_last_response: bool,
}

impl Default for ReadinessCheck {
    fn default() -> Self {
        Self {
            name: "readiness".to_string(),
            path: "/".to_string(),
            port_name: "http-api".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            ready_status_codes: vec![200],
            preserve_last_response: false,
        }
    }
}
