//! Run specifications: applications and pods.
//!
//! A run spec is the declared shape of a workload. Apps are replicated
//! single-container services; pods co-schedule several containers in one
//! sandbox. Both carry the strategies the runtime layers act on.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::check::{HealthCheck, ReadinessCheck};
use crate::path::PathId;
use crate::strategy::{
    BackoffStrategy, KillSelection, Residency, UnreachableStrategy, UpgradeStrategy,
};

/// Unix milliseconds. Spec versions are timestamps.
pub type Timestamp = u64;

/// Scalar resource demand of a single instance (or pod container).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub gpus: f64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            mem: 128.0,
            disk: 0.0,
            gpus: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// A host-level port requirement declared on an app.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortDefinition {
    /// Requested host port; `0` asks for any free port from the offer.
    pub port: u32,
    pub name: Option<String>,
    pub protocol: Protocol,
    pub labels: BTreeMap<String, String>,
}

/// A container-network port mapping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u32,
    /// `None` keeps the port container-only; `Some(0)` asks for any host
    /// port; a fixed value must be present in the offer.
    pub host_port: Option<u32>,
    pub name: Option<String>,
    pub protocol: Protocol,
    pub labels: BTreeMap<String, String>,
}

/// Placement constraint over agent attributes and the running fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Attribute name, or `hostname`.
    pub field: String,
    pub operator: ConstraintOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintOp {
    /// Field value unused by any running instance.
    Unique,
    /// Field equals the value; an empty value pins all instances to
    /// whichever value the first one landed on.
    Cluster(String),
    /// Spread instances evenly across this many field values (0 = across
    /// all observed values).
    GroupBy(u32),
    /// Field matches the regex.
    Like(String),
    /// Field does not match the regex.
    Unlike(String),
    /// At most this many instances per field value.
    MaxPer(u32),
}

/// Container settings for an app.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: Option<String>,
    pub port_mappings: Vec<PortMapping>,
    pub volumes: Vec<VolumeSpec>,
    pub force_pull_image: bool,
}

/// A volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeSpec {
    Host {
        host_path: String,
        container_path: String,
        read_only: bool,
    },
    Persistent {
        container_path: String,
        /// Size in MiB of the persistent volume to reserve.
        size_mib: u64,
    },
}

/// Network attachment for container-networked workloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Network {
    Host,
    Container { name: String },
    Bridge,
}

/// Artifact fetched into the sandbox before launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub url: String,
    /// Sandbox-relative destination; `None` keeps the URL basename.
    pub dest: Option<String>,
    pub executable: bool,
}

/// Distinguishes configuration changes from scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Advanced only by spec changes.
    pub last_config_change_at: Timestamp,
    /// Advanced by every mutation, including pure scaling.
    pub last_scaling_at: Timestamp,
}

impl VersionInfo {
    pub fn for_new_spec(version: Timestamp) -> Self {
        Self {
            last_config_change_at: version,
            last_scaling_at: version,
        }
    }

    pub fn scaled_at(self, version: Timestamp) -> Self {
        Self {
            last_scaling_at: version,
            ..self
        }
    }

    pub fn config_changed_at(self, version: Timestamp) -> Self {
        Self {
            last_config_change_at: version,
            last_scaling_at: version,
        }
    }
}

/// A replicated single-container service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: PathId,
    pub cmd: Option<String>,
    pub args: Vec<String>,
    pub container: Option<ContainerSpec>,
    pub instances: u32,
    pub resources: ResourceRequest,
    pub port_definitions: Vec<PortDefinition>,
    /// Forbid remapping of non-zero declared ports.
    pub require_ports: bool,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub artifacts: Vec<Artifact>,
    pub health_checks: Vec<HealthCheck>,
    pub readiness_checks: Vec<ReadinessCheck>,
    pub constraints: Vec<Constraint>,
    pub dependencies: BTreeSet<PathId>,
    pub networks: Vec<Network>,
    pub upgrade_strategy: UpgradeStrategy,
    pub backoff: BackoffStrategy,
    pub unreachable_strategy: UnreachableStrategy,
    pub kill_selection: KillSelection,
    pub residency: Option<Residency>,
    pub task_kill_grace_period: Option<Duration>,
    /// Offer roles this app accepts; `None` falls back to the configured
    /// default set.
    pub accepted_resource_roles: Option<BTreeSet<String>>,
    pub version: Timestamp,
    pub version_info: VersionInfo,
}

impl AppSpec {
    /// Minimal app used as a starting point by builders and tests.
    pub fn new(id: PathId) -> Self {
        Self {
            id,
            cmd: None,
            args: Vec::new(),
            container: None,
            instances: 1,
            resources: ResourceRequest::default(),
            port_definitions: Vec::new(),
            require_ports: false,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            artifacts: Vec::new(),
            health_checks: Vec::new(),
            readiness_checks: Vec::new(),
            constraints: Vec::new(),
            dependencies: BTreeSet::new(),
            networks: vec![Network::Host],
            upgrade_strategy: UpgradeStrategy::default(),
            backoff: BackoffStrategy::default(),
            unreachable_strategy: UnreachableStrategy::default(),
            kill_selection: KillSelection::default(),
            residency: None,
            task_kill_grace_period: None,
            accepted_resource_roles: None,
            version: 0,
            version_info: VersionInfo::default(),
        }
    }

    pub fn is_resident(&self) -> bool {
        self.residency.is_some()
    }

    /// Declared ports in positional order, normalized across the two
    /// declaration styles.
    pub fn declared_ports(&self) -> Vec<DeclaredPort> {
        if let Some(container) = &self.container {
            if !container.port_mappings.is_empty() {
                return container
                    .port_mappings
                    .iter()
                    .map(|m| DeclaredPort {
                        host_port: m.host_port,
                        name: m.name.clone(),
                        protocol: m.protocol,
                        labels: m.labels.clone(),
                    })
                    .collect();
            }
        }
        self.port_definitions
            .iter()
            .map(|d| DeclaredPort {
                host_port: Some(d.port),
                name: d.name.clone(),
                protocol: d.protocol,
                labels: d.labels.clone(),
            })
            .collect()
    }

    /// True when `newer` differs from `self` in anything but `instances`.
    ///
    /// Version fields are excluded from the comparison; they record the
    /// outcome of this decision rather than feeding it.
    pub fn is_upgrade(&self, newer: &AppSpec) -> bool {
        let mut a = self.clone();
        let mut b = newer.clone();
        a.instances = 0;
        b.instances = 0;
        a.version = 0;
        b.version = 0;
        a.version_info = VersionInfo::default();
        b.version_info = VersionInfo::default();
        a != b
    }

    /// Scale-only successor of this spec.
    pub fn with_instances(&self, instances: u32, version: Timestamp) -> AppSpec {
        let mut next = self.clone();
        next.instances = instances;
        next.version = version;
        next.version_info = next.version_info.scaled_at(version);
        next
    }
}

/// A positional port slot, normalized from definitions or mappings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredPort {
    /// `None` means container-only (no host exposure).
    pub host_port: Option<u32>,
    pub name: Option<String>,
    pub protocol: Protocol,
    pub labels: BTreeMap<String, String>,
}

/// One container of a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodContainer {
    pub name: String,
    pub resources: ResourceRequest,
    pub image: Option<String>,
    /// Endpoints behave like port mappings scoped to this container.
    pub endpoints: Vec<PortMapping>,
    pub health_check: Option<HealthCheck>,
    pub volume_mounts: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// A co-scheduled group of containers sharing sandbox, volumes, networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: PathId,
    pub containers: Vec<PodContainer>,
    pub volumes: Vec<VolumeSpec>,
    pub networks: Vec<Network>,
    pub instances: u32,
    pub labels: BTreeMap<String, String>,
    pub constraints: Vec<Constraint>,
    pub dependencies: BTreeSet<PathId>,
    pub upgrade_strategy: UpgradeStrategy,
    pub backoff: BackoffStrategy,
    pub unreachable_strategy: UnreachableStrategy,
    pub kill_selection: KillSelection,
    pub version: Timestamp,
    pub version_info: VersionInfo,
}

impl PodSpec {
    pub fn new(id: PathId) -> Self {
        Self {
            id,
            containers: Vec::new(),
            volumes: Vec::new(),
            networks: vec![Network::Host],
            instances: 1,
            labels: BTreeMap::new(),
            constraints: Vec::new(),
            dependencies: BTreeSet::new(),
            upgrade_strategy: UpgradeStrategy::default(),
            backoff: BackoffStrategy::default(),
            unreachable_strategy: UnreachableStrategy::default(),
            kill_selection: KillSelection::default(),
            version: 0,
            version_info: VersionInfo::default(),
        }
    }

    /// Aggregate demand over all containers.
    pub fn resources(&self) -> ResourceRequest {
        let mut total = ResourceRequest {
            cpus: 0.0,
            mem: 0.0,
            disk: 0.0,
            gpus: 0.0,
        };
        for c in &self.containers {
            total.cpus += c.resources.cpus;
            total.mem += c.resources.mem;
            total.disk += c.resources.disk;
            total.gpus += c.resources.gpus;
        }
        total
    }

    pub fn is_upgrade(&self, newer: &PodSpec) -> bool {
        let mut a = self.clone();
        let mut b = newer.clone();
        a.instances = 0;
        b.instances = 0;
        a.version = 0;
        b.version = 0;
        a.version_info = VersionInfo::default();
        b.version_info = VersionInfo::default();
        a != b
    }

    pub fn with_instances(&self, instances: u32, version: Timestamp) -> PodSpec {
        let mut next = self.clone();
        next.instances = instances;
        next.version = version;
        next.version_info = next.version_info.scaled_at(version);
        next
    }
}

/// Sum of the two workload shapes. Runtime layers operate on this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunSpec {
    App(AppSpec),
    Pod(PodSpec),
}

impl RunSpec {
    pub fn id(&self) -> &PathId {
        match self {
            RunSpec::App(a) => &a.id,
            RunSpec::Pod(p) => &p.id,
        }
    }

    pub fn instances(&self) -> u32 {
        match self {
            RunSpec::App(a) => a.instances,
            RunSpec::Pod(p) => p.instances,
        }
    }

    pub fn version(&self) -> Timestamp {
        match self {
            RunSpec::App(a) => a.version,
            RunSpec::Pod(p) => p.version,
        }
    }

    pub fn version_info(&self) -> VersionInfo {
        match self {
            RunSpec::App(a) => a.version_info,
            RunSpec::Pod(p) => p.version_info,
        }
    }

    pub fn dependencies(&self) -> &BTreeSet<PathId> {
        match self {
            RunSpec::App(a) => &a.dependencies,
            RunSpec::Pod(p) => &p.dependencies,
        }
    }

    pub fn constraints(&self) -> &[Constraint] {
        match self {
            RunSpec::App(a) => &a.constraints,
            RunSpec::Pod(p) => &p.constraints,
        }
    }

    pub fn upgrade_strategy(&self) -> UpgradeStrategy {
        match self {
            RunSpec::App(a) => a.upgrade_strategy,
            RunSpec::Pod(p) => p.upgrade_strategy,
        }
    }

    pub fn backoff(&self) -> BackoffStrategy {
        match self {
            RunSpec::App(a) => a.backoff,
            RunSpec::Pod(p) => p.backoff,
        }
    }

    pub fn unreachable_strategy(&self) -> UnreachableStrategy {
        match self {
            RunSpec::App(a) => a.unreachable_strategy,
            RunSpec::Pod(p) => p.unreachable_strategy,
        }
    }

    pub fn kill_selection(&self) -> KillSelection {
        match self {
            RunSpec::App(a) => a.kill_selection,
            RunSpec::Pod(p) => p.kill_selection,
        }
    }

    pub fn is_resident(&self) -> bool {
        match self {
            RunSpec::App(a) => a.is_resident(),
            RunSpec::Pod(_) => false,
        }
    }

    pub fn health_checks(&self) -> Vec<&HealthCheck> {
        match self {
            RunSpec::App(a) => a.health_checks.iter().collect(),
            RunSpec::Pod(p) => p
                .containers
                .iter()
                .filter_map(|c| c.health_check.as_ref())
                .collect(),
        }
    }

    pub fn readiness_checks(&self) -> &[ReadinessCheck] {
        match self {
            RunSpec::App(a) => &a.readiness_checks,
            RunSpec::Pod(_) => &[],
        }
    }

    /// True when `newer` changes anything beyond the instance count.
    pub fn is_upgrade(&self, newer: &RunSpec) -> bool {
        match (self, newer) {
            (RunSpec::App(a), RunSpec::App(b)) => a.is_upgrade(b),
            (RunSpec::Pod(a), RunSpec::Pod(b)) => a.is_upgrade(b),
            _ => true,
        }
    }
}
