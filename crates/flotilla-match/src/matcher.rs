//! The offer matcher — decides whether an offer satisfies a run spec and
//! builds the launch descriptor when it does.
//!
//! A mismatch is a data outcome carrying the reasons, never an error.

use std::collections::BTreeSet;

use tracing::debug;

use flotilla_core::{
    AppSpec, Constraint, Instance, InstanceId, Network, OrchestratorConfig, PodSpec,
    ResourceRequest, RunSpec,
};

use crate::constraints;
use crate::descriptor::{
    delegated_checks, discovery_ports, ContainerInfo, LaunchDescriptor,
};
use crate::env::task_env;
use crate::error::NoMatchReason;
use crate::offer::{
    OfferResource, ResourceOffer, ResourcePortion, CPUS, DISK, GPUS, MEM,
};
use crate::ports::{self, PortsMatch};
use crate::volumes::{self, VolumeMatch};

/// A successful match: what to consume, and the descriptor to launch.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferMatch {
    pub instance_id: InstanceId,
    pub selection: Vec<ResourcePortion>,
    /// Host ports in declared order; container-only slots stay `None`.
    pub port_bindings: Vec<Option<u32>>,
    pub descriptor: LaunchDescriptor,
}

/// Outcome of one matcher invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferMatchResult {
    Match(Box<OfferMatch>),
    NoMatch(Vec<NoMatchReason>),
}

impl OfferMatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, OfferMatchResult::Match(_))
    }
}

/// Match `spec` against `offer`, given the spec's running instances.
pub fn match_offer(
    spec: &RunSpec,
    offer: &ResourceOffer,
    running: &[Instance],
    config: &OrchestratorConfig,
) -> OfferMatchResult {
    match spec {
        RunSpec::App(app) => match_app(app, offer, running, config),
        RunSpec::Pod(pod) => match_pod(pod, offer, running, config),
    }
}

fn accepted_roles(app_roles: Option<&BTreeSet<String>>, config: &OrchestratorConfig) -> BTreeSet<String> {
    app_roles
        .cloned()
        .unwrap_or_else(|| config.default_accepted_resource_roles.clone())
}

fn match_app(
    spec: &AppSpec,
    offer: &ResourceOffer,
    running: &[Instance],
    config: &OrchestratorConfig,
) -> OfferMatchResult {
    let roles = accepted_roles(spec.accepted_resource_roles.as_ref(), config);
    let mut reasons = Vec::new();

    // Scalars, roles preserved on every consumed portion.
    let mut selection = match_scalars(
        &spec.resources,
        &offer.resources,
        &roles,
        spec.is_resident(),
        &mut reasons,
    );

    // Ports.
    let declared = spec.declared_ports();
    let ranges = offer.port_ranges(&|role| roles.contains(role));
    let bindings = match ports::allocate(&declared, &ranges, spec.require_ports) {
        PortsMatch::Bindings(b) => b,
        PortsMatch::Unsatisfied(port) => {
            reasons.push(NoMatchReason::UnsatisfiedPort(port));
            Vec::new()
        }
    };

    // Constraints.
    for constraint in &spec.constraints {
        if !constraints::satisfied(constraint, offer, running) {
            reasons.push(NoMatchReason::UnsatisfiedConstraint(describe(constraint)));
        }
    }

    // Persistent volumes for resident specs.
    match volumes::match_volumes(spec, &offer.resources) {
        VolumeMatch::NotNeeded => {}
        VolumeMatch::Volumes(portions) => selection.extend(portions),
        VolumeMatch::Unsatisfied { required_mib } => {
            reasons.push(NoMatchReason::UnsatisfiedVolumes { required_mib });
        }
    }

    if !reasons.is_empty() {
        debug!(run_spec = %spec.id, offer = %offer.id, ?reasons, "offer did not match");
        return OfferMatchResult::NoMatch(reasons);
    }

    let instance_id = InstanceId::new(&spec.id);
    let task_id = instance_id.task_id();
    let env = task_env(
        spec,
        &declared,
        &bindings,
        &task_id,
        &offer.hostname,
        config.env_prefix.as_deref(),
    );

    let container = spec.container.as_ref().and_then(|c| {
        c.image.as_ref().map(|image| ContainerInfo {
            image: image.clone(),
            force_pull: c.force_pull_image,
            port_mappings: c
                .port_mappings
                .iter()
                .enumerate()
                .filter_map(|(i, m)| {
                    bindings
                        .get(i)
                        .copied()
                        .flatten()
                        .map(|host| (host, m.container_port, m.protocol))
                })
                .collect(),
            volumes: c.volumes.clone(),
        })
    });

    let container_ports: Vec<u32> = spec
        .container
        .as_ref()
        .map(|c| c.port_mappings.iter().map(|m| m.container_port).collect())
        .unwrap_or_default();

    let networks = normalize_networks(&spec.networks, config);

    let descriptor = LaunchDescriptor {
        task_id,
        offer_id: offer.id.clone(),
        agent_id: offer.agent_id.clone(),
        hostname: offer.hostname.clone(),
        resources: selection.clone(),
        command: spec.cmd.clone(),
        args: spec.args.clone(),
        env,
        container,
        discovery: discovery_ports(&declared, &bindings, &container_ports),
        networks,
        delegated_checks: delegated_checks(spec, &bindings),
        kill_grace_period: spec.task_kill_grace_period,
        labels: spec.labels.clone(),
        port_bindings: bindings.clone(),
    };

    OfferMatchResult::Match(Box::new(OfferMatch {
        instance_id,
        selection,
        port_bindings: bindings,
        descriptor,
    }))
}

fn match_pod(
    spec: &PodSpec,
    offer: &ResourceOffer,
    running: &[Instance],
    config: &OrchestratorConfig,
) -> OfferMatchResult {
    let roles = accepted_roles(None, config);
    let mut reasons = Vec::new();

    let selection = match_scalars(
        &spec.resources(),
        &offer.resources,
        &roles,
        false,
        &mut reasons,
    );

    // Endpoints across all containers, in container order.
    let declared: Vec<flotilla_core::DeclaredPort> = spec
        .containers
        .iter()
        .flat_map(|c| c.endpoints.iter())
        .map(|m| flotilla_core::DeclaredPort {
            host_port: m.host_port,
            name: m.name.clone(),
            protocol: m.protocol,
            labels: m.labels.clone(),
        })
        .collect();
    let ranges = offer.port_ranges(&|role| roles.contains(role));
    let bindings = match ports::allocate(&declared, &ranges, false) {
        PortsMatch::Bindings(b) => b,
        PortsMatch::Unsatisfied(port) => {
            reasons.push(NoMatchReason::UnsatisfiedPort(port));
            Vec::new()
        }
    };

    for constraint in &spec.constraints {
        if !constraints::satisfied(constraint, offer, running) {
            reasons.push(NoMatchReason::UnsatisfiedConstraint(describe(constraint)));
        }
    }

    if !reasons.is_empty() {
        debug!(run_spec = %spec.id, offer = %offer.id, ?reasons, "offer did not match pod");
        return OfferMatchResult::NoMatch(reasons);
    }

    let instance_id = InstanceId::new(&spec.id);
    // One task per container; the descriptor carries the first container's
    // task id and the full binding list, the launch layer fans out.
    let task_id = instance_id.task_id();
    let descriptor = LaunchDescriptor {
        task_id,
        offer_id: offer.id.clone(),
        agent_id: offer.agent_id.clone(),
        hostname: offer.hostname.clone(),
        resources: selection.clone(),
        command: None,
        args: Vec::new(),
        env: spec
            .containers
            .iter()
            .flat_map(|c| c.env.clone())
            .collect(),
        container: None,
        discovery: discovery_ports(&declared, &bindings, &[]),
        networks: normalize_networks(&spec.networks, config),
        delegated_checks: Vec::new(),
        kill_grace_period: None,
        labels: spec.labels.clone(),
        port_bindings: bindings.clone(),
    };

    OfferMatchResult::Match(Box::new(OfferMatch {
        instance_id,
        selection,
        port_bindings: bindings,
        descriptor,
    }))
}

/// Greedily satisfy scalar demands from role-tagged slices.
///
/// Unreserved slices are consumed first for non-resident work; resident
/// work prefers reserved slices (its reservations) before falling back.
fn match_scalars(
    demand: &ResourceRequest,
    resources: &[OfferResource],
    roles: &BTreeSet<String>,
    resident: bool,
    reasons: &mut Vec<NoMatchReason>,
) -> Vec<ResourcePortion> {
    let mut selection = Vec::new();
    for (name, amount) in [
        (CPUS, demand.cpus),
        (MEM, demand.mem),
        (DISK, demand.disk),
        (GPUS, demand.gpus),
    ] {
        if amount <= 0.0 {
            continue;
        }
        match consume_scalar(name, amount, resources, roles, resident) {
            Some(portions) => selection.extend(portions),
            None => {
                let offered = resources
                    .iter()
                    .filter(|r| r.name == name && roles.contains(&r.role))
                    .map(OfferResource::scalar_value)
                    .sum();
                reasons.push(NoMatchReason::InsufficientScalar {
                    resource: name.to_string(),
                    requested: amount,
                    offered,
                });
            }
        }
    }
    selection
}

fn consume_scalar(
    name: &str,
    requested: f64,
    resources: &[OfferResource],
    roles: &BTreeSet<String>,
    resident: bool,
) -> Option<Vec<ResourcePortion>> {
    let mut eligible: Vec<&OfferResource> = resources
        .iter()
        .filter(|r| r.name == name && roles.contains(&r.role))
        // Disk slices holding persistent volumes are matched separately.
        .filter(|r| r.disk.as_ref().map_or(true, |d| d.persistence_id.is_none()))
        .collect();

    // Stable preference order; roles survive on each consumed portion.
    if resident {
        eligible.sort_by_key(|r| r.is_unreserved());
    } else {
        eligible.sort_by_key(|r| !r.is_unreserved());
    }

    let mut remaining = requested;
    let mut portions = Vec::new();
    for slice in eligible {
        if remaining <= 0.0 {
            break;
        }
        let available = slice.scalar_value();
        if available <= 0.0 {
            continue;
        }
        let take = available.min(remaining);
        portions.push(ResourcePortion {
            name: name.to_string(),
            role: slice.role.clone(),
            amount: take,
            reservation: slice.reservation.clone(),
            disk: slice.disk.clone(),
        });
        remaining -= take;
    }

    if remaining > f64::EPSILON {
        None
    } else {
        Some(portions)
    }
}

fn normalize_networks(networks: &[Network], config: &OrchestratorConfig) -> Vec<Network> {
    networks
        .iter()
        .map(|n| match n {
            Network::Container { name } if name.is_empty() => Network::Container {
                name: config.default_network_name.clone().unwrap_or_default(),
            },
            other => other.clone(),
        })
        .collect()
}

fn describe(constraint: &Constraint) -> String {
    format!("{}:{:?}", constraint.field, constraint.operator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use flotilla_core::{
        AgentInfo, ConstraintOp, PathId, PortDefinition, UnreachableStrategy,
    };

    use crate::offer::{PortRange, STAR_ROLE};

    fn offer() -> ResourceOffer {
        ResourceOffer {
            id: "offer-1".to_string(),
            agent_id: "agent-1".to_string(),
            hostname: "host-1".to_string(),
            attributes: BTreeMap::new(),
            resources: vec![
                OfferResource::scalar(CPUS, STAR_ROLE, 4.0),
                OfferResource::scalar(MEM, STAR_ROLE, 4096.0),
                OfferResource::scalar(DISK, STAR_ROLE, 10000.0),
                OfferResource::ports(STAR_ROLE, vec![PortRange { begin: 31000, end: 32000 }]),
            ],
        }
    }

    fn app() -> AppSpec {
        let mut spec = AppSpec::new(PathId::parse("/web/api").unwrap());
        spec.cmd = Some("./server".to_string());
        spec.resources = ResourceRequest {
            cpus: 1.0,
            mem: 512.0,
            disk: 0.0,
            gpus: 0.0,
        };
        spec.port_definitions = vec![PortDefinition {
            port: 0,
            name: Some("http".to_string()),
            ..PortDefinition::default()
        }];
        spec
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default()
    }

    #[test]
    fn sufficient_offer_matches() {
        let result = match_offer(&RunSpec::App(app()), &offer(), &[], &config());
        let m = match result {
            OfferMatchResult::Match(m) => m,
            OfferMatchResult::NoMatch(reasons) => panic!("expected match, got {reasons:?}"),
        };
        assert_eq!(m.port_bindings, vec![Some(31000)]);
        assert!(m
            .selection
            .iter()
            .any(|p| p.name == CPUS && p.amount == 1.0));
        assert_eq!(m.descriptor.env.get("PORT0").unwrap(), "31000");
        assert_eq!(m.descriptor.command.as_deref(), Some("./server"));
    }

    #[test]
    fn insufficient_cpu_reports_reason() {
        let mut spec = app();
        spec.resources.cpus = 64.0;
        let result = match_offer(&RunSpec::App(spec), &offer(), &[], &config());
        match result {
            OfferMatchResult::NoMatch(reasons) => {
                assert!(reasons.iter().any(|r| matches!(
                    r,
                    NoMatchReason::InsufficientScalar { resource, .. } if resource == CPUS
                )));
            }
            OfferMatchResult::Match(_) => panic!("expected no match"),
        }
    }

    #[test]
    fn all_failures_are_reported_together() {
        let mut spec = app();
        spec.resources.cpus = 64.0;
        spec.resources.mem = 1_000_000.0;
        spec.require_ports = true;
        spec.port_definitions = vec![PortDefinition {
            port: 80,
            ..PortDefinition::default()
        }];
        let result = match_offer(&RunSpec::App(spec), &offer(), &[], &config());
        match result {
            OfferMatchResult::NoMatch(reasons) => assert_eq!(reasons.len(), 3),
            OfferMatchResult::Match(_) => panic!("expected no match"),
        }
    }

    #[test]
    fn roles_are_preserved_and_unreserved_consumed_first() {
        let mut o = offer();
        o.resources.push(OfferResource::scalar(CPUS, "prod", 2.0));
        let mut spec = app();
        spec.resources.cpus = 5.0; // 4 unreserved + 1 from "prod".
        spec.accepted_resource_roles = Some(BTreeSet::from([
            STAR_ROLE.to_string(),
            "prod".to_string(),
        ]));
        let result = match_offer(&RunSpec::App(spec), &o, &[], &config());
        let m = match result {
            OfferMatchResult::Match(m) => m,
            OfferMatchResult::NoMatch(reasons) => panic!("expected match, got {reasons:?}"),
        };
        let cpu_portions: Vec<_> = m.selection.iter().filter(|p| p.name == CPUS).collect();
        assert_eq!(cpu_portions.len(), 2);
        assert_eq!(cpu_portions[0].role, STAR_ROLE);
        assert_eq!(cpu_portions[0].amount, 4.0);
        assert_eq!(cpu_portions[1].role, "prod");
        assert_eq!(cpu_portions[1].amount, 1.0);
    }

    #[test]
    fn non_accepted_roles_are_invisible() {
        let mut o = offer();
        o.resources = vec![
            OfferResource::scalar(CPUS, "other-team", 16.0),
            OfferResource::scalar(MEM, STAR_ROLE, 4096.0),
            OfferResource::ports(STAR_ROLE, vec![PortRange { begin: 31000, end: 32000 }]),
        ];
        let result = match_offer(&RunSpec::App(app()), &o, &[], &config());
        assert!(!result.is_match());
    }

    #[test]
    fn constraint_violation_blocks_match() {
        let mut spec = app();
        spec.constraints = vec![Constraint {
            field: "hostname".to_string(),
            operator: ConstraintOp::Unique,
        }];
        let running = vec![Instance::provisioned(
            InstanceId::new(&spec.id),
            AgentInfo {
                host: "host-1".to_string(),
                agent_id: None,
                attributes: BTreeMap::new(),
            },
            1,
            UnreachableStrategy::default(),
            Vec::new(),
            0,
        )];
        let result = match_offer(&RunSpec::App(spec), &offer(), &running, &config());
        match result {
            OfferMatchResult::NoMatch(reasons) => {
                assert!(reasons
                    .iter()
                    .any(|r| matches!(r, NoMatchReason::UnsatisfiedConstraint(_))));
            }
            OfferMatchResult::Match(_) => panic!("expected no match"),
        }
    }

    #[test]
    fn discovery_carries_declared_order_and_names() {
        let result = match_offer(&RunSpec::App(app()), &offer(), &[], &config());
        let m = match result {
            OfferMatchResult::Match(m) => m,
            _ => panic!("expected match"),
        };
        assert_eq!(m.descriptor.discovery.len(), 1);
        assert_eq!(m.descriptor.discovery[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn gpus_matched_only_when_requested() {
        // The base offer has no gpus; a spec without gpu demand matches.
        let result = match_offer(&RunSpec::App(app()), &offer(), &[], &config());
        assert!(result.is_match());

        let mut spec = app();
        spec.resources.gpus = 1.0;
        let result = match_offer(&RunSpec::App(spec), &offer(), &[], &config());
        assert!(!result.is_match());
    }
}
