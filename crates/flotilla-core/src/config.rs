//! Orchestrator-wide configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recognized options with their defaults. The API layer populates this
/// from flags/files; the core only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Cap on instances matched out of a single offer.
    pub max_instances_per_offer: u32,
    /// Floor between two offer-revival requests to the manager.
    pub min_revive_offers_interval: Duration,
    /// Delay before the first task reconciliation after election.
    pub reconciliation_initial_delay: Duration,
    /// Interval between task reconciliations.
    pub reconciliation_interval: Duration,
    /// Delay before the first unreachable-expunge sweep.
    pub expunge_initial_delay: Duration,
    /// Interval between unreachable-expunge sweeps.
    pub expunge_interval: Duration,
    /// Extra slack before a decided expunge is garbage-collected.
    pub expunge_gc: Duration,
    /// Roles accepted when a spec does not name its own.
    pub default_accepted_resource_roles: BTreeSet<String>,
    /// Network name used for container networks that omit one.
    pub default_network_name: Option<String>,
    /// Prefix applied to generated task environment variables.
    pub env_prefix: Option<String>,
    /// Feature toggles by name.
    pub enabled_features: BTreeSet<String>,
    /// Grace given to step controllers between Shutdown and hard stop.
    pub controller_shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_instances_per_offer: 5,
            min_revive_offers_interval: Duration::from_secs(5),
            reconciliation_initial_delay: Duration::from_secs(15),
            reconciliation_interval: Duration::from_secs(600),
            expunge_initial_delay: Duration::from_secs(300),
            expunge_interval: Duration::from_secs(30),
            expunge_gc: Duration::from_secs(30),
            default_accepted_resource_roles: BTreeSet::from(["*".to_string()]),
            default_network_name: None,
            env_prefix: None,
            enabled_features: BTreeSet::new(),
            controller_shutdown_grace: Duration::from_secs(30),
        }
    }
}
