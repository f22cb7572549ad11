//! Deployment plans: ordered steps of concurrent actions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use flotilla_core::{Group, InstanceId, PathId, RunSpec, Timestamp};

/// One unit of deployment work, scoped to a single run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Bring a newly-introduced spec up to `scale_to` ready instances.
    StartApplication { spec: RunSpec, scale_to: u32 },
    /// Converge the instance count to `scale_to`, optionally killing the
    /// given instances first.
    ScaleApplication {
        spec: RunSpec,
        scale_to: u32,
        to_kill: Option<Vec<InstanceId>>,
    },
    /// Replace every instance not at the spec's version.
    RestartApplication { spec: RunSpec },
    /// Kill all instances and forget the spec.
    StopApplication { spec: RunSpec },
    /// Download artifacts before dependent steps may proceed.
    ResolveArtifacts {
        spec: RunSpec,
        /// url → local path.
        urls: BTreeMap<String, String>,
    },
}

impl DeploymentAction {
    pub fn spec(&self) -> &RunSpec {
        match self {
            DeploymentAction::StartApplication { spec, .. }
            | DeploymentAction::ScaleApplication { spec, .. }
            | DeploymentAction::RestartApplication { spec }
            | DeploymentAction::StopApplication { spec }
            | DeploymentAction::ResolveArtifacts { spec, .. } => spec,
        }
    }

    pub fn path(&self) -> &PathId {
        self.spec().id()
    }

    /// Short name for events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentAction::StartApplication { .. } => "start",
            DeploymentAction::ScaleApplication { .. } => "scale",
            DeploymentAction::RestartApplication { .. } => "restart",
            DeploymentAction::StopApplication { .. } => "stop",
            DeploymentAction::ResolveArtifacts { .. } => "resolve_artifacts",
        }
    }
}

/// Actions safe to run concurrently: one step never holds two actions
/// for the same spec.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub actions: Vec<DeploymentAction>,
}

impl DeploymentStep {
    pub fn new(actions: Vec<DeploymentAction>) -> Self {
        Self { actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// An ordered sequence of steps turning `original` into `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: String,
    pub original: Group,
    pub target: Group,
    pub steps: Vec<DeploymentStep>,
    pub version: Timestamp,
}

impl DeploymentPlan {
    /// Every spec path any step touches.
    pub fn affected_paths(&self) -> BTreeSet<PathId> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .map(|a| a.path().clone())
            .collect()
    }

    /// Whether two plans touch overlapping specs.
    pub fn conflicts_with(&self, other: &DeploymentPlan) -> bool {
        let mine = self.affected_paths();
        other.affected_paths().iter().any(|p| mine.contains(p))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(DeploymentStep::is_empty)
    }
}
