//! The hierarchical group tree holding apps, pods, and subgroups.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::path::PathId;
use crate::spec::{AppSpec, PodSpec, RunSpec, Timestamp};

/// A namespace level: child groups plus the run specs declared at it.
///
/// The group at `/` is the root and carries the global version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: PathId,
    pub apps: BTreeMap<PathId, AppSpec>,
    pub pods: BTreeMap<PathId, PodSpec>,
    pub groups: BTreeMap<PathId, Group>,
    /// Group-level dependencies, inherited by every spec underneath.
    pub dependencies: BTreeSet<PathId>,
    pub version: Timestamp,
}

impl Group {
    pub fn empty_root(version: Timestamp) -> Self {
        Self::empty(PathId::root(), version)
    }

    pub fn empty(id: PathId, version: Timestamp) -> Self {
        Self {
            id,
            apps: BTreeMap::new(),
            pods: BTreeMap::new(),
            groups: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            version,
        }
    }

    /// All run specs at this level and below, keyed by path.
    pub fn transitive_run_specs(&self) -> BTreeMap<PathId, RunSpec> {
        let mut out = BTreeMap::new();
        self.collect_specs(&mut out);
        out
    }

    fn collect_specs(&self, out: &mut BTreeMap<PathId, RunSpec>) {
        for (id, app) in &self.apps {
            out.insert(id.clone(), RunSpec::App(app.clone()));
        }
        for (id, pod) in &self.pods {
            out.insert(id.clone(), RunSpec::Pod(pod.clone()));
        }
        for child in self.groups.values() {
            child.collect_specs(out);
        }
    }

    /// Find the group at `path`, descending from this one.
    pub fn find_group(&self, path: &PathId) -> Option<&Group> {
        if &self.id == path {
            return Some(self);
        }
        self.groups
            .values()
            .find(|g| g.id.is_ancestor_of(path))
            .and_then(|g| g.find_group(path))
    }

    pub fn app(&self, path: &PathId) -> Option<&AppSpec> {
        self.find_group(&path.parent()).and_then(|g| g.apps.get(path))
    }

    pub fn pod(&self, path: &PathId) -> Option<&PodSpec> {
        self.find_group(&path.parent()).and_then(|g| g.pods.get(path))
    }

    pub fn run_spec(&self, path: &PathId) -> Option<RunSpec> {
        self.app(path)
            .cloned()
            .map(RunSpec::App)
            .or_else(|| self.pod(path).cloned().map(RunSpec::Pod))
    }

    /// Insert or replace an app, creating intermediate groups and
    /// re-versioning every ancestor.
    pub fn put_app(&mut self, app: AppSpec, version: Timestamp) {
        let path = app.id.clone();
        let group = self.ensure_group(&path.parent(), version);
        group.apps.insert(path, app);
        self.reversion_along(version);
    }

    pub fn put_pod(&mut self, pod: PodSpec, version: Timestamp) {
        let path = pod.id.clone();
        let group = self.ensure_group(&path.parent(), version);
        group.pods.insert(path, pod);
        self.reversion_along(version);
    }

    /// Remove the app, pod, or subgroup at `path`. Returns whether
    /// anything was removed.
    pub fn remove(&mut self, path: &PathId, version: Timestamp) -> bool {
        let removed = self.remove_inner(path);
        if removed {
            self.reversion_along(version);
        }
        removed
    }

    fn remove_inner(&mut self, path: &PathId) -> bool {
        if let Some(group) = self.group_mut(&path.parent()) {
            if group.apps.remove(path).is_some()
                || group.pods.remove(path).is_some()
                || group.groups.remove(path).is_some()
            {
                return true;
            }
        }
        false
    }

    fn group_mut(&mut self, path: &PathId) -> Option<&mut Group> {
        if &self.id == path {
            return Some(self);
        }
        for child in self.groups.values_mut() {
            if child.id.is_ancestor_of(path) {
                return child.group_mut(path);
            }
        }
        None
    }

    fn ensure_group(&mut self, path: &PathId, version: Timestamp) -> &mut Group {
        if &self.id == path {
            return self;
        }
        // Walk down one level at a time, creating missing groups.
        let next_depth = self.id.depth() + 1;
        let mut segments = Vec::new();
        let rendered = path.to_string();
        for part in rendered.split('/').filter(|s| !s.is_empty()) {
            segments.push(part.to_string());
        }
        let child_id = {
            let mut p = self.id.clone();
            p = p
                .child(&segments[next_depth - 1])
                .expect("validated segment");
            p
        };
        let child = self
            .groups
            .entry(child_id.clone())
            .or_insert_with(|| Group::empty(child_id, version));
        child.ensure_group(path, version)
    }

    fn reversion_along(&mut self, version: Timestamp) {
        self.version = version;
        for child in self.groups.values_mut() {
            child.reversion_along(version);
        }
    }

    /// Validate the structural invariants of the whole tree:
    /// immediate-id uniqueness and dependency acyclicity.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_unique_ids()?;
        self.validate_dependencies()
    }

    fn validate_unique_ids(&self) -> Result<(), ValidationError> {
        let mut seen = BTreeSet::new();
        for id in self
            .apps
            .keys()
            .chain(self.pods.keys())
            .chain(self.groups.keys())
        {
            if !seen.insert(id.name().to_string()) {
                return Err(ValidationError::DuplicateId(
                    id.name().to_string(),
                    self.id.to_string(),
                ));
            }
        }
        for child in self.groups.values() {
            child.validate_unique_ids()?;
        }
        Ok(())
    }

    fn validate_dependencies(&self) -> Result<(), ValidationError> {
        let edges = self.dependency_edges();
        let specs = self.transitive_run_specs();
        detect_cycle(&specs, &edges)
    }

    /// Effective dependency edges between run specs.
    ///
    /// A spec depends on its own declared dependencies plus those of every
    /// enclosing group; a dependency on a group expands to every spec under
    /// that group.
    pub fn dependency_edges(&self) -> BTreeMap<PathId, BTreeSet<PathId>> {
        let specs = self.transitive_run_specs();
        let mut edges: BTreeMap<PathId, BTreeSet<PathId>> = BTreeMap::new();

        for (spec_id, spec) in &specs {
            let mut declared: BTreeSet<PathId> = spec.dependencies().clone();
            // Inherit group-level dependencies from every ancestor.
            let mut cursor = Some(self);
            while let Some(group) = cursor {
                if group.id.is_ancestor_of(spec_id) {
                    declared.extend(group.dependencies.iter().cloned());
                }
                cursor = group
                    .groups
                    .values()
                    .find(|g| g.id.is_ancestor_of(spec_id));
            }

            let mut resolved = BTreeSet::new();
            for dep in declared {
                for target in specs.keys() {
                    if dep.is_ancestor_of(target) && target != spec_id {
                        resolved.insert(target.clone());
                    }
                }
            }
            edges.insert(spec_id.clone(), resolved);
        }
        edges
    }
}

/// Depth-first cycle detection over the resolved dependency graph.
fn detect_cycle(
    specs: &BTreeMap<PathId, RunSpec>,
    edges: &BTreeMap<PathId, BTreeSet<PathId>>,
) -> Result<(), ValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node: &PathId,
        edges: &BTreeMap<PathId, BTreeSet<PathId>>,
        marks: &mut BTreeMap<PathId, Mark>,
        stack: &mut Vec<PathId>,
    ) -> Result<(), ValidationError> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let cycle: Vec<String> = stack
                    .iter()
                    .skip_while(|p| *p != node)
                    .map(|p| p.to_string())
                    .collect();
                return Err(ValidationError::CyclicDependencies(cycle.join(" -> ")));
            }
            None => {}
        }
        marks.insert(node.clone(), Mark::Visiting);
        stack.push(node.clone());
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                visit(dep, edges, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(node.clone(), Mark::Done);
        Ok(())
    }

    let mut marks = BTreeMap::new();
    let mut stack = Vec::new();
    for node in specs.keys() {
        visit(node, edges, &mut marks, &mut stack)?;
    }
    Ok(())
}
