//! The deployment planner — diffs two group trees into an ordered plan.
//!
//! Ordering: artifact resolution first, then dependency layers (a spec's
//! dependencies always land in earlier steps), and within each layer
//! starts, scale-downs and stops before scale-ups and restarts.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use uuid::Uuid;

use flotilla_core::{Group, PathId, RunSpec, Timestamp, ValidationError};

use crate::error::{DeployError, DeployResult};
use crate::plan::{DeploymentAction, DeploymentPlan, DeploymentStep};

/// Compute the plan turning `original` into `target`.
///
/// Fails with `CyclicDependencies` (and produces no plan) when the
/// target's dependency graph has a cycle.
pub fn plan(original: &Group, target: &Group, version: Timestamp) -> DeployResult<DeploymentPlan> {
    match target.validate() {
        Ok(()) => {}
        Err(ValidationError::CyclicDependencies(cycle)) => {
            return Err(DeployError::CyclicDependencies(cycle));
        }
        Err(other) => return Err(DeployError::InvalidTarget(other.to_string())),
    }

    let original_specs = original.transitive_run_specs();
    let target_specs = target.transitive_run_specs();

    let mut steps = Vec::new();

    // Artifacts first: any new or config-changed spec that fetches URLs.
    let artifact_actions: Vec<DeploymentAction> = target_specs
        .values()
        .filter_map(|spec| {
            let RunSpec::App(app) = spec else { return None };
            if app.artifacts.is_empty() {
                return None;
            }
            let changed = match original_specs.get(&app.id) {
                Some(old) => old.is_upgrade(spec),
                None => true,
            };
            if !changed {
                return None;
            }
            let urls: BTreeMap<String, String> = app
                .artifacts
                .iter()
                .map(|a| {
                    let dest = a.dest.clone().unwrap_or_else(|| {
                        a.url.rsplit('/').next().unwrap_or("artifact").to_string()
                    });
                    (a.url.clone(), dest)
                })
                .collect();
            Some(DeploymentAction::ResolveArtifacts {
                spec: spec.clone(),
                urls,
            })
        })
        .collect();
    if !artifact_actions.is_empty() {
        steps.push(DeploymentStep::new(artifact_actions));
    }

    // Dependency layers over the union of both trees. Removed specs keep
    // their original edges so their stops sort into sensible layers.
    let layers = dependency_layers(original, target, &original_specs, &target_specs)?;

    for layer in layers {
        let mut first_wave = Vec::new();
        let mut second_wave = Vec::new();

        for path in layer {
            match (original_specs.get(&path), target_specs.get(&path)) {
                (None, Some(new_spec)) => {
                    first_wave.push(DeploymentAction::StartApplication {
                        spec: new_spec.clone(),
                        scale_to: new_spec.instances(),
                    });
                }
                (Some(old_spec), None) => {
                    first_wave.push(DeploymentAction::StopApplication {
                        spec: old_spec.clone(),
                    });
                }
                (Some(old_spec), Some(new_spec)) => {
                    if old_spec.is_upgrade(new_spec) {
                        second_wave.push(DeploymentAction::RestartApplication {
                            spec: new_spec.clone(),
                        });
                    } else if old_spec.instances() != new_spec.instances() {
                        let action = DeploymentAction::ScaleApplication {
                            spec: new_spec.clone(),
                            scale_to: new_spec.instances(),
                            to_kill: None,
                        };
                        // Scale-downs release capacity before restarts and
                        // scale-ups consume it.
                        if new_spec.instances() < old_spec.instances() {
                            first_wave.push(action);
                        } else {
                            second_wave.push(action);
                        }
                    }
                }
                (None, None) => unreachable!("layer paths come from the union"),
            }
        }

        if !first_wave.is_empty() {
            steps.push(DeploymentStep::new(first_wave));
        }
        if !second_wave.is_empty() {
            steps.push(DeploymentStep::new(second_wave));
        }
    }

    let plan = DeploymentPlan {
        id: Uuid::new_v4().to_string(),
        original: original.clone(),
        target: target.clone(),
        steps,
        version,
    };
    debug!(plan_id = %plan.id, steps = plan.steps.len(), "plan computed");
    Ok(plan)
}

/// Stamp target-spec version info from the diff against `original`:
/// config changes advance `last_config_change_at`, scale-only changes
/// only `last_scaling_at`, unchanged specs keep their original version.
pub fn stamp_versions(original: &Group, target: &mut Group, now: Timestamp) {
    let original_specs = original.transitive_run_specs();
    stamp_group(&original_specs, target, now);
}

fn stamp_group(original_specs: &BTreeMap<PathId, RunSpec>, group: &mut Group, now: Timestamp) {
    for (path, app) in group.apps.iter_mut() {
        match original_specs.get(path) {
            None => {
                app.version = now;
                app.version_info = flotilla_core::VersionInfo::for_new_spec(now);
            }
            Some(old) => {
                let new_spec = RunSpec::App(app.clone());
                if old.is_upgrade(&new_spec) {
                    app.version = now;
                    app.version_info = old.version_info().config_changed_at(now);
                } else if old.instances() != app.instances {
                    app.version = now;
                    app.version_info = old.version_info().scaled_at(now);
                } else {
                    app.version = old.version();
                    app.version_info = old.version_info();
                }
            }
        }
    }
    for (path, pod) in group.pods.iter_mut() {
        match original_specs.get(path) {
            None => {
                pod.version = now;
                pod.version_info = flotilla_core::VersionInfo::for_new_spec(now);
            }
            Some(old) => {
                let new_spec = RunSpec::Pod(pod.clone());
                if old.is_upgrade(&new_spec) {
                    pod.version = now;
                    pod.version_info = old.version_info().config_changed_at(now);
                } else if old.instances() != pod.instances {
                    pod.version = now;
                    pod.version_info = old.version_info().scaled_at(now);
                } else {
                    pod.version = old.version();
                    pod.version_info = old.version_info();
                }
            }
        }
    }
    for child in group.groups.values_mut() {
        stamp_group(original_specs, child, now);
    }
}

/// Topological layers over the union dependency graph: layer 0 has no
/// dependencies, layer N+1 depends only on layers ≤ N.
fn dependency_layers(
    original: &Group,
    target: &Group,
    original_specs: &BTreeMap<PathId, RunSpec>,
    target_specs: &BTreeMap<PathId, RunSpec>,
) -> DeployResult<Vec<Vec<PathId>>> {
    let target_edges = target.dependency_edges();
    let original_edges = original.dependency_edges();

    let mut nodes: BTreeSet<PathId> = BTreeSet::new();
    nodes.extend(original_specs.keys().cloned());
    nodes.extend(target_specs.keys().cloned());

    // Removed specs fall back to their original edges, restricted to
    // nodes that still exist somewhere.
    let mut edges: BTreeMap<PathId, BTreeSet<PathId>> = BTreeMap::new();
    for node in &nodes {
        let deps = target_edges
            .get(node)
            .or_else(|| original_edges.get(node))
            .cloned()
            .unwrap_or_default();
        edges.insert(
            node.clone(),
            deps.into_iter().filter(|d| nodes.contains(d)).collect(),
        );
    }

    let mut level: BTreeMap<PathId, usize> = BTreeMap::new();
    let mut remaining: BTreeSet<PathId> = nodes.clone();
    let mut current = 0usize;
    while !remaining.is_empty() {
        let ready: Vec<PathId> = remaining
            .iter()
            .filter(|n| {
                edges[*n]
                    .iter()
                    .all(|d| level.contains_key(d) || !remaining.contains(d))
            })
            .cloned()
            .collect();
        if ready.is_empty() {
            // The target already validated acyclic; a cycle here can only
            // come in through removed specs' stale edges.
            let stuck: Vec<String> = remaining.iter().map(|p| p.to_string()).collect();
            return Err(DeployError::CyclicDependencies(stuck.join(" -> ")));
        }
        for node in ready {
            level.insert(node.clone(), current);
            remaining.remove(&node);
        }
        current += 1;
    }

    let mut layers: Vec<Vec<PathId>> = vec![Vec::new(); current];
    for (node, l) in level {
        layers[l].push(node);
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{AppSpec, Artifact};

    fn path(p: &str) -> PathId {
        PathId::parse(p).unwrap()
    }

    fn app(id: &str, instances: u32) -> AppSpec {
        let mut spec = AppSpec::new(path(id));
        spec.instances = instances;
        spec.cmd = Some("./run".to_string());
        spec
    }

    fn root_with(apps: Vec<AppSpec>) -> Group {
        let mut root = Group::empty_root(1);
        for (i, app) in apps.into_iter().enumerate() {
            root.put_app(app, 1 + i as Timestamp);
        }
        root
    }

    fn action_kinds(plan: &DeploymentPlan) -> Vec<Vec<(&'static str, String)>> {
        plan.steps
            .iter()
            .map(|s| {
                s.actions
                    .iter()
                    .map(|a| (a.kind(), a.path().to_string()))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn new_app_yields_one_start_step() {
        let original = Group::empty_root(0);
        let target = root_with(vec![app("/api", 3)]);
        let plan = plan(&original, &target, 100).unwrap();
        assert_eq!(
            action_kinds(&plan),
            vec![vec![("start", "/api".to_string())]]
        );
    }

    #[test]
    fn identical_trees_yield_an_empty_plan() {
        let tree = root_with(vec![app("/api", 3)]);
        let plan = plan(&tree, &tree.clone(), 100).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn scale_only_change_never_restarts() {
        let original = root_with(vec![app("/api", 3)]);
        let mut scaled = app("/api", 5);
        scaled.version = 50;
        scaled.version_info = flotilla_core::VersionInfo::default().scaled_at(50);
        let target = root_with(vec![scaled]);

        let p = plan(&original, &target, 100).unwrap();
        let kinds = action_kinds(&p);
        assert_eq!(kinds, vec![vec![("scale", "/api".to_string())]]);
    }

    #[test]
    fn scale_back_to_original_count_also_never_restarts() {
        let original = root_with(vec![app("/api", 5)]);
        let target = root_with(vec![app("/api", 3)]);
        let p = plan(&original, &target, 100).unwrap();
        assert_eq!(action_kinds(&p), vec![vec![("scale", "/api".to_string())]]);
    }

    #[test]
    fn config_change_restarts_independent_of_scaling() {
        let original = root_with(vec![app("/api", 3)]);
        let mut changed = app("/api", 5);
        changed.cmd = Some("./run-v2".to_string());
        let target = root_with(vec![changed]);

        let p = plan(&original, &target, 100).unwrap();
        assert_eq!(action_kinds(&p), vec![vec![("restart", "/api".to_string())]]);
    }

    #[test]
    fn removed_app_yields_stop() {
        let original = root_with(vec![app("/api", 3)]);
        let target = Group::empty_root(5);
        let p = plan(&original, &target, 100).unwrap();
        assert_eq!(action_kinds(&p), vec![vec![("stop", "/api".to_string())]]);
    }

    #[test]
    fn dependency_chain_orders_steps() {
        let db = app("/db", 1);
        let mut service = app("/service", 1);
        service.dependencies.insert(path("/db"));
        let mut frontend = app("/frontend", 1);
        frontend.dependencies.insert(path("/service"));

        let original = Group::empty_root(0);
        let target = root_with(vec![frontend, db, service]);

        let p = plan(&original, &target, 100).unwrap();
        let kinds = action_kinds(&p);
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[0], vec![("start", "/db".to_string())]);
        assert_eq!(kinds[1], vec![("start", "/service".to_string())]);
        assert_eq!(kinds[2], vec![("start", "/frontend".to_string())]);
    }

    #[test]
    fn cyclic_dependencies_are_rejected() {
        let mut a = app("/a", 1);
        a.dependencies.insert(path("/b"));
        let mut b = app("/b", 1);
        b.dependencies.insert(path("/a"));
        let target = root_with(vec![a, b]);

        let err = plan(&Group::empty_root(0), &target, 100).unwrap_err();
        assert!(matches!(err, DeployError::CyclicDependencies(_)));
    }

    #[test]
    fn scale_down_precedes_restart_within_a_layer() {
        let original = root_with(vec![app("/big", 10), app("/svc", 2)]);
        let mut shrunk = app("/big", 2);
        shrunk.version = 50;
        let mut changed = app("/svc", 2);
        changed.cmd = Some("./v2".to_string());
        let target = root_with(vec![shrunk, changed]);

        let p = plan(&original, &target, 100).unwrap();
        let kinds = action_kinds(&p);
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[0], vec![("scale", "/big".to_string())]);
        assert_eq!(kinds[1], vec![("restart", "/svc".to_string())]);
    }

    #[test]
    fn artifacts_resolve_before_anything_else() {
        let mut fetched = app("/api", 1);
        fetched.artifacts = vec![Artifact {
            url: "http://repo/app.tar.gz".to_string(),
            dest: None,
            executable: false,
        }];
        let target = root_with(vec![fetched]);

        let p = plan(&Group::empty_root(0), &target, 100).unwrap();
        let kinds = action_kinds(&p);
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[0], vec![("resolve_artifacts", "/api".to_string())]);
        assert_eq!(kinds[1], vec![("start", "/api".to_string())]);
    }

    #[test]
    fn stamp_versions_distinguishes_config_and_scale() {
        let mut original_app = app("/api", 3);
        original_app.version = 10;
        original_app.version_info = flotilla_core::VersionInfo::for_new_spec(10);
        let original = root_with(vec![original_app.clone()]);

        // Scale-only change.
        let mut target = root_with(vec![app("/api", 5)]);
        stamp_versions(&original, &mut target, 100);
        let scaled = target.app(&path("/api")).unwrap();
        assert_eq!(scaled.version, 100);
        assert_eq!(scaled.version_info.last_config_change_at, 10);
        assert_eq!(scaled.version_info.last_scaling_at, 100);

        // Config change.
        let mut changed = app("/api", 3);
        changed.cmd = Some("./v2".to_string());
        let mut target = root_with(vec![changed]);
        stamp_versions(&original, &mut target, 100);
        let upgraded = target.app(&path("/api")).unwrap();
        assert_eq!(upgraded.version_info.last_config_change_at, 100);

        // No change at all keeps the original version.
        let mut target = root_with(vec![app("/api", 3)]);
        stamp_versions(&original, &mut target, 100);
        let unchanged = target.app(&path("/api")).unwrap();
        assert_eq!(unchanged.version, 10);
    }
}
