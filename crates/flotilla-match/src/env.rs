//! Task environment construction.
//!
//! The generated variables are an observable contract: launched tasks
//! discover their ports, host, and app identity through them. User env
//! always wins over anything generated here.

use std::collections::BTreeMap;

use flotilla_core::{AppSpec, DeclaredPort, TaskId};

/// Longest key or value that still makes it into a `_LABEL_` variable.
const LABEL_ENV_LIMIT: usize = 512;

/// Variables emitted without the configured prefix regardless.
const UNPREFIXED: [&str; 2] = ["MESOS_TASK_ID", "MARATHON_APP_"];

/// Build the full environment for one task.
///
/// `bindings` is positional over `declared` (None = container-only port).
pub fn task_env(
    spec: &AppSpec,
    declared: &[DeclaredPort],
    bindings: &[Option<u32>],
    task_id: &TaskId,
    host: &str,
    env_prefix: Option<&str>,
) -> BTreeMap<String, String> {
    let mut generated = BTreeMap::new();

    // Host ports in declared order.
    let host_ports: Vec<u32> = bindings.iter().flatten().copied().collect();
    for (i, port) in host_ports.iter().enumerate() {
        generated.insert(format!("PORT{i}"), port.to_string());
    }
    generated.insert(
        "PORTS".to_string(),
        host_ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(","),
    );

    // PORT_<declared> and PORT_<NAME> aliases.
    for (slot, binding) in declared.iter().zip(bindings) {
        let Some(allocated) = binding else { continue };
        if let Some(requested) = slot.host_port {
            if requested != 0 {
                generated.insert(format!("PORT_{requested}"), allocated.to_string());
            }
        }
        generated.insert(format!("PORT_{allocated}"), allocated.to_string());
        if let Some(name) = &slot.name {
            generated.insert(
                format!("PORT_{}", sanitize(name)),
                allocated.to_string(),
            );
        }
    }

    generated.insert("HOST".to_string(), host.to_string());
    generated.insert("MESOS_TASK_ID".to_string(), task_id.to_string());
    generated.insert("MARATHON_APP_ID".to_string(), spec.id.to_string());
    generated.insert("MARATHON_APP_VERSION".to_string(), spec.version.to_string());
    generated.insert(
        "MARATHON_APP_RESOURCE_CPUS".to_string(),
        spec.resources.cpus.to_string(),
    );
    generated.insert(
        "MARATHON_APP_RESOURCE_MEM".to_string(),
        spec.resources.mem.to_string(),
    );
    generated.insert(
        "MARATHON_APP_RESOURCE_DISK".to_string(),
        spec.resources.disk.to_string(),
    );
    generated.insert(
        "MARATHON_APP_RESOURCE_GPUS".to_string(),
        spec.resources.gpus.to_string(),
    );

    // Labels: every key whose sanitized form fits appears in the list;
    // the per-label variable additionally requires the value to fit.
    let mut label_keys = Vec::new();
    for (key, value) in &spec.labels {
        let sanitized = sanitize(key);
        if sanitized.len() > LABEL_ENV_LIMIT {
            continue;
        }
        label_keys.push(sanitized.clone());
        if value.len() <= LABEL_ENV_LIMIT {
            generated.insert(format!("MARATHON_APP_LABEL_{sanitized}"), value.clone());
        }
    }
    generated.insert("MARATHON_APP_LABELS".to_string(), label_keys.join(" "));

    // Apply the prefix to everything outside the whitelist.
    let mut out = BTreeMap::new();
    for (key, value) in generated {
        let key = match env_prefix {
            Some(prefix) if !UNPREFIXED.iter().any(|w| key.starts_with(w)) => {
                format!("{prefix}{key}")
            }
            _ => key,
        };
        out.insert(key, value);
    }

    // User-supplied env overrides any generated variable of the same name.
    for (key, value) in &spec.env {
        out.insert(key.clone(), value.clone());
    }

    out
}

/// Uppercase and replace everything outside `[A-Z0-9_]`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let up = c.to_ascii_uppercase();
            if up.is_ascii_alphanumeric() || up == '_' {
                up
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{PathId, Protocol};

    fn spec() -> AppSpec {
        let mut s = AppSpec::new(PathId::parse("/prod/web/api").unwrap());
        s.version = 1700000000000;
        s
    }

    fn port(host_port: Option<u32>, name: Option<&str>) -> DeclaredPort {
        DeclaredPort {
            host_port,
            name: name.map(str::to_string),
            protocol: Protocol::Tcp,
            labels: BTreeMap::new(),
        }
    }

    fn task_id() -> TaskId {
        TaskId("prod_web_api.uuid-1".to_string())
    }

    #[test]
    fn positional_port_variables() {
        let declared = [port(Some(0), None), port(Some(0), None)];
        let env = task_env(
            &spec(),
            &declared,
            &[Some(31000), Some(31001)],
            &task_id(),
            "agent-1",
            None,
        );
        assert_eq!(env.get("PORT0").unwrap(), "31000");
        assert_eq!(env.get("PORT1").unwrap(), "31001");
        assert_eq!(env.get("PORTS").unwrap(), "31000,31001");
        assert_eq!(env.get("HOST").unwrap(), "agent-1");
    }

    #[test]
    fn declared_and_named_port_aliases() {
        let declared = [port(Some(8080), Some("http-api"))];
        let env = task_env(&spec(), &declared, &[Some(31000)], &task_id(), "h", None);
        assert_eq!(env.get("PORT_8080").unwrap(), "31000");
        assert_eq!(env.get("PORT_31000").unwrap(), "31000");
        assert_eq!(env.get("PORT_HTTP_API").unwrap(), "31000");
    }

    #[test]
    fn container_only_ports_are_skipped_positionally() {
        let declared = [port(None, None), port(Some(0), None)];
        let env = task_env(&spec(), &declared, &[None, Some(31000)], &task_id(), "h", None);
        // Only one host port: PORT0 refers to it.
        assert_eq!(env.get("PORT0").unwrap(), "31000");
        assert!(!env.contains_key("PORT1"));
    }

    #[test]
    fn app_identity_variables() {
        let env = task_env(&spec(), &[], &[], &task_id(), "h", None);
        assert_eq!(env.get("MARATHON_APP_ID").unwrap(), "/prod/web/api");
        assert_eq!(env.get("MESOS_TASK_ID").unwrap(), "prod_web_api.uuid-1");
        assert_eq!(env.get("MARATHON_APP_RESOURCE_CPUS").unwrap(), "1");
        assert_eq!(env.get("MARATHON_APP_RESOURCE_MEM").unwrap(), "128");
    }

    #[test]
    fn user_env_wins_over_generated() {
        let mut s = spec();
        s.env.insert("HOST".to_string(), "pinned-host".to_string());
        s.env.insert("CUSTOM".to_string(), "1".to_string());
        let env = task_env(&s, &[], &[], &task_id(), "agent-1", None);
        assert_eq!(env.get("HOST").unwrap(), "pinned-host");
        assert_eq!(env.get("CUSTOM").unwrap(), "1");
    }

    #[test]
    fn labels_are_sanitized_and_listed() {
        let mut s = spec();
        s.labels.insert("team.name".to_string(), "fleet".to_string());
        s.labels.insert("tier".to_string(), "web".to_string());
        let env = task_env(&s, &[], &[], &task_id(), "h", None);
        assert_eq!(env.get("MARATHON_APP_LABEL_TEAM_NAME").unwrap(), "fleet");
        assert_eq!(env.get("MARATHON_APP_LABEL_TIER").unwrap(), "web");
        assert_eq!(env.get("MARATHON_APP_LABELS").unwrap(), "TEAM_NAME TIER");
    }

    #[test]
    fn oversized_label_value_is_skipped_but_key_remains_listed() {
        let mut s = spec();
        s.labels
            .insert("big".to_string(), "x".repeat(LABEL_ENV_LIMIT + 1));
        let env = task_env(&s, &[], &[], &task_id(), "h", None);
        assert!(!env.contains_key("MARATHON_APP_LABEL_BIG"));
        assert_eq!(env.get("MARATHON_APP_LABELS").unwrap(), "BIG");
    }

    #[test]
    fn prefix_applies_outside_the_whitelist() {
        let declared = [port(Some(0), None)];
        let env = task_env(
            &spec(),
            &declared,
            &[Some(31000)],
            &task_id(),
            "h",
            Some("FLOTILLA_"),
        );
        assert_eq!(env.get("FLOTILLA_PORT0").unwrap(), "31000");
        assert_eq!(env.get("FLOTILLA_HOST").unwrap(), "h");
        // Whitelisted names stay unprefixed.
        assert!(env.contains_key("MESOS_TASK_ID"));
        assert!(env.contains_key("MARATHON_APP_ID"));
        assert!(!env.contains_key("PORT0"));
    }
}
