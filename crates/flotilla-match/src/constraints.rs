//! Placement constraint evaluation.
//!
//! Constraints are checked against the offering agent's attributes (or
//! hostname) and the spec's already-running instances.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;

use flotilla_core::{Constraint, ConstraintOp, Instance};

use crate::offer::ResourceOffer;

/// The constraint field value an instance exposes.
fn instance_field_value(instance: &Instance, field: &str) -> Option<String> {
    if field == "hostname" {
        Some(instance.agent.host.clone())
    } else {
        instance.agent.attributes.get(field).cloned()
    }
}

/// Count running instances per observed field value.
fn value_counts(running: &[Instance], field: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for instance in running {
        if let Some(value) = instance_field_value(instance, field) {
            *counts.entry(value).or_insert(0) += 1;
        }
    }
    counts
}

/// Whether the offer satisfies one constraint given the running fleet.
pub fn satisfied(constraint: &Constraint, offer: &ResourceOffer, running: &[Instance]) -> bool {
    let Some(offer_value) = offer.field_value(&constraint.field) else {
        // An agent without the attribute can never satisfy a constraint
        // on it.
        return false;
    };

    match &constraint.operator {
        ConstraintOp::Unique => running
            .iter()
            .filter_map(|i| instance_field_value(i, &constraint.field))
            .all(|v| v != offer_value),

        ConstraintOp::Cluster(value) => {
            if value.is_empty() {
                // Pin to whatever value the first instance landed on.
                match running
                    .iter()
                    .find_map(|i| instance_field_value(i, &constraint.field))
                {
                    Some(existing) => existing == offer_value,
                    None => true,
                }
            } else {
                &offer_value == value
            }
        }

        ConstraintOp::GroupBy(group_count) => {
            let counts = value_counts(running, &constraint.field);
            let here = counts.get(&offer_value).copied().unwrap_or(0);
            // New values are fine while we have not seen the declared
            // number of groups yet.
            if *group_count > 0 && (counts.len() as u32) < *group_count
                && !counts.contains_key(&offer_value)
            {
                return true;
            }
            let min = counts.values().copied().min().unwrap_or(0);
            here <= min
        }

        ConstraintOp::Like(pattern) => match Regex::new(&anchored(pattern)) {
            Ok(re) => re.is_match(&offer_value),
            Err(e) => {
                debug!(field = %constraint.field, error = %e, "invalid LIKE pattern");
                false
            }
        },

        ConstraintOp::Unlike(pattern) => match Regex::new(&anchored(pattern)) {
            Ok(re) => !re.is_match(&offer_value),
            Err(e) => {
                debug!(field = %constraint.field, error = %e, "invalid UNLIKE pattern");
                false
            }
        },

        ConstraintOp::MaxPer(limit) => {
            let counts = value_counts(running, &constraint.field);
            let here = counts.get(&offer_value).copied().unwrap_or(0);
            (here as u32) < *limit
        }
    }
}

/// Constraint patterns match the whole value.
fn anchored(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}

#[cfg(test)]
mod tests {
    use super::*;

    use flotilla_core::{AgentInfo, InstanceId, PathId, UnreachableStrategy};

    fn offer_on(host: &str, attrs: &[(&str, &str)]) -> ResourceOffer {
        ResourceOffer {
            id: "o1".to_string(),
            agent_id: "a1".to_string(),
            hostname: host.to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            resources: Vec::new(),
        }
    }

    fn running_on(host: &str, attrs: &[(&str, &str)]) -> Instance {
        let spec = PathId::parse("/api").unwrap();
        Instance::provisioned(
            InstanceId::new(&spec),
            AgentInfo {
                host: host.to_string(),
                agent_id: None,
                attributes: attrs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            1,
            UnreachableStrategy::default(),
            Vec::new(),
            0,
        )
    }

    fn constraint(field: &str, op: ConstraintOp) -> Constraint {
        Constraint {
            field: field.to_string(),
            operator: op,
        }
    }

    #[test]
    fn unique_rejects_seen_hostname() {
        let c = constraint("hostname", ConstraintOp::Unique);
        let running = vec![running_on("host-1", &[])];
        assert!(!satisfied(&c, &offer_on("host-1", &[]), &running));
        assert!(satisfied(&c, &offer_on("host-2", &[]), &running));
    }

    #[test]
    fn cluster_with_value_pins_attribute() {
        let c = constraint("rack", ConstraintOp::Cluster("r-1".to_string()));
        assert!(satisfied(&c, &offer_on("h", &[("rack", "r-1")]), &[]));
        assert!(!satisfied(&c, &offer_on("h", &[("rack", "r-2")]), &[]));
    }

    #[test]
    fn cluster_with_empty_value_follows_first_instance() {
        let c = constraint("rack", ConstraintOp::Cluster(String::new()));
        // Nothing running yet: anything goes.
        assert!(satisfied(&c, &offer_on("h", &[("rack", "r-2")]), &[]));

        let running = vec![running_on("h1", &[("rack", "r-1")])];
        assert!(satisfied(&c, &offer_on("h", &[("rack", "r-1")]), &running));
        assert!(!satisfied(&c, &offer_on("h", &[("rack", "r-2")]), &running));
    }

    #[test]
    fn group_by_balances_across_values() {
        let c = constraint("rack", ConstraintOp::GroupBy(2));
        let running = vec![
            running_on("h1", &[("rack", "r-1")]),
            running_on("h2", &[("rack", "r-2")]),
            running_on("h3", &[("rack", "r-2")]),
        ];
        // r-1 has 1, r-2 has 2: only r-1 may take another.
        assert!(satisfied(&c, &offer_on("h", &[("rack", "r-1")]), &running));
        assert!(!satisfied(&c, &offer_on("h", &[("rack", "r-2")]), &running));
    }

    #[test]
    fn group_by_accepts_unseen_value_below_group_count() {
        let c = constraint("rack", ConstraintOp::GroupBy(3));
        let running = vec![running_on("h1", &[("rack", "r-1")])];
        assert!(satisfied(&c, &offer_on("h", &[("rack", "r-2")]), &running));
    }

    #[test]
    fn like_and_unlike_match_whole_value() {
        let like = constraint("rack", ConstraintOp::Like("r-[0-9]+".to_string()));
        assert!(satisfied(&like, &offer_on("h", &[("rack", "r-12")]), &[]));
        assert!(!satisfied(&like, &offer_on("h", &[("rack", "xr-12x")]), &[]));

        let unlike = constraint("rack", ConstraintOp::Unlike("r-1".to_string()));
        assert!(!satisfied(&unlike, &offer_on("h", &[("rack", "r-1")]), &[]));
        assert!(satisfied(&unlike, &offer_on("h", &[("rack", "r-12")]), &[]));
    }

    #[test]
    fn max_per_caps_instances_per_value() {
        let c = constraint("rack", ConstraintOp::MaxPer(2));
        let running = vec![
            running_on("h1", &[("rack", "r-1")]),
            running_on("h2", &[("rack", "r-1")]),
        ];
        assert!(!satisfied(&c, &offer_on("h", &[("rack", "r-1")]), &running));
        assert!(satisfied(&c, &offer_on("h", &[("rack", "r-2")]), &running));
    }

    #[test]
    fn missing_attribute_never_satisfies() {
        let c = constraint("rack", ConstraintOp::Unique);
        assert!(!satisfied(&c, &offer_on("h", &[]), &[]));
    }
}
