//! Host-port allocation out of offered ranges.
//!
//! Allocation scratch state is local to one matcher invocation; nothing
//! leaks between offers.

use std::collections::BTreeSet;

use flotilla_core::DeclaredPort;

use crate::offer::PortRange;

/// Outcome of allocating the declared ports of a spec against an offer.
///
/// The binding list is positional: one entry per declared port, `None`
/// for container-only ports that get no host exposure.
#[derive(Debug, Clone, PartialEq)]
pub enum PortsMatch {
    Bindings(Vec<Option<u32>>),
    /// The declared port that could not be satisfied (0 = any).
    Unsatisfied(u32),
}

/// Allocate host ports for `declared` from `ranges`.
///
/// Fixed ports are taken exactly when present; with `require_ports` an
/// absent fixed port fails the match, otherwise the port falls back to a
/// dynamic pick. Dynamic ports (`0`) take the lowest free port, searching
/// ranges in offer order.
pub fn allocate(
    declared: &[DeclaredPort],
    ranges: &[PortRange],
    require_ports: bool,
) -> PortsMatch {
    let mut taken: BTreeSet<u32> = BTreeSet::new();
    let mut bindings = Vec::with_capacity(declared.len());

    for port in declared {
        match port.host_port {
            None => bindings.push(None),
            Some(0) => match lowest_free(ranges, &taken) {
                Some(p) => {
                    taken.insert(p);
                    bindings.push(Some(p));
                }
                None => return PortsMatch::Unsatisfied(0),
            },
            Some(fixed) => {
                let available =
                    ranges.iter().any(|r| r.contains(fixed)) && !taken.contains(&fixed);
                if available {
                    taken.insert(fixed);
                    bindings.push(Some(fixed));
                } else if require_ports {
                    return PortsMatch::Unsatisfied(fixed);
                } else {
                    // Remapping allowed: treat like a dynamic port.
                    match lowest_free(ranges, &taken) {
                        Some(p) => {
                            taken.insert(p);
                            bindings.push(Some(p));
                        }
                        None => return PortsMatch::Unsatisfied(fixed),
                    }
                }
            }
        }
    }

    PortsMatch::Bindings(bindings)
}

/// Lowest port offered and not yet taken, ranges searched in offer order.
fn lowest_free(ranges: &[PortRange], taken: &BTreeSet<u32>) -> Option<u32> {
    for range in ranges {
        let mut candidate = range.begin;
        while candidate <= range.end {
            if !taken.contains(&candidate) {
                return Some(candidate);
            }
            candidate += 1;
        }
    }
    None
}
