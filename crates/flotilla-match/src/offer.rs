//! The resource-offer model as the matcher sees it.
//!
//! An offer advertises role-tagged resource slices on one agent. Scalars
//! (cpus, mem, disk, gpus) and port ranges arrive as separate slices; a
//! slice may carry a reservation and, for disk, a source.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CPUS: &str = "cpus";
pub const MEM: &str = "mem";
pub const DISK: &str = "disk";
pub const GPUS: &str = "gpus";
pub const PORTS: &str = "ports";

/// The unreserved role.
pub const STAR_ROLE: &str = "*";

/// An inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u32,
    pub end: u32,
}

impl PortRange {
    pub fn contains(&self, port: u32) -> bool {
        port >= self.begin && port <= self.end
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.begin) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.begin
    }
}

/// Scalar amount or port ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResourceValue {
    Scalar(f64),
    Ranges(Vec<PortRange>),
}

/// Who reserved a slice, and under which labels.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReservationInfo {
    pub principal: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Disk provenance; mount disks are indivisible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DiskSource {
    Root,
    Path { path: String },
    Mount { root: String },
}

/// Disk-specific slice facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub source: DiskSource,
    /// Set when the slice backs an existing persistent volume.
    pub persistence_id: Option<String>,
}

/// One role-tagged slice of an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferResource {
    pub name: String,
    pub role: String,
    pub reservation: Option<ReservationInfo>,
    pub disk: Option<DiskInfo>,
    pub value: ResourceValue,
}

impl OfferResource {
    pub fn scalar(name: &str, role: &str, amount: f64) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            reservation: None,
            disk: None,
            value: ResourceValue::Scalar(amount),
        }
    }

    pub fn ports(role: &str, ranges: Vec<PortRange>) -> Self {
        Self {
            name: PORTS.to_string(),
            role: role.to_string(),
            reservation: None,
            disk: None,
            value: ResourceValue::Ranges(ranges),
        }
    }

    pub fn scalar_value(&self) -> f64 {
        match &self.value {
            ResourceValue::Scalar(v) => *v,
            ResourceValue::Ranges(_) => 0.0,
        }
    }

    pub fn is_unreserved(&self) -> bool {
        self.role == STAR_ROLE && self.reservation.is_none()
    }
}

/// A resource offer from the external manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOffer {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    pub attributes: BTreeMap<String, String>,
    pub resources: Vec<OfferResource>,
}

impl ResourceOffer {
    /// Port ranges offered under any of the accepted roles, offer order.
    pub fn port_ranges(&self, accepted_roles: &dyn Fn(&str) -> bool) -> Vec<PortRange> {
        let mut out = Vec::new();
        for res in &self.resources {
            if res.name == PORTS && accepted_roles(&res.role) {
                if let ResourceValue::Ranges(ranges) = &res.value {
                    out.extend(ranges.iter().copied());
                }
            }
        }
        out
    }

    /// The attribute value a constraint field refers to.
    pub fn field_value(&self, field: &str) -> Option<String> {
        if field == "hostname" {
            Some(self.hostname.clone())
        } else {
            self.attributes.get(field).cloned()
        }
    }
}

/// A concrete portion of the offer the launch will consume. The role is
/// carried through untouched; a reserved slice is never re-roled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePortion {
    pub name: String,
    pub role: String,
    pub amount: f64,
    pub reservation: Option<ReservationInfo>,
    pub disk: Option<DiskInfo>,
}
