//! Persistent-volume matching for resident specs.

use flotilla_core::{AppSpec, VolumeSpec};

use crate::offer::{DiskSource, OfferResource, ResourcePortion, DISK};

/// Outcome of matching the spec's persistent volumes against the offer's
/// disk slices.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeMatch {
    /// The spec declares no persistent volumes.
    NotNeeded,
    /// Disk portions to consume for the volumes.
    Volumes(Vec<ResourcePortion>),
    /// No disk slice can host the volumes.
    Unsatisfied { required_mib: u64 },
}

/// Total persistent-volume demand of the spec, in MiB.
pub fn required_mib(spec: &AppSpec) -> u64 {
    spec.container
        .as_ref()
        .map(|c| {
            c.volumes
                .iter()
                .map(|v| match v {
                    VolumeSpec::Persistent { size_mib, .. } => *size_mib,
                    VolumeSpec::Host { .. } => 0,
                })
                .sum()
        })
        .unwrap_or(0)
}

/// Match the spec's persistent volumes against the offered disks.
///
/// Reserved disk slices carrying a persistence id are preferred (the
/// instance is relaunching onto its own volume). Unreserved root/path
/// disks can be carved; an unreserved mount disk is indivisible and only
/// acceptable when consumed whole.
pub fn match_volumes(spec: &AppSpec, resources: &[OfferResource]) -> VolumeMatch {
    let required = required_mib(spec);
    if required == 0 {
        return VolumeMatch::NotNeeded;
    }
    let required_f = required as f64;

    let disks: Vec<&OfferResource> = resources.iter().filter(|r| r.name == DISK).collect();

    // Existing reserved volume first.
    for disk in &disks {
        let has_persistence = disk
            .disk
            .as_ref()
            .is_some_and(|d| d.persistence_id.is_some());
        if disk.reservation.is_some() && has_persistence && disk.scalar_value() >= required_f {
            return VolumeMatch::Volumes(vec![ResourcePortion {
                name: DISK.to_string(),
                role: disk.role.clone(),
                amount: required_f,
                reservation: disk.reservation.clone(),
                disk: disk.disk.clone(),
            }]);
        }
    }

    // Fresh volume on unreserved disk.
    for disk in &disks {
        if disk.reservation.is_some() {
            continue;
        }
        let source = disk
            .disk
            .as_ref()
            .map(|d| d.source.clone())
            .unwrap_or(DiskSource::Root);
        match source {
            DiskSource::Root | DiskSource::Path { .. } => {
                if disk.scalar_value() >= required_f {
                    return VolumeMatch::Volumes(vec![ResourcePortion {
                        name: DISK.to_string(),
                        role: disk.role.clone(),
                        amount: required_f,
                        reservation: None,
                        disk: disk.disk.clone(),
                    }]);
                }
            }
            DiskSource::Mount { .. } => {
                // Indivisible: take all of it or nothing.
                if disk.scalar_value() >= required_f {
                    return VolumeMatch::Volumes(vec![ResourcePortion {
                        name: DISK.to_string(),
                        role: disk.role.clone(),
                        amount: disk.scalar_value(),
                        reservation: None,
                        disk: disk.disk.clone(),
                    }]);
                }
            }
        }
    }

    VolumeMatch::Unsatisfied {
        required_mib: required,
    }
}
