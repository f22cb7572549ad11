//! Match outcomes and errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an offer failed to satisfy a run spec.
///
/// A `NoMatch` is data, not a failure; the matcher moves on to the next
/// offer and the reasons feed observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoMatchReason {
    InsufficientScalar {
        resource: String,
        requested: f64,
        offered: f64,
    },
    /// A declared port could not be allocated (0 = any free port).
    UnsatisfiedPort(u32),
    UnsatisfiedConstraint(String),
    UnsatisfiedVolumes {
        required_mib: u64,
    },
}

/// Structural problems detected before matching begins.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("spec validation failed: {0}")]
    InvalidSpec(String),
}
