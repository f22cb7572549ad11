//! Deployment error types.

use thiserror::Error;

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors that can occur while planning or executing deployments.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The target group's dependency graph has a cycle; no plan exists.
    #[error("cyclic dependencies: {0}")]
    CyclicDependencies(String),

    /// The target group failed structural validation.
    #[error("invalid target group: {0}")]
    InvalidTarget(String),

    /// Another plan already mutates one of the affected specs.
    #[error("conflict: deployment {existing} already affects {path}")]
    Conflict { existing: String, path: String },

    /// The controller was shut down before completing.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A step controller failed.
    #[error("step failed: {0}")]
    StepFailed(String),

    /// Artifact resolution failed.
    #[error("artifact download failed for {url}: {reason}")]
    ArtifactFailed { url: String, reason: String },

    #[error("state error: {0}")]
    State(#[from] flotilla_state::StateError),

    #[error("driver error: {0}")]
    Driver(#[from] flotilla_core::DriverError),
}
