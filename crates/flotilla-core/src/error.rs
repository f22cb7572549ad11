//! Validation errors for the domain model.

use thiserror::Error;

/// Structural or semantic problems in declared state.
///
/// Validation failures are surfaced to the caller and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("path must be absolute: {0}")]
    RelativePath(String),

    #[error("illegal path segment: {0:?}")]
    InvalidPathSegment(String),

    #[error("duplicate id {0} inside group {1}")]
    DuplicateId(String, String),

    #[error("cyclic dependencies: {0}")]
    CyclicDependencies(String),

    #[error("dependency {0} does not resolve to a known run spec or group")]
    UnknownDependency(String),

    #[error("{0}")]
    Invalid(String),
}
