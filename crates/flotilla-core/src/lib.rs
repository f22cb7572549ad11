//! flotilla-core — domain model for the Flotilla orchestrator.
//!
//! Everything the runtime layers agree on lives here: path identifiers,
//! run specifications (apps and pods), the group tree, instances/tasks
//! and their lifecycle conditions, operational strategies, health and
//! readiness check definitions, the orchestrator configuration record,
//! typed events with the in-process bus, and the traits the external
//! resource manager is reached through.
//!
//! The crate is deliberately free of I/O beyond the event bus; state,
//! matching, health, launch, and deployment layers build on top of it.

pub mod check;
pub mod condition;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod group;
pub mod instance;
pub mod path;
pub mod spec;
pub mod strategy;

pub use check::{CheckPolicy, HealthCheck, PortReference, ReadinessCheck};
pub use condition::{Condition, TaskState};
pub use config::OrchestratorConfig;
pub use driver::{
    DriverError, KillReason, KillService, OfferLauncher, SharedKillService, SharedOfferLauncher,
    SharedTaskOps, StatusUpdate, TaskOps,
};
pub use error::ValidationError;
pub use event::{EventBus, OrchestratorEvent};
pub use group::Group;
pub use instance::{
    AgentInfo, Instance, InstanceId, InstanceState, NetworkInfo, Reservation, Task, TaskId,
    TaskKind, TaskStatus,
};
pub use path::PathId;
pub use spec::{
    AppSpec, Artifact, Constraint, ConstraintOp, ContainerSpec, DeclaredPort, Network,
    PodContainer, PodSpec, PortDefinition, PortMapping, Protocol, ResourceRequest, RunSpec,
    Timestamp, VersionInfo, VolumeSpec,
};
pub use strategy::{
    BackoffStrategy, KillSelection, Residency, UnreachableStrategy, UpgradeStrategy,
};
