//! flotilla-deploy — deployment planning and execution.
//!
//! The planner diffs a current group tree against a target tree into an
//! ordered `DeploymentPlan`; the executor drives each plan step by step,
//! spawning one controller per action. Controllers converge the fleet
//! through the launch queue and the kill service while observing tracker
//! and health events.
//!
//! # Components
//!
//! - **`plan`** — plans, steps, actions
//! - **`planner`** — group diff, dependency ordering, cycle rejection
//! - **`executor`** — sequential step driver with conflict detection,
//!   force-cancel, and rollback
//! - **`steps`** — the per-action controllers (start, scale, rolling
//!   restart, stop, resolve-artifacts)
//! - **`readiness_behavior`** — the shared "ready for rollout" tracking

pub mod error;
pub mod executor;
pub mod plan;
pub mod planner;
pub mod readiness_behavior;
pub mod steps;

pub use error::{DeployError, DeployResult};
pub use executor::DeploymentManager;
pub use plan::{DeploymentAction, DeploymentPlan, DeploymentStep};
pub use planner::{plan, stamp_versions};
pub use readiness_behavior::{ReadinessBehavior, ReadySignal};
pub use steps::{run_action, StepContext};
