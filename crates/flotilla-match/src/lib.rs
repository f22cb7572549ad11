//! flotilla-match — offer matching for the Flotilla orchestrator.
//!
//! Given a run spec, a resource offer, and the spec's running instances,
//! the matcher decides whether the offer satisfies the spec's scalar,
//! port, role, constraint, and persistent-volume requirements, and builds
//! the concrete launch descriptor when it does.
//!
//! # Components
//!
//! - **`offer`** — the role-tagged offer model
//! - **`matcher`** — the decision procedure
//! - **`constraints`** — UNIQUE / CLUSTER / GROUP_BY / LIKE / UNLIKE / MAX_PER
//! - **`ports`** — host-port allocation out of offered ranges
//! - **`volumes`** — persistent-volume matching for resident specs
//! - **`env`**, **`descriptor`** — the observable launch payload

pub mod constraints;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod matcher;
pub mod offer;
pub mod ports;
pub mod volumes;

pub use descriptor::{DelegatedCheck, DiscoveryPort, LaunchDescriptor, PortScope};
pub use error::{MatchError, NoMatchReason};
pub use matcher::{match_offer, OfferMatch, OfferMatchResult};
pub use offer::{
    DiskInfo, DiskSource, OfferResource, PortRange, ReservationInfo, ResourceOffer,
    ResourcePortion, ResourceValue,
};
pub use ports::PortsMatch;
