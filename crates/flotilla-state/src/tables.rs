//! redb table definitions for the Flotilla repository.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Run-spec keys carry the version (`{path}@{version:020}`) so a
//! range scan over `{path}@` yields the version history in order.

use redb::TableDefinition;

/// The group tree under the singleton key `root`.
pub const ROOT: TableDefinition<&str, &[u8]> = TableDefinition::new("root");

/// Versioned run-spec snapshots keyed by `{path}@{version:020}`.
pub const RUN_SPECS: TableDefinition<&str, &[u8]> = TableDefinition::new("run_specs");

/// Instances keyed by instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");
