//! Repository — redb-backed durable storage for declared and running state.
//!
//! Stores the root group tree, versioned run-spec snapshots, and instance
//! records. All values are JSON-serialized into redb's `&[u8]` value
//! columns. Supports on-disk and in-memory backends (the latter for
//! tests). Linearizable for the single writer; a committed write is
//! visible to every subsequent read.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use tracing::debug;

use flotilla_core::{Group, Instance, InstanceId, PathId, RunSpec, Timestamp};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const ROOT_KEY: &str = "root";

fn spec_key(path: &PathId, version: Timestamp) -> String {
    format!("{path}@{version:020}")
}

/// Thread-safe repository backed by redb.
#[derive(Clone)]
pub struct Repository {
    db: Arc<Database>,
}

impl Repository {
    /// Open (or create) a persistent repository at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let repo = Self { db: Arc::new(db) };
        repo.ensure_tables()?;
        debug!(?path, "repository opened");
        Ok(repo)
    }

    /// Create an ephemeral in-memory repository (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let repo = Self { db: Arc::new(db) };
        repo.ensure_tables()?;
        debug!("in-memory repository opened");
        Ok(repo)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROOT).map_err(map_err!(Table))?;
        txn.open_table(RUN_SPECS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Root group ─────────────────────────────────────────────────

    /// The stored root group tree, if any.
    pub fn root(&self) -> StateResult<Option<Group>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROOT).map_err(map_err!(Table))?;
        match table.get(ROOT_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let group: Group =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// Store the root group tree.
    pub fn put_root(&self, group: &Group) -> StateResult<()> {
        let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROOT).map_err(map_err!(Table))?;
            table
                .insert(ROOT_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(version = group.version, "root group stored");
        Ok(())
    }

    // ── Run specs ──────────────────────────────────────────────────

    /// Store a versioned snapshot of a run spec.
    pub fn put_spec(&self, spec: &RunSpec) -> StateResult<()> {
        let key = spec_key(spec.id(), spec.version());
        let value = serde_json::to_vec(spec).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUN_SPECS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "run spec stored");
        Ok(())
    }

    /// Latest stored version of the spec at `path`.
    pub fn spec(&self, path: &PathId) -> StateResult<Option<RunSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUN_SPECS).map_err(map_err!(Table))?;
        let start = format!("{path}@");
        let end = format!("{path}@~");
        let mut latest = None;
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            latest = Some(
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?,
            );
        }
        Ok(latest)
    }

    /// A specific stored version of the spec at `path`.
    pub fn spec_version(&self, path: &PathId, version: Timestamp) -> StateResult<Option<RunSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUN_SPECS).map_err(map_err!(Table))?;
        match table
            .get(spec_key(path, version).as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// All stored version timestamps for `path`, oldest first.
    pub fn versions(&self, path: &PathId) -> StateResult<Vec<Timestamp>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUN_SPECS).map_err(map_err!(Table))?;
        let start = format!("{path}@");
        let end = format!("{path}@~");
        let mut out = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let raw = key.value();
            if let Some(version) = raw.rsplit('@').next().and_then(|v| v.parse().ok()) {
                out.push(version);
            }
        }
        Ok(out)
    }

    /// Delete every stored version of the spec at `path`. Returns how many
    /// snapshots were removed.
    pub fn delete_spec(&self, path: &PathId) -> StateResult<usize> {
        let versions = self.versions(path)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUN_SPECS).map_err(map_err!(Table))?;
            for version in &versions {
                table
                    .remove(spec_key(path, *version).as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, removed = versions.len(), "run spec deleted");
        Ok(versions.len())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        let key = instance.id.to_string();
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an instance by id.
    pub fn instance(&self, id: &InstanceId) -> StateResult<Option<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(id.to_string().as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Delete an instance record. Returns true if it existed.
    pub fn delete_instance(&self, id: &InstanceId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table
                .remove(id.to_string().as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// All stored instances.
    pub fn instances(&self) -> StateResult<Vec<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            out.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(out)
    }
}
