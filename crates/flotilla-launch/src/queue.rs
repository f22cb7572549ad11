//! The launch queue — pending launch demand per run spec.
//!
//! Controllers push demand in; the offer processor drains it against
//! incoming offers, gated by the per-spec launch delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use flotilla_core::{PathId, RunSpec, Timestamp};

use crate::backoff::LaunchDelay;

struct Entry {
    spec: RunSpec,
    pending: u32,
    delay: LaunchDelay,
}

/// Observability row for one queued spec.
#[derive(Debug, Clone)]
pub struct QueuedSpecInfo {
    pub spec: RunSpec,
    pub instances_to_launch: u32,
    pub delay_deadline: Option<Timestamp>,
    /// False while the backoff delay has not elapsed.
    pub overdue: bool,
}

/// Thread-safe launch queue shared between controllers and the offer
/// processor.
#[derive(Clone, Default)]
pub struct LaunchQueue {
    inner: Arc<Mutex<HashMap<PathId, Entry>>>,
}

impl LaunchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add launch demand for a spec.
    ///
    /// A newer spec version replaces the stored one; if it is a
    /// configuration change (not a pure scale), the delay resets to the
    /// configured base.
    pub fn add(&self, spec: RunSpec, count: u32) {
        let mut inner = self.inner.lock().expect("queue lock");
        let path = spec.id().clone();
        match inner.get_mut(&path) {
            Some(entry) => {
                if spec.version() >= entry.spec.version() {
                    if entry.spec.is_upgrade(&spec) {
                        debug!(run_spec = %path, "config change, resetting launch delay");
                        entry.delay.reset(spec.backoff());
                    }
                    entry.spec = spec;
                }
                entry.pending += count;
            }
            None => {
                let delay = LaunchDelay::new(spec.backoff());
                inner.insert(
                    path.clone(),
                    Entry {
                        spec,
                        pending: count,
                        delay,
                    },
                );
            }
        }
        debug!(run_spec = %path, count, "launch demand added");
    }

    /// Reset the launch delay of a spec (forced restarts).
    pub fn reset_delay(&self, path: &PathId) {
        let mut inner = self.inner.lock().expect("queue lock");
        if let Some(entry) = inner.get_mut(path) {
            let strategy = entry.spec.backoff();
            entry.delay.reset(strategy);
            info!(run_spec = %path, "launch delay reset");
        }
    }

    /// Remove a spec and all pending demand.
    pub fn purge(&self, path: &PathId) {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.remove(path).is_some() {
            info!(run_spec = %path, "purged from launch queue");
        }
    }

    /// Pending launch count for a spec.
    pub fn pending(&self, path: &PathId) -> u32 {
        let inner = self.inner.lock().expect("queue lock");
        inner.get(path).map(|e| e.pending).unwrap_or(0)
    }

    /// All entries, for observability.
    pub fn list(&self, now: Timestamp) -> Vec<QueuedSpecInfo> {
        let inner = self.inner.lock().expect("queue lock");
        inner
            .values()
            .map(|e| QueuedSpecInfo {
                spec: e.spec.clone(),
                instances_to_launch: e.pending,
                delay_deadline: e.delay.deadline(),
                overdue: e.delay.overdue(now),
            })
            .collect()
    }

    /// Specs with demand whose delay has elapsed, ready for matching.
    pub fn matchable(&self, now: Timestamp) -> Vec<RunSpec> {
        let inner = self.inner.lock().expect("queue lock");
        inner
            .values()
            .filter(|e| e.pending > 0 && e.delay.overdue(now))
            .map(|e| e.spec.clone())
            .collect()
    }

    /// Consume demand after instances were handed to the driver.
    pub fn mark_launched(&self, path: &PathId, count: u32) {
        let mut inner = self.inner.lock().expect("queue lock");
        if let Some(entry) = inner.get_mut(path) {
            entry.pending = entry.pending.saturating_sub(count);
        }
    }

    /// A launch of this spec failed before reaching Running.
    pub fn on_launch_failed(&self, path: &PathId, now: Timestamp) {
        let mut inner = self.inner.lock().expect("queue lock");
        if let Some(entry) = inner.get_mut(path) {
            entry.delay.on_failure(now);
            debug!(
                run_spec = %path,
                deadline = ?entry.delay.deadline(),
                "launch failed, backing off"
            );
        }
    }

    /// A task of this spec reached Running.
    pub fn on_launch_succeeded(&self, path: &PathId) {
        let mut inner = self.inner.lock().expect("queue lock");
        if let Some(entry) = inner.get_mut(path) {
            entry.delay.on_success();
        }
    }
}
