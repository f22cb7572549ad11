//! Per-spec launch delay with exponential growth on failures.

use std::time::Duration;

use flotilla_core::{BackoffStrategy, Timestamp};

/// Launch-delay state of one run spec.
///
/// The delay grows by `factor` per failed launch, capped at
/// `max_launch_delay`. A configuration change resets it to the base; a
/// scale change leaves it alone.
#[derive(Debug, Clone)]
pub struct LaunchDelay {
    strategy: BackoffStrategy,
    current: Duration,
    /// Launches wait until this unix-ms deadline passes.
    deadline: Option<Timestamp>,
}

impl LaunchDelay {
    pub fn new(strategy: BackoffStrategy) -> Self {
        Self {
            current: strategy.backoff,
            strategy,
            deadline: None,
        }
    }

    /// A launch failed without an intervening success: push the deadline
    /// out by the current delay, then grow it.
    pub fn on_failure(&mut self, now: Timestamp) {
        self.deadline = Some(now + self.current.as_millis() as Timestamp);
        let grown = self.current.as_secs_f64() * self.strategy.factor;
        self.current = Duration::from_secs_f64(
            grown.min(self.strategy.max_launch_delay.as_secs_f64()),
        );
    }

    /// A task reached Running: failures no longer count as consecutive.
    pub fn on_success(&mut self) {
        self.current = self.strategy.backoff;
        self.deadline = None;
    }

    /// A configuration change resets the delay to the new base.
    pub fn reset(&mut self, strategy: BackoffStrategy) {
        self.strategy = strategy;
        self.current = self.strategy.backoff;
        self.deadline = None;
    }

    /// Whether launches may proceed at `now`.
    pub fn overdue(&self, now: Timestamp) -> bool {
        self.deadline.is_none_or(|d| now >= d)
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }
}
