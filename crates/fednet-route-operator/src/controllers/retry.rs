//! Retry policy for reconcile errors
//!
//! Errors are classified as transient or permanent. Transient errors are
//! retried on the fixed reconcile interval; kernel state drift is corrected on
//! the same cadence so there is nothing to gain from a faster or growing delay.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::{debug, warn};

/// Tracks consecutive failed attempts per resource
///
/// Uses a std mutex so `error_policy` (a sync callback) can update it.
#[derive(Debug, Default)]
pub struct RetryTracker {
    /// Map of resource key to consecutive failure count
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment failure count for a resource and return the new count
    pub fn increment(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset failure count (successful reconcile or completed teardown)
    pub fn reset(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(key);
    }

    pub fn get(&self, key: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.get(key).copied().unwrap_or(0)
    }
}

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Kernel call or API failures, retried on the fixed interval
    Transient,
    /// Missing metadata or unparsable CIDRs; nothing changes until the
    /// resource is edited
    Permanent,
}

/// Action to take after a failed reconcile
pub fn retry_action(attempt: u32, kind: ErrorKind, interval: Duration) -> Action {
    match kind {
        ErrorKind::Transient => {
            debug!(
                attempt,
                delay_secs = interval.as_secs(),
                "Scheduling retry"
            );
            Action::requeue(interval)
        }
        ErrorKind::Permanent => {
            warn!(attempt, "Permanent error, waiting for resource change");
            Action::await_change()
        }
    }
}
