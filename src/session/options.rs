//! Manager tuning options.
//!
//! Defaults reproduce the production timings: 5 s reconnect after a
//! transient drop, 10 s after a failed start or exhausted pairing, ×1.5
//! backoff capped at 60 s, 2 s settle time before draining and 1 s between
//! drained messages.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use session_courier::{DrainFailurePolicy, ManagerOptions};
//!
//! let options = ManagerOptions::new()
//!     .with_reconnect_delay(Duration::from_secs(2))
//!     .with_drain_failure_policy(DrainFailurePolicy::DeadLetter);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Pairing challenges allowed before the session is torn down.
pub const MAX_PAIRING_ATTEMPTS: u32 = 3;

/// Queue depth above which health is reported as degraded.
pub const DEGRADED_QUEUE_DEPTH: usize = 100;

// ============================================================================
// DrainFailurePolicy
// ============================================================================

/// What happens to a queued entry whose dispatch fails during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainFailurePolicy {
    /// Log and discard the entry, then continue.
    #[default]
    Drop,
    /// Put the entry back at the head and stop this drain.
    Requeue,
    /// Move the entry to the dead-letter list, then continue.
    DeadLetter,
}

// ============================================================================
// ManagerOptions
// ============================================================================

/// Timing and policy knobs for a [`ConnectionManager`](super::ConnectionManager).
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    /// Initial reconnect delay after a transient close.
    pub reconnect_delay: Duration,

    /// Reconnect delay after a failed `start()`.
    pub start_failure_delay: Duration,

    /// Reconnect delay after pairing attempts are exhausted.
    pub pairing_penalty_delay: Duration,

    /// Upper bound for backoff.
    pub max_reconnect_delay: Duration,

    /// Backoff multiplier applied after each failed reconnect.
    pub backoff_factor: f64,

    /// Pairing challenges allowed per session attempt.
    pub max_pairing_attempts: u32,

    /// Wait between `Open` and the first drained message.
    pub drain_start_delay: Duration,

    /// Wait after each successfully drained message.
    pub drain_pacing: Duration,

    /// Handling of failed drain dispatches.
    pub drain_failure_policy: DrainFailurePolicy,

    /// Queue depth above which health is degraded.
    pub degraded_queue_depth: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ManagerOptions {
    /// Creates options with production defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            start_failure_delay: Duration::from_secs(10),
            pairing_penalty_delay: Duration::from_secs(10),
            max_reconnect_delay: Duration::from_secs(60),
            backoff_factor: 1.5,
            max_pairing_attempts: MAX_PAIRING_ATTEMPTS,
            drain_start_delay: Duration::from_secs(2),
            drain_pacing: Duration::from_secs(1),
            drain_failure_policy: DrainFailurePolicy::Drop,
            degraded_queue_depth: DEGRADED_QUEUE_DEPTH,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ManagerOptions {
    /// Sets the initial reconnect delay after a transient close.
    #[inline]
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the reconnect delay after a failed start.
    #[inline]
    #[must_use]
    pub fn with_start_failure_delay(mut self, delay: Duration) -> Self {
        self.start_failure_delay = delay;
        self
    }

    /// Sets the reconnect delay after pairing exhaustion.
    #[inline]
    #[must_use]
    pub fn with_pairing_penalty_delay(mut self, delay: Duration) -> Self {
        self.pairing_penalty_delay = delay;
        self
    }

    /// Sets the backoff cap.
    #[inline]
    #[must_use]
    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[inline]
    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the pairing attempt ceiling.
    #[inline]
    #[must_use]
    pub fn with_max_pairing_attempts(mut self, attempts: u32) -> Self {
        self.max_pairing_attempts = attempts;
        self
    }

    /// Sets the settle time between `Open` and draining.
    #[inline]
    #[must_use]
    pub fn with_drain_start_delay(mut self, delay: Duration) -> Self {
        self.drain_start_delay = delay;
        self
    }

    /// Sets the pause after each drained message.
    #[inline]
    #[must_use]
    pub fn with_drain_pacing(mut self, pacing: Duration) -> Self {
        self.drain_pacing = pacing;
        self
    }

    /// Sets the drain failure policy.
    #[inline]
    #[must_use]
    pub fn with_drain_failure_policy(mut self, policy: DrainFailurePolicy) -> Self {
        self.drain_failure_policy = policy;
        self
    }

    /// Sets the degraded queue depth threshold.
    #[inline]
    #[must_use]
    pub fn with_degraded_queue_depth(mut self, depth: usize) -> Self {
        self.degraded_queue_depth = depth;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ManagerOptions {
    /// Checks the options for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_pairing_attempts == 0 {
            return Err(Error::config("max_pairing_attempts must be at least 1"));
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(Error::config(format!(
                "backoff_factor must be a finite value >= 1.0, got {}",
                self.backoff_factor
            )));
        }

        let longest_base = self
            .reconnect_delay
            .max(self.start_failure_delay)
            .max(self.pairing_penalty_delay);
        if self.max_reconnect_delay < longest_base {
            return Err(Error::config(format!(
                "max_reconnect_delay ({:?}) is shorter than a base delay ({:?})",
                self.max_reconnect_delay, longest_base
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ManagerOptions::default();
        assert_eq!(options.reconnect_delay, Duration::from_millis(5_000));
        assert_eq!(options.pairing_penalty_delay, Duration::from_millis(10_000));
        assert_eq!(options.max_reconnect_delay, Duration::from_millis(60_000));
        assert_eq!(options.drain_pacing, Duration::from_millis(1_000));
        assert_eq!(options.max_pairing_attempts, 3);
        assert_eq!(options.drain_failure_policy, DrainFailurePolicy::Drop);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_methods_chain() {
        let options = ManagerOptions::new()
            .with_reconnect_delay(Duration::from_secs(1))
            .with_drain_pacing(Duration::ZERO)
            .with_drain_failure_policy(DrainFailurePolicy::Requeue)
            .with_degraded_queue_depth(5);

        assert_eq!(options.reconnect_delay, Duration::from_secs(1));
        assert!(options.drain_pacing.is_zero());
        assert_eq!(options.drain_failure_policy, DrainFailurePolicy::Requeue);
        assert_eq!(options.degraded_queue_depth, 5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ManagerOptions::new().with_max_pairing_attempts(0).validate().is_err());
        assert!(ManagerOptions::new().with_backoff_factor(0.5).validate().is_err());
        assert!(ManagerOptions::new().with_backoff_factor(f64::NAN).validate().is_err());
        assert!(
            ManagerOptions::new()
                .with_max_reconnect_delay(Duration::from_secs(3))
                .validate()
                .is_err()
        );
    }
}
