//! Single-flight reconnect timer with capped exponential backoff.
//!
//! At most one timer is armed at a time. Later `schedule` calls while a
//! timer is pending are ignored, so a burst of close events yields exactly
//! one reconnect.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::time::Timer;

// ============================================================================
// BackoffPolicy
// ============================================================================

/// Growth rule for successive reconnect delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    factor: f64,
    max: Duration,
}

impl BackoffPolicy {
    /// Creates a policy multiplying by `factor` up to `max`.
    #[inline]
    #[must_use]
    pub const fn new(factor: f64, max: Duration) -> Self {
        Self { factor, max }
    }

    /// Returns the delay to use after a reconnect at `current` failed.
    ///
    /// Capped at `max`; below the cap the result never shrinks.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.factor)
            .unwrap_or(self.max)
            .max(current)
            .min(self.max)
    }

    /// Upper bound.
    #[inline]
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(1.5, Duration::from_secs(60))
    }
}

// ============================================================================
// ReconnectScheduler
// ============================================================================

struct PendingTimer {
    token: u64,
    delay: Duration,
    task: JoinHandle<()>,
}

/// Arms at most one reconnect timer.
pub struct ReconnectScheduler {
    timer: Arc<dyn Timer>,
    pending: Arc<Mutex<Option<PendingTimer>>>,
    next_token: AtomicU64,
}

impl fmt::Debug for ReconnectScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectScheduler")
            .field("pending_delay", &self.pending_delay())
            .finish_non_exhaustive()
    }
}

impl ReconnectScheduler {
    /// Creates a scheduler sleeping on `timer`.
    #[must_use]
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        Self {
            timer,
            pending: Arc::new(Mutex::new(None)),
            next_token: AtomicU64::new(1),
        }
    }

    /// Arms a timer that calls `on_fire(delay)` after `delay`.
    ///
    /// Returns `false` without arming if a timer is already pending. The
    /// pending marker is cleared before `on_fire` runs, so the callback may
    /// schedule again.
    ///
    /// Must be called within a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, on_fire: F) -> bool
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.as_ref() {
            debug!(
                requested_ms = delay.as_millis() as u64,
                pending_ms = existing.delay.as_millis() as u64,
                "Reconnect already pending"
            );
            return false;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let timer = Arc::clone(&self.timer);
        let marker = Arc::clone(&self.pending);

        let task = tokio::spawn(async move {
            timer.sleep(delay).await;

            {
                let mut pending = marker.lock();
                if pending.as_ref().map(|p| p.token) != Some(token) {
                    return;
                }
                *pending = None;
            }

            trace!(delay_ms = delay.as_millis() as u64, "Reconnect timer fired");
            on_fire(delay);
        });

        debug!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        *pending = Some(PendingTimer { token, delay, task });
        true
    }

    /// Cancels the pending timer, if any.
    ///
    /// Returns `true` if a timer was cancelled.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(pending) => {
                pending.task.abort();
                debug!(delay_ms = pending.delay.as_millis() as u64, "Reconnect cancelled");
                true
            }
            None => false,
        }
    }

    /// Returns `true` if a timer is armed.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Returns the delay of the armed timer.
    #[must_use]
    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending.lock().as_ref().map(|p| p.delay)
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.lock().take() {
            pending.task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
