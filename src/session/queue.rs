//! Outbound message buffer.
//!
//! Sends requested while the session is not open are appended here and
//! dispatched in order once it opens. Draining is one entry at a time with
//! a pause after each success, and stops as soon as the session stops
//! being ready; whatever was not dispatched keeps its position.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::identifiers::{EntryId, RecipientId};
use crate::time::Timer;

use super::options::DrainFailurePolicy;

// ============================================================================
// QueueEntry
// ============================================================================

/// A buffered send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    id: EntryId,
    recipient: RecipientId,
    text: String,
    enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Creates an entry with a fresh id.
    #[must_use]
    pub fn new(
        recipient: RecipientId,
        text: impl Into<String>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            recipient,
            text: text.into(),
            enqueued_at,
        }
    }

    /// Entry id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> EntryId {
        self.id
    }

    /// Recipient.
    #[inline]
    #[must_use]
    pub const fn recipient(&self) -> &RecipientId {
        &self.recipient
    }

    /// Message body.
    #[inline]
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// When the entry was queued.
    #[inline]
    #[must_use]
    pub const fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

/// An entry whose drain dispatch failed under [`DrainFailurePolicy::DeadLetter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    /// The failed entry.
    pub entry: QueueEntry,
    /// Failure text.
    pub reason: String,
}

// ============================================================================
// DrainReport
// ============================================================================

/// Why a drain pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainStop {
    /// The queue was empty.
    #[default]
    Empty,
    /// The session stopped being ready.
    NotReady,
    /// A failed entry was put back at the head.
    Requeued,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Entries dispatched successfully.
    pub dispatched: usize,
    /// Entries whose dispatch failed.
    pub failed: usize,
    /// Entries still queued afterwards.
    pub remaining: usize,
    /// Why the pass ended.
    pub stop: DrainStop,
}

impl DrainReport {
    /// Returns `true` if the pass stopped because the session went away.
    #[inline]
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.stop == DrainStop::NotReady
    }
}

// ============================================================================
// OutboundQueue
// ============================================================================

/// Unbounded FIFO of pending sends.
pub struct OutboundQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    policy: DrainFailurePolicy,
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("len", &self.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DrainFailurePolicy::default())
    }
}

impl OutboundQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(policy: DrainFailurePolicy) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(Vec::new()),
            policy,
        }
    }

    /// Appends `entry` and returns the new depth.
    pub fn enqueue(&self, entry: QueueEntry) -> usize {
        let mut entries = self.entries.lock();
        debug!(entry_id = %entry.id, recipient = %entry.recipient, "Entry queued");
        entries.push_back(entry);
        entries.len()
    }

    /// Number of queued entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of queued entries, head first.
    #[must_use]
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Removes every queued entry and returns how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Snapshot of dead-lettered entries.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().clone()
    }

    /// Removes and returns the dead-lettered entries.
    pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.dead_letters.lock())
    }

    /// Failure policy in effect.
    #[inline]
    #[must_use]
    pub const fn policy(&self) -> DrainFailurePolicy {
        self.policy
    }

    /// Dispatches queued entries in order while `is_ready` holds.
    ///
    /// `is_ready` is consulted before every entry. After each successful
    /// dispatch the drain sleeps for `pacing` on `timer`. Failures are
    /// handled per the queue's [`DrainFailurePolicy`].
    pub async fn drain<R, D, Fut>(
        &self,
        mut is_ready: R,
        mut dispatch: D,
        pacing: Duration,
        timer: &dyn Timer,
    ) -> DrainReport
    where
        R: FnMut() -> bool,
        D: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut report = DrainReport::default();

        loop {
            if self.is_empty() {
                report.stop = DrainStop::Empty;
                break;
            }

            if !is_ready() {
                report.stop = DrainStop::NotReady;
                break;
            }

            let Some(entry) = self.entries.lock().pop_front() else {
                report.stop = DrainStop::Empty;
                break;
            };

            match dispatch(entry.clone()).await {
                Ok(()) => {
                    report.dispatched += 1;
                    debug!(entry_id = %entry.id, "Queued entry dispatched");
                    timer.sleep(pacing).await;
                }
                Err(err) => {
                    report.failed += 1;
                    match self.policy {
                        DrainFailurePolicy::Drop => {
                            warn!(
                                entry_id = %entry.id,
                                recipient = %entry.recipient,
                                error = %err,
                                "Queued entry dropped after failed dispatch"
                            );
                        }
                        DrainFailurePolicy::Requeue => {
                            warn!(entry_id = %entry.id, error = %err, "Queued entry put back");
                            self.entries.lock().push_front(entry);
                            report.stop = DrainStop::Requeued;
                            break;
                        }
                        DrainFailurePolicy::DeadLetter => {
                            warn!(entry_id = %entry.id, error = %err, "Queued entry dead-lettered");
                            self.dead_letters.lock().push(DeadLetter {
                                entry,
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            }
        }

        report.remaining = self.len();
        if report.dispatched > 0 || report.failed > 0 {
            info!(
                dispatched = report.dispatched,
                failed = report.failed,
                remaining = report.remaining,
                stop = ?report.stop,
                "Drain pass finished"
            );
        }
        report
    }
}

// ============================================================================
// Tests
// ============================================================================
