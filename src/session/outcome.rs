//! Send results.
//!
//! [`ConnectionManager::send`](super::ConnectionManager::send) returns
//! `Result<Delivery>`. Collaborators that need a flat, serializable
//! status (an HTTP handler, a webhook worker) convert it with
//! [`SendOutcome::from_result`].

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;

use crate::error::{Error, Result};
use crate::identifiers::EntryId;

// ============================================================================
// Delivery
// ============================================================================

/// Successful outcome of a send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Dispatched to the transport.
    Sent,
    /// Buffered until the session opens.
    Queued {
        /// Identifier of the queued entry.
        entry_id: EntryId,
        /// Queue depth after the enqueue.
        depth: usize,
    },
}

impl Delivery {
    /// Returns `true` if the message was buffered.
    #[inline]
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

// ============================================================================
// SendStatus / SendOutcome
// ============================================================================

/// Flat status of a send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// Dispatched.
    Sent,
    /// Buffered.
    Queued,
    /// Transport rejected the dispatch.
    DispatchFailed,
    /// Bad recipient or empty text.
    InvalidArgument,
    /// No session handle yet.
    NotInitialized,
    /// Any other failure.
    Error,
}

/// Serializable send result: `{status, detail?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    /// Status discriminator.
    pub status: SendStatus,
    /// Human-readable detail for failures and queued entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SendOutcome {
    /// Flattens a send result.
    #[must_use]
    pub fn from_result(result: &Result<Delivery>) -> Self {
        match result {
            Ok(Delivery::Sent) => Self {
                status: SendStatus::Sent,
                detail: None,
            },
            Ok(Delivery::Queued { entry_id, depth }) => Self {
                status: SendStatus::Queued,
                detail: Some(format!("entry {entry_id} queued at depth {depth}")),
            },
            Err(err) => Self {
                status: match err {
                    Error::InvalidArgument { .. } => SendStatus::InvalidArgument,
                    Error::NotInitialized => SendStatus::NotInitialized,
                    Error::DispatchFailed { .. } => SendStatus::DispatchFailed,
                    _ => SendStatus::Error,
                },
                detail: Some(err.to_string()),
            },
        }
    }

    /// Returns `true` for `Sent` and `Queued`.
    #[inline]
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self.status, SendStatus::Sent | SendStatus::Queued)
    }
}

impl From<Result<Delivery>> for SendOutcome {
    fn from(result: Result<Delivery>) -> Self {
        Self::from_result(&result)
    }
}

// ============================================================================
// Tests
// ============================================================================
