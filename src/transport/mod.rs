//! Transport seams and adapters.
//!
//! The manager never speaks the messaging protocol itself. It drives a
//! [`Transport`] that hands out [`Session`] handles plus an event stream,
//! and persists credentials through a [`CredentialStore`].
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐   connect(creds)   ┌────────────────────┐
//! │ ConnectionManager  │───────────────────►│     Transport      │
//! │                    │◄───────────────────│                    │
//! │  SessionSlot       │  Session + events  │ bridge / loopback  │
//! └─────────┬──────────┘                    └────────────────────┘
//!           │ load / save
//!           ▼
//! ┌────────────────────┐
//! │  CredentialStore   │  file / memory
//! └────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `bridge` | JSON-over-WebSocket client for an out-of-process bridge |
//! | `loopback` | In-process scriptable transport |
//! | `store` | Credential stores |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket bridge transport.
pub mod bridge;

/// In-process transport for tests and local development.
pub mod loopback;

/// Credential storage.
pub mod store;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;
use crate::identifiers::RecipientId;
use crate::protocol::{Credentials, TransportEvent};

// ============================================================================
// Re-exports
// ============================================================================

pub use bridge::{BridgeTransport, BridgeTransportBuilder};
pub use loopback::{LoopbackTransport, SentMessage};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};

// ============================================================================
// Types
// ============================================================================

/// Stream of events for one session handle.
///
/// Ends when the handle is gone.
pub type EventStream = BoxStream<'static, TransportEvent>;

// ============================================================================
// Session
// ============================================================================

/// A live session handle.
#[async_trait]
pub trait Session: Send + Sync {
    /// Sends a text message.
    ///
    /// # Errors
    ///
    /// Any transport failure; the manager reports it as
    /// [`Error::DispatchFailed`](crate::Error::DispatchFailed).
    async fn send_text(&self, recipient: &RecipientId, text: &str) -> Result<()>;

    /// Tears the handle down without logging out.
    ///
    /// # Errors
    ///
    /// Teardown failures are logged by the manager and otherwise ignored.
    async fn end(&self) -> Result<()>;
}

// ============================================================================
// Transport
// ============================================================================

/// A freshly opened session.
pub struct Connected {
    /// The handle used for sends and teardown.
    pub session: Arc<dyn Session>,
    /// Lifecycle events for this handle.
    pub events: EventStream,
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected").finish_non_exhaustive()
    }
}

/// Factory for session handles.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new session, resuming from `credentials` when present.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be created; the manager
    /// schedules a reconnect.
    async fn connect(&self, credentials: Option<Credentials>) -> Result<Connected>;
}
