//! Session Courier - Connection lifecycle and outbound delivery for a
//! messaging transport session.
//!
//! This library keeps one long-lived, authenticated session with a remote
//! messaging transport alive and gives business logic a single reliable
//! `send` entry point.
//!
//! # Architecture
//!
//! - **Transport**: opaque connect / send / event primitives plus a
//!   persistable credential blob (bridge over WebSocket, or loopback)
//! - **Manager**: owns the session handle, reacts to lifecycle events,
//!   reconnects with backoff and buffers sends while the session is down
//!
//! Key design principles:
//!
//! - At most one live session handle; the old one is ended before a new one
//!   is requested
//! - All lifecycle events flow through one dispatcher task
//! - At most one reconnect timer is armed at any time
//! - Queued sends drain in FIFO order once the session opens
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use session_courier::{BridgeTransport, ConnectionManager, FileCredentialStore, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = BridgeTransport::builder()
//!         .url("ws://127.0.0.1:8787")
//!         .build()?;
//!
//!     let manager = ConnectionManager::builder()
//!         .transport(Arc::new(transport))
//!         .credential_store(Arc::new(FileCredentialStore::new("./auth")))
//!         .build()?;
//!
//!     manager.start().await?;
//!
//!     // Queued until the session opens, then delivered in order.
//!     let delivery = manager.send("15551234567", "Hello!").await?;
//!     println!("{delivery:?}");
//!
//!     manager.shutdown().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Transport events, credentials, bridge frames |
//! | [`session`] | [`ConnectionManager`], queue, pairing, reconnect |
//! | [`time`] | Injectable timer and clock |
//! | [`transport`] | Transport seams and adapters |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers for recipients, queue entries, session generations and
/// bridge requests.
pub mod identifiers;

/// Transport-facing message types.
pub mod protocol;

/// Session lifecycle and outbound delivery.
///
/// Use [`ConnectionManager::builder()`] to create a manager.
pub mod session;

/// Injectable timer and clock.
pub mod time;

/// Transport seams and adapters.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{EntryId, RecipientId, RequestId, SessionId};

// Protocol types
pub use protocol::{CloseReason, Credentials, TransportEvent};

// Session types
pub use session::{
    ConnectionManager, ConnectionState, Delivery, DrainFailurePolicy, DrainReport, Health,
    ManagerBuilder, ManagerOptions, OutboundQueue, PairingView, QueueEntry, SendOutcome,
    SendStatus, StatusSnapshot,
};

// Time
pub use time::{Clock, SystemClock, Timer, TokioTimer};

// Transport types
pub use transport::{
    BridgeTransport, BridgeTransportBuilder, CredentialStore, FileCredentialStore,
    LoopbackTransport, MemoryCredentialStore, Session, Transport,
};
