//! Transport-facing message types.
//!
//! # Protocol Overview
//!
//! | Type | Direction | Purpose |
//! |------|-----------|---------|
//! | [`TransportEvent`] | Transport → Manager | Session lifecycle notification |
//! | [`Credentials`] | Both | Opaque persisted session secret |
//! | [`Request`] | Manager → Bridge | Bridge command |
//! | [`Response`] | Bridge → Manager | Bridge command result |
//! | [`BridgeEvent`] | Bridge → Manager | Raw bridge notification |
//!
//! # Bridge Method Naming
//!
//! Bridge frames use `module.methodName`:
//!
//! - `session.connect`, `session.send`, `session.end`
//! - `connection.update`, `creds.update`

// ============================================================================
// Submodules
// ============================================================================

/// Opaque credential blob.
pub mod credentials;

/// Transport and bridge events.
pub mod event;

/// Bridge request and response frames.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use credentials::Credentials;
pub use event::{BridgeEvent, CloseReason, LOGGED_OUT_STATUS, TransportEvent};
pub use request::{BridgeCommand, Request, Response, ResponseType};
