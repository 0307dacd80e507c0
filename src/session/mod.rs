//! Session lifecycle and outbound delivery.
//!
//! # Components
//!
//! | Module | Description |
//! |--------|-------------|
//! | `pairing` | Pairing challenge counter with an attempt ceiling |
//! | `reconnect` | Single-flight reconnect timer and backoff |
//! | `queue` | FIFO buffer for sends while the session is not open |
//! | `manager` | Owns the session handle and coordinates the above |
//!
//! # State Machine
//!
//! ```text
//!                start()          Open
//! Disconnected ─────────► Connecting ─────► Open
//!      ▲                    │    ▲            │
//!      │        challenge   ▼    │ Open       │ Close
//!      │             AwaitingPairing          │
//!      │                    │ 3rd challenge   │
//!      └────────────────────┴─────────────────┘
//!                (reconnect scheduled unless logged out)
//!
//! any state ── shutdown() ──► Closing
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Builder for [`ConnectionManager`].
pub mod builder;

/// The connection manager.
pub mod manager;

/// Timing and policy options.
pub mod options;

/// Send results.
pub mod outcome;

/// Pairing challenge tracking.
pub mod pairing;

/// Outbound queue.
pub mod queue;

/// Reconnect scheduling.
pub mod reconnect;

/// Connection state.
pub mod state;

/// Status snapshots.
pub mod status;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ManagerBuilder;
pub use manager::ConnectionManager;
pub use options::{DEGRADED_QUEUE_DEPTH, DrainFailurePolicy, MAX_PAIRING_ATTEMPTS, ManagerOptions};
pub use outcome::{Delivery, SendOutcome, SendStatus};
pub use pairing::{ChallengeVerdict, PairingChallenge, PairingFlow, PairingView};
pub use queue::{DeadLetter, DrainReport, DrainStop, OutboundQueue, QueueEntry};
pub use reconnect::{BackoffPolicy, ReconnectScheduler};
pub use state::ConnectionState;
pub use status::{Health, LastError, StatusSnapshot};
