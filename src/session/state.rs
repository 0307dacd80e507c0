//! Connection state machine values.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::Serialize;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No usable session. Sends are queued.
    #[default]
    Disconnected,
    /// A handle was requested and the transport is negotiating.
    Connecting,
    /// The transport issued a pairing challenge.
    AwaitingPairing,
    /// Ready for immediate dispatch.
    Open,
    /// Shutdown in progress or complete.
    Closing,
}

impl ConnectionState {
    /// Returns `true` if sends dispatch immediately.
    #[inline]
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_open_is_ready() {
        assert!(ConnectionState::Open.is_open());
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::AwaitingPairing,
            ConnectionState::Closing,
        ] {
            assert!(!state.is_open(), "{state}");
        }
    }

    #[test]
    fn test_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::AwaitingPairing).expect("serialize");
        assert_eq!(json, "\"awaiting_pairing\"");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
