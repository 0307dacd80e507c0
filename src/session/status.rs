//! Read-only status reporting.

// ============================================================================
// Imports
// ============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::ConnectionState;

// ============================================================================
// Health
// ============================================================================

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Open, not initializing, queue under the threshold.
    Healthy,
    /// Not open, initializing, or queue over the threshold.
    Degraded,
    /// The transport invalidated the session. Needs re-pairing.
    LoggedOut,
}

impl Health {
    /// Classifies from the raw inputs.
    #[must_use]
    pub fn classify(
        state: ConnectionState,
        logged_out: bool,
        initializing: bool,
        queue_depth: usize,
        degraded_depth: usize,
    ) -> Self {
        if logged_out {
            Self::LoggedOut
        } else if !state.is_open() || initializing || queue_depth > degraded_depth {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

// ============================================================================
// LastError
// ============================================================================

/// The most recent recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// Error text.
    pub message: String,
    /// When it was recorded.
    pub at: DateTime<Utc>,
}

// ============================================================================
// StatusSnapshot
// ============================================================================

/// Point-in-time view of a manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Connection state.
    pub state: ConnectionState,
    /// Health classification.
    pub health: Health,
    /// Entries waiting for dispatch.
    pub queue_depth: usize,
    /// Pairing challenges seen for the current attempt.
    pub pairing_attempts: u32,
    /// Whether a reconnect timer is armed.
    pub reconnect_pending: bool,
    /// Whether a start is in progress.
    pub initializing: bool,
    /// Most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

impl StatusSnapshot {
    /// Returns `true` for [`Health::Healthy`].
    #[inline]
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        use ConnectionState::*;

        assert_eq!(Health::classify(Open, false, false, 0, 100), Health::Healthy);
        assert_eq!(Health::classify(Open, false, false, 100, 100), Health::Healthy);
        assert_eq!(Health::classify(Open, false, false, 101, 100), Health::Degraded);
        assert_eq!(Health::classify(Open, false, true, 0, 100), Health::Degraded);
        assert_eq!(Health::classify(Connecting, false, false, 0, 100), Health::Degraded);
        assert_eq!(Health::classify(Disconnected, true, false, 0, 100), Health::LoggedOut);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = StatusSnapshot {
            state: ConnectionState::AwaitingPairing,
            health: Health::Degraded,
            queue_depth: 2,
            pairing_attempts: 1,
            reconnect_pending: false,
            initializing: false,
            last_error: None,
        };

        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["state"], "awaiting_pairing");
        assert_eq!(json["health"], "degraded");
        assert_eq!(json["queueDepth"], 2);
        assert_eq!(json["pairingAttempts"], 1);
        assert!(json.get("lastError").is_none());
        assert!(!snapshot.is_healthy());
    }
}
