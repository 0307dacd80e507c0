//! Pairing challenge tracking.
//!
//! Each challenge the transport issues (a QR payload in practice) bumps an
//! attempt counter. Reaching the ceiling trips the breaker: the caller must
//! tear the session down and retry after a penalty delay.

// ============================================================================
// Imports
// ============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

// ============================================================================
// Types
// ============================================================================

/// The most recent pairing challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingChallenge {
    /// Opaque payload to present to the operator.
    pub payload: String,
    /// When the challenge arrived.
    pub issued_at: DateTime<Utc>,
}

/// Result of recording a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeVerdict {
    /// Keep waiting for the operator.
    Pending {
        /// Attempts used so far, including this one.
        attempt: u32,
    },
    /// Ceiling reached. The counter has been reset.
    Exhausted,
}

/// Operator-facing pairing status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingView {
    /// Current challenge, if one is outstanding.
    pub challenge: Option<PairingChallenge>,
    /// Attempts used.
    pub attempts: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
}

// ============================================================================
// PairingFlow
// ============================================================================

/// Attempt counter with a ceiling.
#[derive(Debug, Clone)]
pub struct PairingFlow {
    attempts: u32,
    max_attempts: u32,
    challenge: Option<PairingChallenge>,
}

impl PairingFlow {
    /// Creates a flow allowing `max_attempts` challenges.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            challenge: None,
        }
    }

    /// Records a challenge issued at `now`.
    pub fn on_challenge(
        &mut self,
        payload: impl Into<String>,
        now: DateTime<Utc>,
    ) -> ChallengeVerdict {
        self.attempts += 1;

        if self.attempts >= self.max_attempts {
            warn!(
                attempts = self.attempts,
                max = self.max_attempts,
                "Pairing attempts exhausted"
            );
            self.reset();
            return ChallengeVerdict::Exhausted;
        }

        debug!(attempt = self.attempts, max = self.max_attempts, "Pairing challenge issued");
        self.challenge = Some(PairingChallenge {
            payload: payload.into(),
            issued_at: now,
        });

        ChallengeVerdict::Pending {
            attempt: self.attempts,
        }
    }

    /// Clears the counter and any outstanding challenge.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.challenge = None;
    }

    /// Attempts used so far.
    #[inline]
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Snapshot for presentation.
    #[must_use]
    pub fn view(&self) -> PairingView {
        PairingView {
            challenge: self.challenge.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_third_challenge_exhausts() {
        let mut flow = PairingFlow::new(3);
        let now = Utc::now();

        assert_eq!(flow.on_challenge("a", now), ChallengeVerdict::Pending { attempt: 1 });
        assert_eq!(flow.on_challenge("b", now), ChallengeVerdict::Pending { attempt: 2 });
        assert_eq!(flow.view().challenge.map(|c| c.payload), Some("b".to_string()));

        assert_eq!(flow.on_challenge("c", now), ChallengeVerdict::Exhausted);
        assert_eq!(flow.attempts(), 0);
        assert!(flow.view().challenge.is_none());
    }

    #[test]
    fn test_reset_restarts_count() {
        let mut flow = PairingFlow::new(3);
        let now = Utc::now();

        flow.on_challenge("a", now);
        flow.on_challenge("b", now);
        flow.reset();

        assert_eq!(flow.on_challenge("c", now), ChallengeVerdict::Pending { attempt: 1 });
    }

    #[test]
    fn test_single_attempt_ceiling() {
        let mut flow = PairingFlow::new(1);
        assert_eq!(flow.on_challenge("a", Utc::now()), ChallengeVerdict::Exhausted);
    }

    #[test]
    fn test_view_serializes_camel_case() {
        let mut flow = PairingFlow::new(3);
        flow.on_challenge("qr-data", Utc::now());

        let json = serde_json::to_value(flow.view()).expect("serialize");
        assert_eq!(json["attempts"], 1);
        assert_eq!(json["maxAttempts"], 3);
        assert_eq!(json["challenge"]["payload"], "qr-data");
        assert!(json["challenge"]["issuedAt"].is_string());
    }
}
