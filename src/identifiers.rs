//! Type-safe identifiers.
//!
//! Newtype wrappers keep recipients, queue entries, session generations
//! and bridge requests from being mixed up.
//!
//! | Type | Wraps | Source |
//! |------|-------|--------|
//! | [`RecipientId`] | validated digit string | caller input |
//! | [`EntryId`] | UUID v4 | outbound queue |
//! | [`SessionId`] | `NonZeroU32` | process-wide counter |
//! | [`RequestId`] | UUID v4 | bridge request correlation |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, Ordering};

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// RecipientId
// ============================================================================

/// Recipients are 10 to 15 ASCII digits (country code + subscriber number).
static RECIPIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{10,15}$").unwrap_or_else(|e| panic!("invalid recipient pattern: {e}"))
});

/// A validated recipient identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecipientId(String);

impl RecipientId {
    /// Validates and wraps a recipient identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless the input is 10-15 digits.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if RECIPIENT_PATTERN.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(Error::invalid_argument(format!(
                "recipient must be 10-15 digits, got {value:?}"
            )))
        }
    }

    /// Returns the digits as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecipientId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RecipientId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<RecipientId> for String {
    fn from(id: RecipientId) -> Self {
        id.0
    }
}

// ============================================================================
// EntryId
// ============================================================================

/// Identifier of an outbound queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Generates a new random entry ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SessionId
// ============================================================================

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// Generation number of a session handle.
///
/// Every handle the manager creates gets a fresh ID, so events from a
/// replaced handle can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(NonZeroU32);

impl SessionId {
    /// Allocates the next session ID.
    #[must_use]
    pub fn next() -> Self {
        loop {
            let raw = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = NonZeroU32::new(raw) {
                return Self(id);
            }
        }
    }

    /// Wraps a raw value, rejecting zero.
    #[inline]
    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// RequestId
// ============================================================================

/// Correlates bridge requests with their responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a new random request ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipient_accepts_digits() {
        let id = RecipientId::parse("15551234567").expect("valid recipient");
        assert_eq!(id.as_str(), "15551234567");
        assert_eq!(id.to_string(), "15551234567");
    }

    #[test]
    fn test_recipient_length_bounds() {
        assert!(RecipientId::parse("1234567890").is_ok());
        assert!(RecipientId::parse("123456789012345").is_ok());
        assert!(RecipientId::parse("123456789").is_err());
        assert!(RecipientId::parse("1234567890123456").is_err());
    }

    #[test]
    fn test_recipient_rejects_non_digits() {
        for input in ["abc", "", "+15551234567", "1555 1234567", "1555123456７"] {
            let err = RecipientId::parse(input).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { .. }), "{input}");
        }
    }

    #[test]
    fn test_recipient_serde() {
        let id: RecipientId = serde_json::from_str("\"5591937180970\"").expect("parse");
        assert_eq!(id.as_str(), "5591937180970");
        assert!(serde_json::from_str::<RecipientId>("\"oops\"").is_err());
    }

    #[test]
    fn test_session_ids_increase() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(b > a);
        assert!(SessionId::from_u32(0).is_none());
    }

    #[test]
    fn test_request_id_is_transparent() {
        let id = RequestId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
    }
}
