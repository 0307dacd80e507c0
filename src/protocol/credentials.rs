//! Opaque credential blob.
//!
//! The transport owns the format. This crate only moves the bytes between
//! the transport and a [`CredentialStore`](crate::transport::CredentialStore).

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;

// ============================================================================
// Credentials
// ============================================================================

/// Persistable session credentials.
///
/// Serializes as a base64 string. `Debug` never prints the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    /// Wraps raw credential bytes.
    #[inline]
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decodes credentials from base64.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Base64`](crate::Error::Base64) on malformed input.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        Ok(Self(STANDARD.decode(encoded)?))
    }

    /// Encodes the credentials as base64.
    #[inline]
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the blob size in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the blob is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

impl Serialize for Credentials {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Credentials {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let creds = Credentials::new(b"noise-key-material".to_vec());
        let debug = format!("{creds:?}");
        assert!(!debug.contains("noise"));
        assert!(debug.contains("len: 18"));
    }

    #[test]
    fn test_serde_uses_base64() {
        let creds = Credentials::new(vec![0u8, 1, 2, 255]);
        let json = serde_json::to_string(&creds).expect("serialize");
        assert_eq!(json, "\"AAEC/w==\"");

        let back: Credentials = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.as_bytes(), &[0, 1, 2, 255]);
    }

    #[test]
    fn test_rejects_bad_base64() {
        assert!(Credentials::from_base64("not base64!").is_err());
        assert!(serde_json::from_str::<Credentials>("\"***\"").is_err());
    }
}
