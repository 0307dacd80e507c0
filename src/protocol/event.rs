//! Transport and bridge events.
//!
//! [`TransportEvent`] is what every [`Transport`](crate::transport::Transport)
//! emits. [`BridgeEvent`] is the raw JSON notification sent by a bridge
//! process, converted into transport events by [`BridgeEvent::into_events`].
//!
//! # Bridge Event Types
//!
//! | Method | Params |
//! |--------|--------|
//! | `connection.update` | `connection`, `qr`, `lastDisconnect { statusCode, message }` |
//! | `creds.update` | `credentials` (base64) |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, from_value};
use tracing::warn;

use super::Credentials;

// ============================================================================
// Constants
// ============================================================================

/// Disconnect status code signalling the credentials were invalidated.
pub const LOGGED_OUT_STATUS: u16 = 401;

// ============================================================================
// TransportEvent
// ============================================================================

/// A session lifecycle notification from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport is negotiating the session.
    Connecting,

    /// The transport needs an operator to authorize a new session.
    PairingChallenge {
        /// Token to present to the operator (rendered e.g. as a QR code).
        payload: String,
    },

    /// The session is ready for sends.
    Open,

    /// The session closed.
    Close(CloseReason),

    /// The transport rotated its credentials.
    CredentialsUpdated(Credentials),
}

// ============================================================================
// CloseReason
// ============================================================================

/// Why a session closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloseReason {
    /// The credentials were invalidated. Requires re-pairing.
    LoggedOut {
        /// Reason text from the transport.
        message: String,
    },

    /// Any other close. Recovered by reconnecting.
    Transient {
        /// Status code reported by the transport, if any.
        status_code: Option<u16>,
        /// Reason text from the transport.
        message: String,
    },
}

impl CloseReason {
    /// Classifies a close by its status code.
    #[must_use]
    pub fn from_status(status_code: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        match status_code {
            Some(LOGGED_OUT_STATUS) => Self::LoggedOut { message },
            _ => Self::Transient {
                status_code,
                message,
            },
        }
    }

    /// Creates a transient close without a status code.
    #[inline]
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            status_code: None,
            message: message.into(),
        }
    }

    /// Returns `true` if no reconnect should be attempted.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut { .. })
    }

    /// Returns the reason text.
    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::LoggedOut { message } | Self::Transient { message, .. } => message,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut { message } => write!(f, "logged out: {message}"),
            Self::Transient {
                status_code: Some(code),
                message,
            } => write!(f, "{message} (status {code})"),
            Self::Transient {
                status_code: None,
                message,
            } => f.write_str(message),
        }
    }
}

// ============================================================================
// BridgeEvent
// ============================================================================

/// A raw notification frame from a bridge process.
///
/// # Format
///
/// ```json
/// {
///   "type": "event",
///   "method": "connection.update",
///   "params": { "connection": "close", "lastDisconnect": { "statusCode": 428 } }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeEvent {
    /// Event type marker (always "event").
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event name in `module.eventName` format.
    pub method: String,

    /// Event-specific data.
    #[serde(default)]
    pub params: Value,
}

/// `connection.update` params.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionUpdate {
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    qr: Option<String>,
    #[serde(default)]
    last_disconnect: Option<LastDisconnect>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastDisconnect {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// `creds.update` params.
#[derive(Debug, Deserialize)]
struct CredsUpdate {
    credentials: Credentials,
}

impl BridgeEvent {
    /// Converts the frame into transport events.
    ///
    /// A single `connection.update` may carry both a pairing challenge and a
    /// connection change, so this yields zero or more events. Malformed or
    /// unknown frames are logged and produce nothing.
    #[must_use]
    pub fn into_events(self) -> Vec<TransportEvent> {
        match self.method.as_str() {
            "connection.update" => Self::parse_connection_update(self.params),
            "creds.update" => match from_value::<CredsUpdate>(self.params) {
                Ok(update) => vec![TransportEvent::CredentialsUpdated(update.credentials)],
                Err(e) => {
                    warn!(error = %e, "Malformed creds.update");
                    Vec::new()
                }
            },
            other => {
                warn!(method = %other, "Unknown bridge event");
                Vec::new()
            }
        }
    }

    fn parse_connection_update(params: Value) -> Vec<TransportEvent> {
        let update = match from_value::<ConnectionUpdate>(params) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "Malformed connection.update");
                return Vec::new();
            }
        };

        let mut events = Vec::with_capacity(2);

        if let Some(payload) = update.qr {
            events.push(TransportEvent::PairingChallenge { payload });
        }

        match update.connection.as_deref() {
            Some("connecting") => events.push(TransportEvent::Connecting),
            Some("open") => events.push(TransportEvent::Open),
            Some("close") => {
                let last = update.last_disconnect.unwrap_or_default();
                let message = last.message.unwrap_or_else(|| "unknown".to_string());
                events.push(TransportEvent::Close(CloseReason::from_status(
                    last.status_code,
                    message,
                )));
            }
            Some(other) => warn!(connection = %other, "Unknown connection state"),
            None => {}
        }

        events
    }
}

// ============================================================================
// Tests
// ============================================================================
