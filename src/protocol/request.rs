//! Bridge request and response frames.
//!
//! Defines the message format for commands sent to a bridge process and
//! the responses it returns.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// BridgeCommand
// ============================================================================

/// Commands understood by a bridge process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum BridgeCommand {
    /// Open a session, resuming from stored credentials when present.
    #[serde(rename = "session.connect")]
    Connect {
        /// Base64 credentials, or `null` to start pairing from scratch.
        credentials: Option<String>,
    },

    /// Send a text message.
    #[serde(rename = "session.send")]
    SendText {
        /// Transport address of the recipient.
        to: String,
        /// Message body.
        text: String,
    },

    /// Close the session without logging out.
    #[serde(rename = "session.end")]
    End,
}

impl BridgeCommand {
    /// Returns the method name for logging.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "session.connect",
            Self::SendText { .. } => "session.send",
            Self::End => "session.end",
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// A command request from this process to the bridge.
///
/// # Format
///
/// ```json
/// {
///   "id": "uuid",
///   "method": "session.send",
///   "params": { "to": "15551234567@s.whatsapp.net", "text": "hi" }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Unique identifier for request/response correlation.
    pub id: RequestId,

    /// Command with method and params.
    #[serde(flatten)]
    pub command: BridgeCommand,
}

impl Request {
    /// Creates a new request with auto-generated ID.
    #[inline]
    #[must_use]
    pub fn new(command: BridgeCommand) -> Self {
        Self {
            id: RequestId::generate(),
            command,
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// Reply to a [`Request`].
///
/// # Format
///
/// Accepted:
/// ```json
/// { "id": "uuid", "type": "success", "result": { ... } }
/// ```
///
/// Rejected:
/// ```json
/// { "id": "uuid", "type": "error", "error": "rate-overlimit", "message": "slow down" }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub id: RequestId,

    /// Outcome discriminator.
    #[serde(rename = "type")]
    pub response_type: ResponseType,

    /// Payload of an accepted request.
    #[serde(default)]
    pub result: Option<Value>,

    /// Machine-readable rejection code.
    #[serde(default)]
    pub error: Option<String>,

    /// Human-readable rejection text.
    #[serde(default)]
    pub message: Option<String>,
}

impl Response {
    /// Returns `true` when the bridge accepted the request.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.response_type, ResponseType::Success)
    }

    /// Converts the reply into its payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] with the bridge's rejection text and
    /// code when the request was rejected.
    pub fn into_result(self) -> Result<Value> {
        if self.is_success() {
            return Ok(self.result.unwrap_or_default());
        }

        let detail = match (self.message, self.error) {
            (Some(message), Some(code)) => format!("{message} [{code}]"),
            (Some(text), None) | (None, Some(text)) => text,
            (None, None) => "bridge rejected the request".to_string(),
        };
        Err(Error::protocol(detail))
    }
}

// ============================================================================
// ResponseType
// ============================================================================

/// Whether the bridge accepted a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Accepted.
    Success,
    /// Rejected.
    Error,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_serialization() {
        let request = Request::new(BridgeCommand::SendText {
            to: "15551234567@s.whatsapp.net".into(),
            text: "hi".into(),
        });
        let value = serde_json::to_value(&request).expect("serialize");

        assert_eq!(value["method"], "session.send");
        assert_eq!(value["params"]["to"], "15551234567@s.whatsapp.net");
        assert_eq!(value["params"]["text"], "hi");
        assert_eq!(value["id"], request.id.to_string());
    }

    #[test]
    fn test_connect_without_credentials() {
        let request = Request::new(BridgeCommand::Connect { credentials: None });
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["method"], "session.connect");
        assert!(value["params"]["credentials"].is_null());
    }

    #[test]
    fn test_end_has_no_params() {
        let value = serde_json::to_value(Request::new(BridgeCommand::End)).expect("serialize");
        assert_eq!(value["method"], "session.end");
        assert!(value.get("params").is_none());
        assert_eq!(BridgeCommand::End.method(), "session.end");
    }

    #[test]
    fn test_error_response_into_result() {
        let json_str = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "error",
            "error": "not-authorized",
            "message": "recipient not on network"
        }"#;

        let response: Response = serde_json::from_str(json_str).expect("parse");
        assert!(!response.is_success());
        let err = response.into_result().expect_err("rejected");
        assert_eq!(
            err.to_string(),
            "Protocol error: recipient not on network [not-authorized]"
        );
    }

    #[test]
    fn test_success_without_result_is_null() {
        let json_str = r#"{"id":"550e8400-e29b-41d4-a716-446655440000","type":"success"}"#;
        let response: Response = serde_json::from_str(json_str).expect("parse");
        assert_eq!(response.into_result().expect("accepted"), Value::Null);
    }

    #[test]
    fn test_event_frame_is_not_a_response() {
        let json_str = r#"{"type":"event","method":"connection.update","params":{}}"#;
        assert!(serde_json::from_str::<Response>(json_str).is_err());
    }
}
