//! Bridge protocol message types
//!
//! Defines the wire frame exchanged between the stub and the local bridge,
//! plus the JSON payload schemas carried inside `Init`, `Next` and `Error`
//! frames.

use super::digest::{digest, Digest};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Longest request id accepted on the wire
pub const MAX_REQUEST_ID_LEN: usize = 64;

/// Kind of bridge frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Handler metadata announced by the local bridge at startup
    Init,
    /// Liveness probe, echoed by the local bridge
    Ping,
    /// An invocation request
    Next,
    /// A successful invocation result
    Response,
    /// A failed invocation result
    Error,
    /// Tells the stub to discard cached metadata
    Reboot,
}

impl MessageKind {
    /// Whether the frame takes part in request/response correlation
    pub fn is_correlated(self) -> bool {
        matches!(
            self,
            MessageKind::Next | MessageKind::Response | MessageKind::Error
        )
    }

    /// Whether the frame completes a pending request
    pub fn is_result(self) -> bool {
        matches!(self, MessageKind::Response | MessageKind::Error)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Init => "Init",
            MessageKind::Ping => "Ping",
            MessageKind::Next => "Next",
            MessageKind::Response => "Response",
            MessageKind::Error => "Error",
            MessageKind::Reboot => "Reboot",
        };
        f.write_str(name)
    }
}

/// One bridge frame
///
/// A logical message spans `total_chunks` frames sharing `request_id` and
/// `digest`, with `sequence` in `0..total_chunks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMessage {
    /// Frame kind
    pub kind: MessageKind,
    /// Correlation id
    pub request_id: String,
    /// Position of this chunk
    pub sequence: u32,
    /// Number of chunks in the logical message
    pub total_chunks: u32,
    /// SHA-256 of the whole logical payload
    pub digest: Digest,
    /// Chunk bytes
    pub payload: Bytes,
}

impl BridgeMessage {
    /// Build a single-frame message
    pub fn new(kind: MessageKind, request_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        BridgeMessage {
            kind,
            request_id: request_id.into(),
            sequence: 0,
            total_chunks: 1,
            digest: digest(&payload),
            payload,
        }
    }

    /// Build a `Ping`
    pub fn ping(request_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Ping, request_id, Bytes::new())
    }

    /// Build a `Reboot`
    pub fn reboot(request_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Reboot, request_id, Bytes::new())
    }

    /// Whether this frame carries the whole logical message
    pub fn is_complete(&self) -> bool {
        self.total_chunks == 1
    }
}

/// How the caller waits for an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InvocationType {
    /// Caller waits for the result
    #[default]
    RequestResponse,
    /// Fire and forget
    Event,
    /// Validation only
    DryRun,
}

/// Handler metadata carried by `Init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMetadata {
    /// Function id within the app
    pub function_id: String,
    /// Deployed function name
    pub function_name: String,
    /// Handler entry point
    pub handler: String,
    /// Declared memory in MB
    pub memory_mb: u32,
    /// Declared timeout in milliseconds
    pub timeout_ms: u64,
    /// Declared environment
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Invocation request carried by `Next`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    /// Function to run
    pub function_id: String,
    /// Remote request id
    pub aws_request_id: String,
    /// Deadline as milliseconds since the Unix epoch
    pub deadline_ms: u64,
    /// Invocation type
    #[serde(default)]
    pub invocation_type: InvocationType,
    /// Function ARN as seen remotely
    #[serde(default)]
    pub invoked_function_arn: Option<String>,
    /// Remote environment of the stub
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Client context, passed through
    #[serde(default)]
    pub client_context: Option<serde_json::Value>,
    /// Cognito identity, passed through
    #[serde(default)]
    pub identity: Option<serde_json::Value>,
    /// The event
    pub event: serde_json::Value,
}

/// Structured error carried by `Error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error class
    #[serde(rename = "errorType")]
    pub error_type: String,
    /// Error message
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    /// Stack trace lines
    #[serde(default)]
    pub trace: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_kind_classes() {
        assert!(MessageKind::Next.is_correlated());
        assert!(MessageKind::Response.is_result());
        assert!(MessageKind::Error.is_result());
        assert!(!MessageKind::Ping.is_correlated());
        assert!(!MessageKind::Init.is_correlated());
        assert!(!MessageKind::Reboot.is_result());
    }

    #[test]
    fn test_message_kind_display() {
        assert_eq!(MessageKind::Response.to_string(), "Response");
        assert_eq!(MessageKind::Reboot.to_string(), "Reboot");
    }

    #[test]
    fn test_new_message_is_single_chunk() {
        let msg = BridgeMessage::new(MessageKind::Response, "r1", Bytes::from_static(b"pong"));
        assert_eq!(msg.sequence, 0);
        assert_eq!(msg.total_chunks, 1);
        assert!(msg.is_complete());
        assert_eq!(msg.digest, digest(b"pong"));
    }

    #[test]
    fn test_invocation_request_json() {
        let raw = json!({
            "functionId": "api",
            "awsRequestId": "c0ffee",
            "deadlineMs": 1_700_000_000_000u64,
            "invocationType": "Event",
            "event": {"path": "/orders"}
        });
        let request: InvocationRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.function_id, "api");
        assert_eq!(request.invocation_type, InvocationType::Event);
        assert!(request.environment.is_empty());
        assert_eq!(request.event["path"], "/orders");
    }

    #[test]
    fn test_error_payload_field_names() {
        let payload = ErrorPayload {
            error_type: "TypeError".to_string(),
            error_message: "boom".to_string(),
            trace: vec![],
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["errorType"], "TypeError");
        assert_eq!(value["errorMessage"], "boom");
    }

    #[test]
    fn test_function_metadata_camel_case() {
        let meta = FunctionMetadata {
            function_id: "api".to_string(),
            function_name: "shop-dev-api".to_string(),
            handler: "index.handler".to_string(),
            memory_mb: 512,
            timeout_ms: 3000,
            environment: BTreeMap::new(),
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["functionName"], "shop-dev-api");
        assert_eq!(value["memoryMb"], 512);
    }
}
