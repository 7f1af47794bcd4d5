//! CDP Protocol Types
//!
//! The wire envelope only. Params and results stay opaque `Value`s -
//! interpreting them is the business of the layers above.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CDPError;

/// Request ID - monotonically increasing, starts at 1
pub type RequestId = u64;

/// Target ID from Chrome
pub type TargetId = String;

/// Session ID for attached targets (flat session mode)
pub type SessionId = String;

/// CDP command sent to the browser
#[derive(Debug, Clone, Serialize)]
pub struct CDPRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// CDP command response
#[derive(Debug, Clone, Deserialize)]
pub struct CDPResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorObject>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

impl CDPResponse {
    /// Split into the caller-visible outcome. A response carrying neither
    /// `result` nor `error` resolves to `Value::Null`.
    pub fn into_result(self) -> Result<Value, CDPError> {
        match self.error {
            Some(error) => Err(CDPError::Remote {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Error object of a failed command
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// CDP event from the browser (no request ID)
#[derive(Debug, Clone, Deserialize)]
pub struct CDPEvent {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Unified inbound message. Anything with an `id` is a response;
/// otherwise it must carry a `method` to be an event.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CDPMessage {
    Response(CDPResponse),
    Event(CDPEvent),
}

/// Decode one inbound frame.
pub fn decode(text: &str) -> Result<CDPMessage, CDPError> {
    serde_json::from_str(text).map_err(|e| CDPError::Protocol(e.to_string()))
}

/// Best-effort recovery of the command ID from a frame that failed to decode,
/// so the waiting caller learns about the bad reply instead of hanging.
pub fn salvage_id(text: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("id")?.as_u64()
}

/// Result of Target.attachToTarget
#[derive(Debug, Clone, Deserialize)]
pub struct AttachToTargetResult {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}
