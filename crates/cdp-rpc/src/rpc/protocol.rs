//! Wire Types
//!
//! The request/response/notification shapes every frame takes.
//! Kept generic: params and results stay as `serde_json::Value` until a
//! caller asks for a concrete type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Request ID - monotonically increasing per connection
pub type RequestId = u64;

/// Target ID from the remote
pub type TargetId = String;

/// Session ID for attached targets
pub type SessionId = String;

/// Outbound call
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Reply to a call, matched by `id`
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ResponseError>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

impl Response {
    /// Split into the call outcome. A missing result is `null`.
    pub fn into_result(self) -> std::result::Result<Value, ResponseError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Error object reported by the remote for one call
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[error("rpc error: {message} (code = {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-pushed notification (no request ID)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Event {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// One decoded inbound unit
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Response(Response),
    Event(Event),
}

impl Frame {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Frame::Response(r) => r.session_id.as_deref(),
            Frame::Event(e) => e.session_id.as_deref(),
        }
    }
}

/// The Target domain contract the session multiplexer relies on.
pub mod target {
    use super::{SessionId, TargetId};
    use serde::{Deserialize, Serialize};

    pub const ATTACH_TO_TARGET: &str = "Target.attachToTarget";
    pub const DETACH_FROM_TARGET: &str = "Target.detachFromTarget";
    pub const SEND_MESSAGE_TO_TARGET: &str = "Target.sendMessageToTarget";
    pub const DETACHED_FROM_TARGET: &str = "Target.detachedFromTarget";
    pub const RECEIVED_MESSAGE_FROM_TARGET: &str = "Target.receivedMessageFromTarget";

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AttachToTargetParams {
        pub target_id: TargetId,
        pub flatten: bool,
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AttachToTargetResult {
        pub session_id: SessionId,
        /// Only some remotes echo the negotiated mode.
        #[serde(default)]
        pub flatten: Option<bool>,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DetachFromTargetParams {
        pub session_id: SessionId,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SendMessageToTargetParams {
        pub message: String,
        pub session_id: SessionId,
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DetachedFromTarget {
        pub session_id: SessionId,
        #[serde(default)]
        pub target_id: Option<TargetId>,
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ReceivedMessageFromTarget {
        pub session_id: SessionId,
        pub message: String,
        #[serde(default)]
        pub target_id: Option<TargetId>,
    }
}
