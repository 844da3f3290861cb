//! # TLC-FI Wire Protocol
//!
//! JSON-RPC 2.0 envelopes and the TLC-FI 1.1 payloads carried in them.
//!
//! ## Message Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      TLC-FI over JSON-RPC                               │
//! │                                                                         │
//! │  SESSION SETUP (client → facility)                                     │
//! │  ─────────────────────────────────                                     │
//! │  Register   { username, password, type, version, uri }                 │
//! │         ◄── { sessionid, facilities, version }                         │
//! │  ReadMeta   { type, ids }  ◄── { objects, meta[], ticks }              │
//! │  Subscribe  { type, ids }  ◄── { objects, data[], ticks }              │
//! │                                                                         │
//! │  RUNNING (both directions)                                             │
//! │  ─────────────────────────                                             │
//! │  UpdateState { update: [{ objects, states[] }], ticks }                │
//! │  Alive       { ticks, time }  ◄── echo                                 │
//! │  NotifyEvent { objects, events[], ticks }                              │
//! │                                                                         │
//! │  TEARDOWN                                                              │
//! │  ────────                                                              │
//! │  Deregister  {}                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Enumerations travel as integers. Object states stay as raw JSON values
//! here; `tlcfi_core::TlcObject::copy_state` decodes them per object kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tlcfi_core::{ApplicationType, ObjectReference, ProtocolErrorCode, PROTOCOL_VERSION};

use crate::error::{ClientError, ClientResult};

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Method names, identical in both directions.
pub mod methods {
    pub const REGISTER: &str = "Register";
    pub const DEREGISTER: &str = "Deregister";
    pub const READ_META: &str = "ReadMeta";
    pub const SUBSCRIBE: &str = "Subscribe";
    pub const UPDATE_STATE: &str = "UpdateState";
    pub const NOTIFY_EVENT: &str = "NotifyEvent";
    pub const ALIVE: &str = "Alive";
}

// =============================================================================
// JSON-RPC Envelopes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn call(id: u64, method: &str, params: Value) -> Self {
        RpcRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: ProtocolErrorCode, message: impl Into<String>) -> Self {
        RpcErrorObject {
            code: code.as_i64(),
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        RpcErrorObject {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }
}

impl From<RpcErrorObject> for ClientError {
    fn from(err: RpcErrorObject) -> Self {
        ClientError::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    #[serde(default)]
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        RpcResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcErrorObject) -> Self {
        RpcResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Numeric request id, when the response carries one.
    pub fn request_id(&self) -> Option<u64> {
        self.id.as_u64()
    }

    pub fn into_result(self) -> ClientResult<Value> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(RpcRequest),
    Response(RpcResponse),
}

/// Decodes a frame; anything carrying a `"method"` member is a request.
pub fn decode_frame(text: &str) -> ClientResult<Incoming> {
    let value: Value = serde_json::from_str(text)?;
    let is_request = value
        .as_object()
        .map(|o| o.contains_key("method"))
        .ok_or_else(|| ClientError::InvalidMessage("frame is not a JSON object".into()))?;

    if is_request {
        Ok(Incoming::Request(serde_json::from_value(value)?))
    } else {
        Ok(Incoming::Response(serde_json::from_value(value)?))
    }
}

// =============================================================================
// TLC-FI Payloads
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl ProtocolVersion {
    pub fn current() -> Self {
        let (major, minor, revision) = PROTOCOL_VERSION;
        ProtocolVersion {
            major,
            minor,
            revision,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub username: String,
    pub password: String,
    #[serde(rename = "type")]
    pub application_type: ApplicationType,
    pub version: ProtocolVersion,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationReply {
    pub sessionid: String,
    pub facilities: ObjectReference,
    pub version: ProtocolVersion,
}

/// Serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeregistrationRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub objects: ObjectReference,
    #[serde(default)]
    pub meta: Vec<Value>,
    #[serde(default)]
    pub ticks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectData {
    pub objects: ObjectReference,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub ticks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStateUpdate {
    pub objects: ObjectReference,
    #[serde(default)]
    pub states: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStateUpdateGroup {
    pub update: Vec<ObjectStateUpdate>,
    pub ticks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliveObject {
    pub ticks: u32,
    /// Wall clock, milliseconds since the Unix epoch.
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEvent {
    pub objects: ObjectReference,
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub ticks: u32,
}

/// Wall clock milliseconds for [`AliveObject::time`].
pub fn current_time_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
