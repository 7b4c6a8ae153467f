//! JSON-RPC 2.0 message model and wire codec.
//!
//! Inbound payloads are classified by which members are present:
//!
//! | `method` | `id` | Classified as                  |
//! |----------|------|--------------------------------|
//! | yes      | yes  | [`Message::Request`]           |
//! | yes      | no   | [`Message::Notification`]      |
//! | no       | yes  | [`Message::Response`]          |
//! | no       | no   | rejected with `AppError::Parse`|
//!
//! The codec is stateless; every function here is pure.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{AppError, Result};

/// Protocol version string carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric identifier; the client allocates these.
    Number(u64),
    /// String identifier, accepted from peers.
    String(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

/// JSON-RPC error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Error code.
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for AppError {
    fn from(err: RpcErrorObject) -> Self {
        AppError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Outcome of a response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Successful result value (may be `null`).
    Result(Value),
    /// Error object.
    Error(RpcErrorObject),
}

impl ResponsePayload {
    /// Convert into the caller-facing result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` when the payload is an error object.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error(err) => Err(err.into()),
        }
    }
}

/// A JSON-RPC protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call expecting a response.
    Request {
        /// Correlation identifier.
        id: RequestId,
        /// Method name.
        method: String,
        /// Parameters; omitted on the wire when `None`.
        params: Option<Value>,
    },
    /// The answer to an earlier request.
    Response {
        /// Identifier of the request being answered.
        id: RequestId,
        /// Result or error.
        payload: ResponsePayload,
    },
    /// A one-way message with no identifier.
    Notification {
        /// Method name.
        method: String,
        /// Parameters; omitted on the wire when `None`.
        params: Option<Value>,
    },
}

impl Message {
    /// Build a request.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Build a notification.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build a successful response.
    #[must_use]
    pub fn result(id: impl Into<RequestId>, result: Value) -> Self {
        Self::Response {
            id: id.into(),
            payload: ResponsePayload::Result(result),
        }
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    /// Identifier for requests and responses.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::Notification { .. } => None,
        }
    }
}

/// Serialize a message into its compact JSON wire form.
///
/// # Errors
///
/// Returns `AppError::Parse` if serialization fails (only possible for
/// non-string map keys inside user-supplied params).
pub fn encode(message: &Message) -> Result<String> {
    let value = match message {
        Message::Request { id, method, params } => {
            let mut obj = envelope();
            obj.insert("id".into(), serde_json::to_value(id)?);
            obj.insert("method".into(), Value::String(method.clone()));
            if let Some(params) = params {
                obj.insert("params".into(), params.clone());
            }
            Value::Object(obj)
        }
        Message::Response { id, payload } => {
            let mut obj = envelope();
            obj.insert("id".into(), serde_json::to_value(id)?);
            match payload {
                ResponsePayload::Result(result) => {
                    obj.insert("result".into(), result.clone());
                }
                ResponsePayload::Error(err) => {
                    obj.insert("error".into(), serde_json::to_value(err)?);
                }
            }
            Value::Object(obj)
        }
        Message::Notification { method, params } => {
            let mut obj = envelope();
            obj.insert("method".into(), Value::String(method.clone()));
            if let Some(params) = params {
                obj.insert("params".into(), params.clone());
            }
            Value::Object(obj)
        }
    };

    Ok(serde_json::to_string(&value)?)
}

/// Parse one JSON-RPC payload.
///
/// A missing `jsonrpc` member is tolerated; a present one must equal `"2.0"`.
///
/// # Errors
///
/// Returns `AppError::Parse` if the payload is not a JSON object, carries a
/// wrong protocol version, has malformed members, or cannot be classified.
pub fn decode(payload: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(payload)?;
    let Value::Object(mut obj) = value else {
        return Err(AppError::Parse("json-rpc payload is not an object".into()));
    };

    if let Some(version) = obj.get("jsonrpc") {
        if *version != JSONRPC_VERSION {
            return Err(AppError::Parse(format!(
                "unsupported json-rpc version: {version}"
            )));
        }
    }

    let id = take_non_null(&mut obj, "id")
        .map(serde_json::from_value::<RequestId>)
        .transpose()
        .map_err(|e| AppError::Parse(format!("invalid id: {e}")))?;

    let method = match take_non_null(&mut obj, "method") {
        Some(Value::String(method)) => Some(method),
        Some(other) => {
            return Err(AppError::Parse(format!("method must be a string, got {other}")));
        }
        None => None,
    };

    let params = take_non_null(&mut obj, "params");

    match (method, id) {
        (Some(method), Some(id)) => Ok(Message::Request { id, method, params }),
        (Some(method), None) => Ok(Message::Notification { method, params }),
        (None, Some(id)) => {
            if let Some(error) = take_non_null(&mut obj, "error") {
                let error: RpcErrorObject = serde_json::from_value(error)
                    .map_err(|e| AppError::Parse(format!("invalid error object: {e}")))?;
                return Ok(Message::Response {
                    id,
                    payload: ResponsePayload::Error(error),
                });
            }
            // `"result": null` is a legitimate successful response.
            match obj.remove("result") {
                Some(result) => Ok(Message::Response {
                    id,
                    payload: ResponsePayload::Result(result),
                }),
                None => Err(AppError::Parse(format!(
                    "response {id} has neither result nor error"
                ))),
            }
        }
        (None, None) => Err(AppError::Parse(
            "payload has neither method nor id".into(),
        )),
    }
}

fn envelope() -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
    obj
}

fn take_non_null(obj: &mut Map<String, Value>, key: &str) -> Option<Value> {
    obj.remove(key).filter(|v| !v.is_null())
}
