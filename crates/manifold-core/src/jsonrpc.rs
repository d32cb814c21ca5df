//! JSON-RPC 2.0 envelope types
//!
//! One JSON object per line on the backend transport, UTF-8. Payloads are
//! kept as raw `serde_json::Value` so descriptors pass through the bridge
//! verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::codes;

/// Protocol version string carried on every envelope
pub const VERSION: &str = "2.0";

/// Request id, number or string per JSON-RPC 2.0
///
/// The bridge only allocates numeric ids for backend traffic, but clients
/// may use either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// A call expecting a response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A one-way message with no response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Result or error for a previously issued request
///
/// `id` is `None` only for responses to unparseable requests, which
/// JSON-RPC requires to carry `"id": null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Response for an envelope that could not be parsed at all
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::error(None, ErrorObject::new(codes::PARSE_ERROR, detail))
    }
}

/// JSON-RPC error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// An inbound envelope classified by shape
///
/// A `method` with a non-null `id` is a request; a `method` without one is
/// a notification; anything else must be a response.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());
        match (has_method, has_id) {
            (true, true) => serde_json::from_value(value).map(Self::Request),
            (true, false) => serde_json::from_value(value).map(Self::Notification),
            (false, _) => serde_json::from_value(value).map(Self::Response),
        }
    }
}
