//! JSON-RPC 2.0 message model and codec.
//!
//! [`decode`] classifies a frame body by which envelope fields are present,
//! the same way for every peer: `method` + `id` is a request, `method` alone
//! a notification, `id` with `result`/`error` a response.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

const JSONRPC_VERSION: &str = "2.0";

/// Request identifier. The client always allocates numbers; workers may use
/// strings for their own requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const UNKNOWN_ERROR_CODE: i64 = -32001;
    pub const REQUEST_FAILED: i64 = -32803;
    pub const SERVER_CANCELLED: i64 = -32802;
    pub const CONTENT_MODIFIED: i64 = -32801;
    pub const REQUEST_CANCELLED: i64 = -32800;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// A reply. `id` is `None` only when the peer could not read the request id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub outcome: Result<Value, ResponseError>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    pub fn err(id: RequestId, error: ResponseError) -> Self {
        Self {
            id: Some(id),
            outcome: Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params: Some(params),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Debug, thiserror::Error)]
pub enum MalformedMessage {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("invalid `{field}` field")]
    InvalidField { field: &'static str },
    #[error("message is neither a request, a response nor a notification")]
    MissingKind,
}

/// Serialize a message into a frame body.
pub fn encode(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let envelope = match message {
        Message::Request(req) => {
            let mut obj = json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": req.id,
                "method": req.method,
            });
            if let Some(params) = &req.params {
                obj["params"] = params.clone();
            }
            obj
        }
        Message::Response(resp) => {
            let mut obj = json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": resp.id,
            });
            match &resp.outcome {
                Ok(result) => obj["result"] = result.clone(),
                Err(error) => obj["error"] = serde_json::to_value(error)?,
            }
            obj
        }
        Message::Notification(note) => {
            let mut obj = json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": note.method,
            });
            if let Some(params) = &note.params {
                obj["params"] = params.clone();
            }
            obj
        }
    };
    serde_json::to_vec(&envelope)
}

/// Parse a frame body into a message.
pub fn decode(body: &[u8]) -> Result<Message, MalformedMessage> {
    let value: Value = serde_json::from_slice(body)?;
    let Value::Object(mut obj) = value else {
        return Err(MalformedMessage::NotAnObject);
    };

    let id = take_id(&mut obj)?;
    let method = match obj.remove("method") {
        None => None,
        Some(Value::String(m)) => Some(m),
        Some(_) => return Err(MalformedMessage::InvalidField { field: "method" }),
    };
    let params = obj.remove("params");

    match (method, id) {
        (Some(method), Some(Some(id))) => Ok(Message::Request(Request { id, method, params })),
        (Some(_), Some(None)) => Err(MalformedMessage::InvalidField { field: "id" }),
        (Some(method), None) => Ok(Message::Notification(Notification { method, params })),
        (None, Some(id)) => {
            let outcome = if let Some(error) = obj.remove("error") {
                Err(serde_json::from_value::<ResponseError>(error)
                    .map_err(|_| MalformedMessage::InvalidField { field: "error" })?)
            } else if let Some(result) = obj.remove("result") {
                Ok(result)
            } else {
                return Err(MalformedMessage::MissingKind);
            };
            Ok(Message::Response(Response { id, outcome }))
        }
        (None, None) => Err(MalformedMessage::MissingKind),
    }
}

/// `None` when absent, `Some(None)` for an explicit `null`.
fn take_id(obj: &mut Map<String, Value>) -> Result<Option<Option<RequestId>>, MalformedMessage> {
    match obj.remove("id") {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(value) => serde_json::from_value::<RequestId>(value)
            .map(|id| Some(Some(id)))
            .map_err(|_| MalformedMessage::InvalidField { field: "id" }),
    }
}
