//! JSON-RPC 2.0 message model.
//!
//! Every line exchanged with the agent is one [`JsonRpcMessage`]. Inbound
//! lines are classified structurally:
//!
//! | Shape                                  | Variant                            |
//! |----------------------------------------|------------------------------------|
//! | `method` + non-null `id`               | [`JsonRpcMessage::Request`]        |
//! | `method`, no `id` (or `id: null`)      | [`JsonRpcMessage::Notification`]   |
//! | `id` + exactly one of `result`/`error` | [`JsonRpcMessage::Response`]       |
//! | anything else that is valid JSON       | [`JsonRpcMessage::Unclassified`]   |
//!
//! Only text that is not JSON at all is an error; odd-but-valid JSON is kept
//! so it can be shown in the run report.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Protocol version string carried in every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Request identifier. Numeric and string ids never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id (the harness always allocates these).
    Number(i64),
    /// String id.
    String(String),
}

impl RequestId {
    fn from_json(raw: &Value) -> Option<Self> {
        match raw {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Read an `error` member, keeping whatever a non-conforming agent sent.
    ///
    /// A member without an integer `code` or a string `message` still
    /// becomes an error: the missing parts are filled in and the raw value
    /// is kept in `data`.
    #[must_use]
    pub fn from_member(raw: &Value) -> Self {
        if let Ok(err) = serde_json::from_value::<Self>(raw.clone()) {
            return err;
        }
        Self {
            code: raw.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: raw
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("malformed error member")
                .to_owned(),
            data: Some(raw.clone()),
        }
    }
}

/// A call that expects a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    /// Correlation id.
    pub id: RequestId,
    /// Method name, e.g. `session/prompt`.
    pub method: String,
    /// Method parameters.
    pub params: Option<Value>,
}

/// A one-way message; never answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Method name, e.g. `session/update`.
    pub method: String,
    /// Method parameters.
    pub params: Option<Value>,
}

/// Body of a response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// Successful `result` member.
    Result(Value),
    /// `error` member.
    Error(RpcError),
}

/// Reply to a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    /// Id of the request being answered; `None` when the peer sent `null`.
    pub id: Option<RequestId>,
    /// Result or error.
    pub outcome: ResponseOutcome,
}

impl Response {
    /// Whether this response answers the request with `id`.
    #[must_use]
    pub fn answers(&self, id: &RequestId) -> bool {
        self.id.as_ref() == Some(id)
    }

    /// The `result` member, if the call succeeded.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            ResponseOutcome::Result(value) => Some(value),
            ResponseOutcome::Error(_) => None,
        }
    }

    /// The `error` member, if the call failed.
    #[must_use]
    pub fn error(&self) -> Option<&RpcError> {
        match &self.outcome {
            ResponseOutcome::Error(err) => Some(err),
            ResponseOutcome::Result(_) => None,
        }
    }
}

/// Any single line of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JsonRpcMessage {
    /// Peer-initiated call with an id.
    Request(Request),
    /// Peer-initiated one-way message.
    Notification(Notification),
    /// Answer to a request.
    Response(Response),
    /// Valid JSON that is none of the above.
    Unclassified {
        /// The raw value as received.
        value: Value,
    },
}

impl JsonRpcMessage {
    /// Build an outbound request.
    #[must_use]
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self::Request(Request {
            id,
            method: method.into(),
            params: Some(params),
        })
    }

    /// Build an error response, used to refuse agent-initiated requests.
    #[must_use]
    pub fn error_response(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self::Response(Response {
            id: Some(id),
            outcome: ResponseOutcome::Error(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        })
    }

    /// Classify an already-decoded JSON value.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value.as_object().and_then(classify) {
            Some(message) => message,
            None => Self::Unclassified { value },
        }
    }

    /// Parse one line of agent output.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if `line` is not valid JSON.
    pub fn parse_line(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())?;
        Ok(Self::from_value(value))
    }

    /// Wire representation, including `"jsonrpc": "2.0"`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request(req) => {
                obj.insert("id".into(), id_value(Some(&req.id)));
                obj.insert("method".into(), Value::from(req.method.as_str()));
                if let Some(params) = &req.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification(note) => {
                obj.insert("method".into(), Value::from(note.method.as_str()));
                if let Some(params) = &note.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response(resp) => {
                obj.insert("id".into(), id_value(resp.id.as_ref()));
                match &resp.outcome {
                    ResponseOutcome::Result(value) => {
                        obj.insert("result".into(), value.clone());
                    }
                    ResponseOutcome::Error(err) => {
                        let err = serde_json::to_value(err).unwrap_or(Value::Null);
                        obj.insert("error".into(), err);
                    }
                }
            }
            Self::Unclassified { value } => return value.clone(),
        }
        Value::Object(obj)
    }

    /// Serialise to a single line without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if serialisation fails.
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(&self.to_value())
            .map_err(|e| AppError::Transport(format!("failed to serialise message: {e}")))
    }

    /// Correlation id, if the message has one.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => resp.id.as_ref(),
            Self::Notification(_) | Self::Unclassified { .. } => None,
        }
    }

    /// Method name, if the message has one.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(note) => Some(&note.method),
            Self::Response(_) | Self::Unclassified { .. } => None,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Response(_) => "response",
            Self::Unclassified { .. } => "unclassified",
        }
    }
}

fn id_value(id: Option<&RequestId>) -> Value {
    match id {
        Some(RequestId::Number(n)) => Value::from(*n),
        Some(RequestId::String(s)) => Value::from(s.as_str()),
        None => Value::Null,
    }
}

fn classify(obj: &Map<String, Value>) -> Option<JsonRpcMessage> {
    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(RequestId::from_json(raw)?),
    };

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        let method = method.to_owned();
        let params = obj.get("params").cloned();
        return Some(match id {
            Some(id) => JsonRpcMessage::Request(Request { id, method, params }),
            None => JsonRpcMessage::Notification(Notification { method, params }),
        });
    }

    // A response must carry the `id` member, even if it is null.
    if !obj.contains_key("id") {
        return None;
    }

    let outcome = match (obj.get("result"), obj.get("error")) {
        (Some(result), None) => ResponseOutcome::Result(result.clone()),
        (None, Some(error)) => ResponseOutcome::Error(RpcError::from_member(error)),
        _ => return None,
    };

    Some(JsonRpcMessage::Response(Response { id, outcome }))
}
