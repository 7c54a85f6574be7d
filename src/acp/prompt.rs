//! `session/prompt` payload shapes and the `stopReason` vocabulary.
//!
//! [`PromptShape::ContentBlocks`] is the canonical ACP encoding:
//!
//! ```json
//! { "sessionId": "…", "prompt": [{ "type": "text", "text": "…" }] }
//! ```
//!
//! The other shapes are seen in older or non-conforming agents. They are
//! only sent by the shape probe, never by a normal prompt.

use std::fmt::{Display, Formatter};

use clap::ValueEnum;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};

/// Encoding of the prompt parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum PromptShape {
    /// `prompt: [{type: "text", text}]`.
    ContentBlocks,
    /// `messages: [{role: "user", content}]`.
    Messages,
    /// `message: {role: "user", content}`.
    Message,
    /// `prompt: "<text>"`.
    Text,
}

impl PromptShape {
    /// Order in which the shape probe tries encodings.
    pub const PROBE_ORDER: [Self; 4] = [
        Self::ContentBlocks,
        Self::Messages,
        Self::Message,
        Self::Text,
    ];

    /// Build `session/prompt` params for `session_id` carrying `text`.
    #[must_use]
    pub fn params(self, session_id: &str, text: &str) -> Value {
        match self {
            Self::ContentBlocks => json!({
                "sessionId": session_id,
                "prompt": [{ "type": "text", "text": text }],
            }),
            Self::Messages => json!({
                "sessionId": session_id,
                "messages": [{ "role": "user", "content": text }],
            }),
            Self::Message => json!({
                "sessionId": session_id,
                "message": { "role": "user", "content": text },
            }),
            Self::Text => json!({
                "sessionId": session_id,
                "prompt": text,
            }),
        }
    }

    /// Wire-style name of the shape.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContentBlocks => "content_blocks",
            Self::Messages => "messages",
            Self::Message => "message",
            Self::Text => "text",
        }
    }
}

impl Display for PromptShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the agent stopped processing a prompt.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StopReason {
    /// The turn completed normally.
    EndTurn,
    /// The model hit its token limit.
    MaxTokens,
    /// The agent hit its limit of model requests in one turn.
    MaxTurnRequests,
    /// The model refused to continue.
    Refusal,
    /// The client cancelled the turn.
    Cancelled,
    /// Any value outside the known set.
    Unrecognized(String),
}

impl StopReason {
    /// Map a wire value onto the vocabulary.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => Self::EndTurn,
            "max_tokens" => Self::MaxTokens,
            "max_turn_requests" => Self::MaxTurnRequests,
            "refusal" => Self::Refusal,
            "cancelled" => Self::Cancelled,
            other => Self::Unrecognized(other.to_owned()),
        }
    }

    /// Read `stopReason` from a prompt `result`, if it is a string.
    #[must_use]
    pub fn from_result(result: &Value) -> Option<Self> {
        result
            .get("stopReason")
            .and_then(Value::as_str)
            .map(Self::parse)
    }

    /// Whether the value belongs to the known finite set.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }

    /// Wire value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::MaxTurnRequests => "max_turn_requests",
            Self::Refusal => "refusal",
            Self::Cancelled => "cancelled",
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StopReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
