//! Message envelopes carried by the codec.
//!
//! Every message is a JSON object with a `type` discriminator and a `seq`
//! number that is monotonic per sender.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One JSON object on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    /// Returns the sender's sequence number.
    pub fn seq(&self) -> i64 {
        match self {
            Message::Request(r) => r.seq,
            Message::Response(r) => r.seq,
            Message::Event(e) => e.seq,
        }
    }

    /// Returns the wire name of this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Event(_) => "event",
        }
    }
}

/// A command sent by the peer that expects a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    pub command: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

impl Request {
    pub fn new(seq: i64, command: impl Into<String>, arguments: Value) -> Self {
        Self {
            seq,
            command: command.into(),
            arguments,
        }
    }
}

/// The answer to exactly one earlier [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    /// `seq` of the request being answered
    pub request_seq: i64,
    pub command: String,
    pub success: bool,
    /// Error description; empty on success
    #[serde(default)]
    pub message: String,
    #[serde(default = "empty_object")]
    pub body: Value,
}

impl Response {
    /// Returns true if the body carries `"accepted": true`.
    pub fn accepted(&self) -> bool {
        self.body
            .get("accepted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// An unsolicited notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub event: String,
    #[serde(default = "empty_object")]
    pub body: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
