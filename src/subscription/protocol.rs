//! Control/data frames exchanged over the streaming socket.
//!
//! Frames are JSON text messages tagged by `type`:
//!
//! ```text
//! client → server: connection_init, start, stop, ping
//! server → client: connection_ack, data, error, connection_error, complete, ka, pong
//! ```
//!
//! `start`/`data`/`error`/`complete`/`stop` carry the subscription `id` they
//! correlate to. Credentials never travel in a frame body; they are encoded in
//! the connection target (see `target.rs`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resilience::classify::{ErrorKind, Fault};

/// WebSocket sub-protocol requested on connect.
pub const SUB_PROTOCOL: &str = "graphql-ws";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "connection_init")]
    Init {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    #[serde(rename = "connection_ack")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    #[serde(rename = "start")]
    Subscribe { id: String, payload: Value },

    #[serde(rename = "stop")]
    Stop { id: String },

    #[serde(rename = "data")]
    Data { id: String, payload: Value },

    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        payload: Value,
    },

    #[serde(rename = "connection_error")]
    ConnectionError {
        #[serde(default)]
        payload: Value,
    },

    #[serde(rename = "complete")]
    Complete { id: String },

    #[serde(rename = "ka")]
    KeepAlive,

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

impl Frame {
    pub fn init() -> Self {
        Frame::Init { payload: None }
    }

    pub fn subscribe(id: impl Into<String>, payload: Value) -> Self {
        Frame::Subscribe {
            id: id.into(),
            payload,
        }
    }

    pub fn stop(id: impl Into<String>) -> Self {
        Frame::Stop { id: id.into() }
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Frame type name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Init { .. } => "connection_init",
            Frame::Ack { .. } => "connection_ack",
            Frame::Subscribe { .. } => "start",
            Frame::Stop { .. } => "stop",
            Frame::Data { .. } => "data",
            Frame::Error { .. } => "error",
            Frame::ConnectionError { .. } => "connection_error",
            Frame::Complete { .. } => "complete",
            Frame::KeepAlive => "ka",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
        }
    }

    /// Classify an `error`/`connection_error` frame. `None` for other frames.
    pub fn fault(&self) -> Option<Fault> {
        match self {
            Frame::Error { payload, .. } | Frame::ConnectionError { payload } => {
                Some(fault_from_payload(payload))
            }
            _ => None,
        }
    }
}

/// Error payloads come as `{"errors":[{"errorType": .., "message": ..}]}`,
/// `{"errorType": .., "message": ..}`, or a bare string.
fn fault_from_payload(payload: &Value) -> Fault {
    let first = payload
        .get("errors")
        .and_then(|errors| errors.as_array())
        .and_then(|errors| errors.first())
        .unwrap_or(payload);

    if let Some(text) = first.as_str() {
        return Fault::classify("", text);
    }

    let name = first
        .get("errorType")
        .or_else(|| first.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = first
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if name.is_empty() && message.is_empty() {
        Fault::new(ErrorKind::Unknown, payload.to_string())
    } else {
        Fault::classify(name, message)
    }
}
