//! JSON control messages carried inside envelopes.
//!
//! Messages are plain JSON objects with no type tag. The shape decides the
//! kind, checked in this order:
//!
//! 1. `hello_world` present: handshake
//! 2. `req_id` present: request
//! 3. `res_id` present: response
//!
//! Anything else is [`Message::Unknown`] and gets dropped by the receiver.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ProtocolError, Result};

/// Request identifier, scoped to one machine instance.
pub type RequestId = u64;

/// Handshake message. Sent once per side per channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Session ticket folded into the post-handshake key schedule
    pub hello_world: u32,
    /// Sender's node id
    #[serde(default)]
    pub id: String,
    /// Address the sender can be reached at for reconnection
    #[serde(default)]
    pub remote_address: String,
}

/// RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed as `res_id`
    pub req_id: RequestId,
    /// Method name interpreted by the receiving application machine
    pub method: String,
    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// RPC response. Exactly one of `data` / `error` is meaningful; `error` wins
/// when both are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered
    pub res_id: RequestId,
    /// Result value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Successful response.
    pub fn ok(res_id: RequestId, data: Value) -> Self {
        Self { res_id, data: Some(data), error: None }
    }

    /// Failed response.
    pub fn err(res_id: RequestId, error: impl Into<String>) -> Self {
        Self { res_id, data: None, error: Some(error.into()) }
    }

    /// Collapse into a result.
    pub fn into_result(self) -> std::result::Result<Option<Value>, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake ticket exchange
    Hello(Hello),
    /// RPC request
    Request(Request),
    /// RPC response
    Response(Response),
    /// Object of no known shape
    Unknown(Map<String, Value>),
}

impl Message {
    /// Classify a JSON value by key presence.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if map.contains_key("hello_world") {
            Ok(Self::Hello(serde_json::from_value(Value::Object(map))?))
        } else if map.contains_key("req_id") {
            Ok(Self::Request(serde_json::from_value(Value::Object(map))?))
        } else if map.contains_key("res_id") {
            Ok(Self::Response(serde_json::from_value(Value::Object(map))?))
        } else {
            Ok(Self::Unknown(map))
        }
    }

    /// Parse plaintext bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Serialize to plaintext bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::Hello(hello) => serde_json::to_vec(hello)?,
            Self::Request(request) => serde_json::to_vec(request)?,
            Self::Response(response) => serde_json::to_vec(response)?,
            Self::Unknown(map) => serde_json::to_vec(map)?,
        };
        Ok(bytes)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Unknown(_) => "unknown",
        }
    }
}
