//! JSON-RPC 2.0 wire format
//!
//! One JSON object per line. Requests carry an `id`, notifications don't,
//! responses carry either `result` or `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RpcError;

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const PARSE_ERROR: i64 = -32700;
pub const DISCONNECTED: i64 = -32099;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

/// Any message on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// A decoded inbound message
#[derive(Debug)]
pub enum Incoming {
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
}

impl RpcMessage {
    fn empty() -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id),
            method: Some(method.into()),
            params: Some(params),
            ..Self::empty()
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::empty()
        }
    }

    pub fn response(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    pub fn error_response(id: u64, error: &RpcError) -> Self {
        Self {
            id: Some(id),
            error: Some(error.to_object()),
            ..Self::empty()
        }
    }

    pub fn classify(self) -> Result<Incoming, RpcError> {
        match (self.id, self.method) {
            (Some(id), Some(method)) => Ok(Incoming::Request {
                id,
                method,
                params: self.params.unwrap_or(Value::Null),
            }),
            (None, Some(method)) => Ok(Incoming::Notification {
                method,
                params: self.params.unwrap_or(Value::Null),
            }),
            (Some(id), None) => {
                let result = match self.error {
                    Some(err) => Err(RpcError::from_object(err)),
                    // A null result deserializes as None
                    None => Ok(self.result.unwrap_or(Value::Null)),
                };
                Ok(Incoming::Response { id, result })
            }
            (None, None) => Err(RpcError::Malformed(
                "message has neither id nor method".to_string(),
            )),
        }
    }
}
