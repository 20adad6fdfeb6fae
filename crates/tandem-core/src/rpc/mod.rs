//! RPC bridge
//!
//! The same line-delimited JSON-RPC peer connects the host editor to the
//! orchestrator and the orchestrator to each run worker. Either side may
//! issue blocking requests or fire-and-forget notifications.

pub mod host;
pub mod methods;
pub mod peer;
pub mod protocol;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub use host::{HostApi, HostWriter, RpcHost};
pub use peer::{RpcHandler, RpcPeer};
pub use protocol::{ErrorObject, RpcMessage};

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The other end went away; in-flight calls fail with this
    #[error("bridge disconnected")]
    Disconnected,

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl RpcError {
    pub fn to_object(&self) -> ErrorObject {
        let code = match self {
            RpcError::Disconnected => protocol::DISCONNECTED,
            RpcError::Remote { code, .. } => *code,
            RpcError::MethodNotFound(_) => protocol::METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => protocol::INVALID_PARAMS,
            RpcError::Malformed(_) => protocol::PARSE_ERROR,
        };
        let message = match self {
            RpcError::Remote { message, .. } => message.clone(),
            RpcError::MethodNotFound(m) | RpcError::InvalidParams(m) | RpcError::Malformed(m) => {
                m.clone()
            }
            other => other.to_string(),
        };
        ErrorObject { code, message }
    }

    pub fn from_object(obj: ErrorObject) -> Self {
        match obj.code {
            protocol::METHOD_NOT_FOUND => RpcError::MethodNotFound(obj.message),
            protocol::INVALID_PARAMS => RpcError::InvalidParams(obj.message),
            protocol::PARSE_ERROR => RpcError::Malformed(obj.message),
            protocol::DISCONNECTED => RpcError::Disconnected,
            code => RpcError::Remote {
                code,
                message: obj.message,
            },
        }
    }
}

/// Deserialize request params, mapping failures to `InvalidParams`
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}
