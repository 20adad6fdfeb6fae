//! Orchestrator error taxonomy
//!
//! Tool failures and approval denials never show up here: they are tool
//! results the model sees. These errors are for the host and for run
//! supervision.

use std::path::PathBuf;

use thiserror::Error;

use crate::patch::PatchError;
use crate::rpc::RpcError;

/// Errors surfaced to the host or to the run supervisor
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The bridge to the host or to a worker went away
    #[error("transport error: {0}")]
    Transport(#[from] RpcError),

    /// Handler-level failure outside of a running conversation
    #[error("tool error: {0}")]
    Tool(String),

    #[error("patch for {} is stale: file changed on disk since the hunks were proposed", .0.display())]
    StalePatch(PathBuf),

    #[error("session {} is busy: a run is already active", .0.display())]
    Busy(PathBuf),

    #[error("session not found: {}", .0.display())]
    SessionNotFound(PathBuf),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("hunk {0} not found")]
    HunkNotFound(u64),

    #[error("hunk {id} is already {status}")]
    HunkResolved { id: u64, status: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable JSON-RPC error code for this variant
    pub fn code(&self) -> i64 {
        match self {
            Self::Transport(_) => -32000,
            Self::Tool(_) => -32001,
            Self::StalePatch(_) => -32002,
            Self::Busy(_) => -32003,
            Self::SessionNotFound(_) => -32004,
            Self::Conflict(_) => -32005,
            Self::InvalidPath { .. } => -32006,
            Self::HunkNotFound(_) => -32007,
            Self::HunkResolved { .. } => -32008,
            Self::Io(_) => -32010,
            Self::Serialization(_) => -32602,
        }
    }
}

impl From<PatchError> for OrchestratorError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::Stale(path) => Self::StalePatch(path),
            PatchError::Overlap { .. } => Self::Conflict(err.to_string()),
            PatchError::InvalidHunk(msg) => Self::Conflict(msg),
            PatchError::HunkNotFound(id) => Self::HunkNotFound(id),
            PatchError::Resolved { id, status } => Self::HunkResolved {
                id,
                status: status.to_string(),
            },
            PatchError::Io(e) => Self::Io(e),
            PatchError::Host(e) => Self::Transport(e),
        }
    }
}

impl From<OrchestratorError> for RpcError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Transport(e) => e,
            other => RpcError::Remote {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
