//! The agent loop and its data types
//!
//! A run streams model output, cuts the first tool call out of it, hands
//! the call to its [`RunSink`] and feeds the result back, until the model
//! stops calling tools, calls `attempt_completion`, or the run is cancelled.

pub mod history;
pub mod parser;
pub mod prompt;
pub mod runner;
pub mod state;

use serde::{Deserialize, Serialize};

pub use parser::{ParseEvent, ToolCallParser};
pub use prompt::system_prompt;
pub use runner::{AgentLoop, RunInput, RunSink};
pub use state::AgentState;

/// What `attempt_completion` reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// The parent's answer to a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolReply {
    /// Tool turn content as the model will see it
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn state(self) -> AgentState {
        match self {
            RunStatus::Completed => AgentState::Completed,
            RunStatus::Cancelled => AgentState::Cancelled,
            RunStatus::Failed => AgentState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,
}

impl RunOutcome {
    pub fn completed(message: impl Into<String>, completion: Option<Completion>) -> Self {
        Self {
            status: RunStatus::Completed,
            message: message.into(),
            completion,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            message: "cancelled by user".to_string(),
            completion: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            message: message.into(),
            completion: None,
        }
    }
}
