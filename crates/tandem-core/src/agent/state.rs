//! Agent run state machine

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Streaming,
    ToolPending,
    Approving,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal step
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;

        if self == next {
            return true;
        }
        match (self, next) {
            // Any live state can be torn down
            (s, Cancelled | Failed) if !s.is_terminal() => true,
            (Idle, Streaming) => true,
            (Streaming, ToolPending | Completed) => true,
            // Unsupported or malformed calls go straight back to the model
            (ToolPending, Approving | Executing | Streaming) => true,
            (Approving, Executing | Streaming) => true,
            (Executing, Streaming | Completed) => true,
            // A finished session can start over or be cleared
            (Completed | Cancelled | Failed, Streaming | Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::ToolPending => "tool_pending",
            Self::Approving => "approving",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
