//! Tools the model can call

pub mod command;
pub mod files;
pub mod interaction;
pub mod registry;
pub mod search;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use registry::{
    Locality, ParamSpec, Tool, ToolContext, ToolOutcome, ToolRegistry, ToolResult,
    MAX_OUTPUT_CHARS,
};

/// Parameter values as written by the model
pub type ToolParams = BTreeMap<String, String>;

/// The closed set of tool names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ReadFile,
    WriteToFile,
    ReplaceInFile,
    ExecuteCommand,
    ListFiles,
    SearchFiles,
    ListRepomap,
    AskFollowupQuestion,
    AttemptCompletion,
}

impl ToolName {
    pub const ALL: [ToolName; 9] = [
        ToolName::ReadFile,
        ToolName::WriteToFile,
        ToolName::ReplaceInFile,
        ToolName::ExecuteCommand,
        ToolName::ListFiles,
        ToolName::SearchFiles,
        ToolName::ListRepomap,
        ToolName::AskFollowupQuestion,
        ToolName::AttemptCompletion,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ReadFile => "read_file",
            ToolName::WriteToFile => "write_to_file",
            ToolName::ReplaceInFile => "replace_in_file",
            ToolName::ExecuteCommand => "execute_command",
            ToolName::ListFiles => "list_files",
            ToolName::SearchFiles => "search_files",
            ToolName::ListRepomap => "list_repomap",
            ToolName::AskFollowupQuestion => "ask_followup_question",
            ToolName::AttemptCompletion => "attempt_completion",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Unsupported tool: {}", s))
    }
}

/// A parsed, well-formed tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: ToolName,
    pub params: ToolParams,
}
