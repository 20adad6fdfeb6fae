//! Method names and payloads for both links

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::agent::AgentState;
use crate::config::RunConfig;
use crate::patch::Region;
use crate::session::{Role, Turn};
use crate::tools::ToolParams;

// Host -> orchestrator
pub const SEND: &str = "send";
pub const SEND_REVISED_HISTORY: &str = "send_revised_history";
pub const CANCEL: &str = "cancel";
pub const CLEAR_HISTORY: &str = "clear_history";
pub const GET_HISTORY: &str = "get_history";
pub const GET_CHAT_FILES: &str = "get_chat_files";
pub const ADD_FILE_TO_CONTEXT: &str = "add_file_to_context";
pub const REMOVE_FILE_FROM_CONTEXT: &str = "remove_file_from_context";
pub const GET_SESSION_STATE: &str = "get_session_state";
pub const CONFIGURE: &str = "configure";
pub const LIST_PATCHES: &str = "list_patches";
pub const APPLY_HUNK: &str = "apply_hunk";
pub const CANCEL_HUNK: &str = "cancel_hunk";
pub const APPLY_FILE: &str = "apply_file";
pub const CANCEL_FILE: &str = "cancel_file";
pub const APPLY_ALL: &str = "apply_all";
pub const CANCEL_ALL: &str = "cancel_all";
pub const CLEANUP: &str = "cleanup";

// Orchestrator -> host
pub const FLUSH_OUTPUT: &str = "flush_output";
pub const REQUEST_TOOL_APPROVAL: &str = "request_tool_approval";
pub const ASK_USER: &str = "ask_user";
pub const EXECUTE_IN_HOST: &str = "execute_in_host";
pub const REPLACE_REGIONS: &str = "replace_regions";
pub const LIST_FILES: &str = "list_files";
pub const SEARCH_FILES: &str = "search_files";
pub const SIGNAL_COMPLETION: &str = "signal_completion";
pub const AGENT_FINISHED: &str = "agent_finished";
pub const FILE_WRITTEN_EXTERNALLY: &str = "file_written_externally";

// Orchestrator <-> worker
pub const RUN_START: &str = "run/start";
pub const RUN_STREAM: &str = "run/stream";
pub const RUN_TURN: &str = "run/turn";
pub const RUN_STATE: &str = "run/state";
pub const TOOL_INVOKE: &str = "tool/invoke";
pub const CONTEXT_ENVIRONMENT: &str = "context/environment";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub session_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendParams {
    pub session_path: PathBuf,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisedTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRevisedHistoryParams {
    pub session_path: PathBuf,
    pub history: Vec<RevisedTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureParams {
    pub session_path: PathBuf,
    pub config: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextFileParams {
    pub session_path: PathBuf,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPatchesParams {
    pub session_path: PathBuf,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HunkParams {
    pub session_path: PathBuf,
    pub file: PathBuf,
    pub hunk_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileParams {
    pub session_path: PathBuf,
    pub file: PathBuf,
}

/// Role of a streamed chunk as shown by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    User,
    Llm,
    ToolJson,
    ToolJsonArgs,
    ToolJsonEnd,
    Tool,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub content: String,
    pub role: StreamRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl OutputChunk {
    pub fn new(role: StreamRole, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role,
            tool_id: None,
            tool_name: None,
        }
    }

    pub fn with_tool(mut self, id: impl Into<String>, name: Option<&str>) -> Self {
        self.tool_id = Some(id.into());
        self.tool_name = name.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushOutputParams {
    pub session_path: PathBuf,
    #[serde(flatten)]
    pub chunk: OutputChunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolApprovalParams {
    pub session_path: PathBuf,
    pub tool_name: String,
    pub params: BTreeMap<String, String>,
    /// Pretty-printed params for display
    pub display: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskUserParams {
    pub session_path: PathBuf,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteInHostParams {
    pub session_path: PathBuf,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceRegionsParams {
    pub file_path: PathBuf,
    /// Highest start line first
    pub regions: Vec<Region>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesParams {
    pub dir: PathBuf,
    pub recursive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchFilesParams {
    pub dir: PathBuf,
    pub pattern: String,
    pub case_sensitive: bool,
    pub max_matches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCompletionParams {
    pub session_path: PathBuf,
    pub result_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demo_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWrittenParams {
    pub path: PathBuf,
}

/// Everything a worker needs to run one agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartParams {
    pub session_path: PathBuf,
    pub config: RunConfig,
    pub system_prompt: String,
    pub history: Vec<Turn>,
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnParams {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateParams {
    pub state: AgentState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvokeParams {
    pub tool_id: String,
    pub name: String,
    pub params: ToolParams,
}
