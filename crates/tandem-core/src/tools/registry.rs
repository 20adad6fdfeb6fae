//! Tool registry and the approval gate in front of it

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ToolName, ToolParams};
use crate::agent::{AgentState, Completion};
use crate::config::{PermissionMode, RunConfig};
use crate::context::ContextProvider;
use crate::paths;
use crate::rpc::HostApi;
use crate::session::Session;

/// Tool output is cut at this many chars before it reaches the model
pub const MAX_OUTPUT_CHARS: usize = 30_000;

/// Where a tool does its work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    /// Filesystem or process work inside the orchestrator
    Local,
    /// Needs a round trip into the host
    Host,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSpec {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: true,
            description,
        }
    }

    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: false,
            description,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    Success,
    Error,
    Denied,
}

/// Tool execution result
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: String,
    pub outcome: ToolOutcome,
    /// Set by `attempt_completion`; ends the run
    pub completion: Option<Completion>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            outcome: ToolOutcome::Success,
            completion: None,
        }
    }

    pub fn error(msg: impl std::fmt::Display) -> Self {
        Self {
            output: msg.to_string(),
            outcome: ToolOutcome::Error,
            completion: None,
        }
    }

    pub fn denied() -> Self {
        Self {
            output: String::new(),
            outcome: ToolOutcome::Denied,
            completion: None,
        }
    }

    pub fn completed(completion: Completion) -> Self {
        Self {
            output: String::new(),
            outcome: ToolOutcome::Success,
            completion: Some(completion),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome == ToolOutcome::Error
    }

    /// The text fed back to the model as the tool turn
    pub fn to_model_text(&self) -> String {
        match self.outcome {
            ToolOutcome::Success if self.output.is_empty() => {
                "Tool executed successfully.".to_string()
            }
            ToolOutcome::Success => format!(
                "Tool executed successfully.\nTool output:\n{}",
                truncate(&self.output, MAX_OUTPUT_CHARS)
            ),
            ToolOutcome::Error => {
                format!("[Tool Error] {}", truncate(&self.output, MAX_OUTPUT_CHARS))
            }
            ToolOutcome::Denied => "The user denied this operation.".to_string(),
        }
    }
}

/// Cut `text` to `max` chars on a char boundary, noting what was dropped
pub fn truncate(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .nth(max)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    format!(
        "{}\n[Output truncated: showed {} of {} chars]",
        &text[..cut],
        max,
        total
    )
}

/// Context for tool execution
pub struct ToolContext {
    pub session: Arc<Session>,
    pub host: Arc<dyn HostApi>,
    pub config: RunConfig,
    pub context: Arc<dyn ContextProvider>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn root(&self) -> &Path {
        self.session.root()
    }

    /// Resolve a model-supplied path, refusing anything outside the session
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        paths::resolve_within(self.root(), Path::new(path))
            .ok_or_else(|| format!("Access denied: path '{}' is outside the session root", path))
    }

    pub fn display_path(&self, path: &Path) -> String {
        paths::relative_to(self.root(), path).display().to_string()
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> ToolName;

    /// Tool description for the model
    fn description(&self) -> &str;

    fn params(&self) -> &'static [ParamSpec];

    /// Sensitive tools mutate state or run commands and need approval
    fn sensitive(&self) -> bool {
        false
    }

    fn locality(&self, _config: &RunConfig) -> Locality {
        Locality::Local
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> ToolResult;
}

/// Registry for the tools of one orchestrator
pub struct ToolRegistry {
    tools: HashMap<ToolName, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry with every built-in tool
    pub fn with_defaults() -> Self {
        use super::{command, files, interaction, search};

        let mut registry = Self::new();
        registry.register(Arc::new(files::ReadFileTool));
        registry.register(Arc::new(files::WriteToFileTool));
        registry.register(Arc::new(files::ReplaceInFileTool));
        registry.register(Arc::new(command::ExecuteCommandTool));
        registry.register(Arc::new(search::ListFilesTool));
        registry.register(Arc::new(search::SearchFilesTool));
        registry.register(Arc::new(interaction::ListRepomapTool));
        registry.register(Arc::new(interaction::AskFollowupQuestionTool));
        registry.register(Arc::new(interaction::AttemptCompletionTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: ToolName) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name).cloned()
    }

    /// Registered tools in declaration order
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        ToolName::ALL
            .into_iter()
            .filter_map(|name| self.get(name))
            .collect()
    }

    /// Run one tool call end to end: lookup, validation, approval, execution
    ///
    /// Never fails: every problem becomes a result the model can read.
    pub async fn invoke(&self, name: &str, params: ToolParams, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = ToolName::parse(name).and_then(|n| self.get(n)) else {
            warn!(tool = name, "Unsupported tool requested");
            return ToolResult::error(format!("Unsupported tool: {}", name));
        };

        for spec in tool.params().iter().filter(|p| p.required) {
            if params.get(spec.name).map_or(true, |v| v.trim().is_empty()) {
                return ToolResult::error(format!(
                    "Missing value for required parameter '{}'. Please retry with complete input.",
                    spec.name
                ));
            }
        }

        if tool.sensitive() && ctx.config.permission_mode == PermissionMode::Supervised {
            ctx.session.set_state(AgentState::Approving);
            match ctx
                .host
                .request_tool_approval(ctx.root(), name, &params)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    info!(tool = name, "Tool denied by user");
                    return ToolResult::denied();
                }
                Err(e) => {
                    warn!(tool = name, "Approval request failed: {}", e);
                    return ToolResult::error(format!("Approval request failed: {}", e));
                }
            }
        }

        ctx.session.set_state(AgentState::Executing);
        info!(tool = name, locality = ?tool.locality(&ctx.config), "Executing tool");
        tool.execute(&params, ctx).await
    }
}
