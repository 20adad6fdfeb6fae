//! execute_command: shell commands rooted at the session directory

use async_trait::async_trait;
use tracing::info;

use super::registry::{ParamSpec, Tool, ToolContext, ToolResult};
use super::{ToolName, ToolParams};
use crate::process::{self, CommandError};

pub struct ExecuteCommandTool;

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> ToolName {
        ToolName::ExecuteCommand
    }

    fn description(&self) -> &str {
        "Run a shell command in the project root and return its combined stdout and stderr. Commands that exit non-zero are reported as errors along with their output."
    }

    fn params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::required(
            "command",
            "The shell command to run",
        )];
        PARAMS
    }

    fn sensitive(&self) -> bool {
        true
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> ToolResult {
        let command = params.get("command").map(String::as_str).unwrap_or_default();
        info!(command, cwd = %ctx.root().display(), "Running command");

        match process::run_shell(command, ctx.root(), ctx.config.command_timeout(), &ctx.cancel)
            .await
        {
            Ok(out) if out.success() => ToolResult::success(out.output),
            Ok(out) => ToolResult::error(format!(
                "Command exited with code {}\nOutput:\n{}",
                out.exit_code, out.output
            )),
            Err(CommandError::TimedOut { after, output }) => ToolResult::error(format!(
                "Command timed out after {}s\nOutput:\n{}",
                after.as_secs(),
                output
            )),
            Err(CommandError::Cancelled { output }) => {
                ToolResult::error(format!("Command cancelled\nOutput:\n{}", output))
            }
            Err(e) => ToolResult::error(e),
        }
    }
}
