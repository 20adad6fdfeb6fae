//! Tools that talk to the user or end the run

use async_trait::async_trait;

use super::registry::{Locality, ParamSpec, Tool, ToolContext, ToolResult};
use super::{ToolName, ToolParams};
use crate::agent::Completion;
use crate::config::{RepomapSource, RunConfig};

pub struct ListRepomapTool;

#[async_trait]
impl Tool for ListRepomapTool {
    fn name(&self) -> ToolName {
        ToolName::ListRepomap
    }

    fn description(&self) -> &str {
        "Show an overview of the repository structure."
    }

    fn params(&self) -> &'static [ParamSpec] {
        &[]
    }

    fn locality(&self, config: &RunConfig) -> Locality {
        match config.repomap {
            RepomapSource::Local => Locality::Local,
            RepomapSource::Host => Locality::Host,
        }
    }

    async fn execute(&self, _params: &ToolParams, ctx: &ToolContext) -> ToolResult {
        match ctx.context.overview(ctx.root()).await {
            Ok(map) => {
                ctx.session.set_last_overview(map.clone());
                ToolResult::success(map)
            }
            Err(e) => ToolResult::error(format!("Repository overview unavailable: {:#}", e)),
        }
    }
}

pub struct AskFollowupQuestionTool;

#[async_trait]
impl Tool for AskFollowupQuestionTool {
    fn name(&self) -> ToolName {
        ToolName::AskFollowupQuestion
    }

    fn description(&self) -> &str {
        "Ask the user a question when you need information to continue. Use sparingly."
    }

    fn params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::required("question", "The question to ask"),
            ParamSpec::optional("options", "JSON array of suggested answers, e.g. [\"yes\", \"no\"]"),
        ];
        PARAMS
    }

    fn locality(&self, _config: &RunConfig) -> Locality {
        Locality::Host
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> ToolResult {
        let question = params.get("question").map(String::as_str).unwrap_or_default();
        let options = match params.get("options").map(|v| v.trim()) {
            None | Some("") => Vec::new(),
            Some(raw) => match serde_json::from_str::<Vec<String>>(raw) {
                Ok(opts) => opts,
                Err(e) => {
                    return ToolResult::error(format!(
                        "options must be a JSON array of strings: {}",
                        e
                    ))
                }
            },
        };

        match ctx.host.ask_user(ctx.root(), question, &options).await {
            Ok(Some(answer)) if !answer.trim().is_empty() => {
                ToolResult::success(format!("<answer>\n{}\n</answer>", answer))
            }
            Ok(_) => ToolResult::success("The user did not provide an answer."),
            Err(e) => ToolResult::error(format!("Failed to ask the user: {}", e)),
        }
    }
}

pub struct AttemptCompletionTool;

#[async_trait]
impl Tool for AttemptCompletionTool {
    fn name(&self) -> ToolName {
        ToolName::AttemptCompletion
    }

    fn description(&self) -> &str {
        "Present the final result once the task is done. Optionally give a command that demonstrates the result. This ends the run."
    }

    fn params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::required("result", "Summary of what was done"),
            ParamSpec::optional("command", "A command that demonstrates the result"),
        ];
        PARAMS
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> ToolResult {
        let result = params.get("result").cloned().unwrap_or_default();
        let command = params
            .get("command")
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        ctx.host
            .signal_completion(ctx.root(), &result, command.as_deref());
        ToolResult::completed(Completion { result, command })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::host::testing::{HostEvent, RecordingHost};
    use crate::tools::registry::testing::{params, Fixture};

    #[tokio::test]
    async fn test_answer_is_wrapped() {
        let host = RecordingHost::default();
        host.answers.lock().push_back(Some("use postgres".into()));
        let fx = Fixture::with_host(host);

        let result = AskFollowupQuestionTool
            .execute(
                &params(&[("question", "Which db?"), ("options", "[\"postgres\", \"sqlite\"]")]),
                &fx.ctx,
            )
            .await;
        assert_eq!(result.output, "<answer>\nuse postgres\n</answer>");
        assert_eq!(fx.host.events(), vec![HostEvent::Ask("Which db?".into())]);
    }

    #[tokio::test]
    async fn test_no_answer() {
        let host = RecordingHost::default();
        host.answers.lock().push_back(Some("   ".into()));
        let fx = Fixture::with_host(host);
        for _ in 0..2 {
            let result = AskFollowupQuestionTool
                .execute(&params(&[("question", "Which db?")]), &fx.ctx)
                .await;
            assert_eq!(result.output, "The user did not provide an answer.");
        }
    }

    #[tokio::test]
    async fn test_bad_options() {
        let fx = Fixture::new();
        let result = AskFollowupQuestionTool
            .execute(&params(&[("question", "Q?"), ("options", "yes, no")]), &fx.ctx)
            .await;
        assert!(result.is_error());
        assert!(fx.host.events().is_empty());
    }

    #[tokio::test]
    async fn test_completion_signals_host() {
        let fx = Fixture::new();
        let result = AttemptCompletionTool
            .execute(
                &params(&[("result", "Renamed foo"), ("command", "python a.py")]),
                &fx.ctx,
            )
            .await;
        let completion = result.completion.unwrap();
        assert_eq!(completion.result, "Renamed foo");
        assert_eq!(completion.command.as_deref(), Some("python a.py"));
        assert_eq!(
            fx.host.events(),
            vec![HostEvent::Completion("Renamed foo".into(), Some("python a.py".into()))]
        );
    }

    #[tokio::test]
    async fn test_repomap_uses_provider() {
        let fx = Fixture::new();
        fx.write("lib/mod.rs", "");
        let result = ListRepomapTool.execute(&ToolParams::new(), &fx.ctx).await;
        assert!(result.output.contains("lib/\n  mod.rs"));
        let remembered = fx.ctx.session.last_overview().unwrap();
        assert!(remembered.contains("lib/\n  mod.rs"));
    }
}
