//! One agent run: stream, parse, call a tool, repeat

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::history;
use super::parser::{ParseEvent, ToolCallParser};
use super::{AgentState, RunOutcome, ToolReply};
use crate::config::RunConfig;
use crate::provider::{
    with_retry, ChatMessage, ChatRequest, ChatRole, LlmProvider, RetryConfig, TextStream,
};
use crate::rpc::methods::{OutputChunk, StreamRole};
use crate::rpc::RpcError;
use crate::session::{Role, Turn};
use crate::tools::{ToolCall, ToolName};

/// Give up on a stream that goes quiet for this long
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Where a run sends its output and its tool calls
///
/// In a worker this forwards over the link to the parent; the parent owns
/// sessions, tools and the host.
#[async_trait]
pub trait RunSink: Send + Sync {
    fn emit(&self, chunk: OutputChunk);

    fn record(&self, role: Role, content: &str);

    fn state(&self, state: AgentState);

    async fn invoke_tool(&self, tool_id: &str, call: &ToolCall) -> Result<ToolReply, RpcError>;

    /// Fresh `<environment_details>` for the next turn
    async fn environment(&self) -> Result<String, RpcError>;
}

#[derive(Debug, Clone)]
pub struct RunInput {
    pub config: RunConfig,
    pub system_prompt: String,
    pub history: Vec<Turn>,
    pub environment: String,
}

enum TurnEnd {
    Text,
    Call { tool_id: String, call: ToolCall },
    Cancelled,
    Failed(String),
}

pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    sink: Arc<dyn RunSink>,
    cancel: CancellationToken,
    retry: RetryConfig,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        sink: Arc<dyn RunSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            sink,
            cancel,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(&self, input: RunInput) -> RunOutcome {
        let outcome = self.drive(input).await;
        info!(status = ?outcome.status, "Run finished: {}", outcome.message);
        outcome
    }

    async fn drive(&self, input: RunInput) -> RunOutcome {
        let RunInput {
            config,
            system_prompt,
            history,
            mut environment,
        } = input;
        let retry = self.retry.clone().with_max_attempts(config.max_retries);
        let mut messages: Vec<ChatMessage> = history.iter().map(history::to_chat).collect();
        let mut tool_calls = 0usize;
        let mut turn = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return RunOutcome::cancelled();
            }
            if turn > 0 {
                match self.sink.environment().await {
                    Ok(env) => environment = env,
                    Err(e) => warn!("Environment refresh failed, reusing the last one: {}", e),
                }
            }
            turn += 1;

            let mut request_messages = vec![ChatMessage::new(ChatRole::System, system_prompt.clone())];
            request_messages.extend(history::with_environment(
                history::truncate(&messages, config.history_token_budget),
                &environment,
            ));
            let request = ChatRequest {
                model: config.model.clone(),
                messages: request_messages,
                temperature: config.temperature,
            };

            self.sink.state(AgentState::Streaming);
            debug!(turn, model = %config.model, "Requesting completion");
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return RunOutcome::cancelled(),
                opened = with_retry(&retry, || self.provider.stream(request.clone())) => opened,
            };
            let stream = match opened {
                Ok(stream) => stream,
                Err(e) => return RunOutcome::failed(format!("Provider error: {}", e)),
            };

            let mut parser = ToolCallParser::new();
            let end = self.consume(stream, &mut parser).await;
            let text = parser.consumed().to_string();
            if !text.is_empty() {
                self.sink.record(Role::Assistant, &text);
                messages.push(ChatMessage::new(ChatRole::Assistant, text));
            }

            let (tool_id, call) = match end {
                TurnEnd::Cancelled => return RunOutcome::cancelled(),
                TurnEnd::Failed(message) => return RunOutcome::failed(message),
                TurnEnd::Text => return RunOutcome::completed("no further tool use", None),
                TurnEnd::Call { tool_id, call } => (tool_id, call),
            };

            tool_calls += 1;
            if tool_calls > config.max_tool_calls {
                return RunOutcome::failed(format!(
                    "exceeded {} tool calls without completion",
                    config.max_tool_calls
                ));
            }
            if self.cancel.is_cancelled() {
                return RunOutcome::cancelled();
            }

            self.sink.state(AgentState::ToolPending);
            info!(tool = %call.name, tool_id = %tool_id, "Tool call");
            let reply = tokio::select! {
                _ = self.cancel.cancelled() => return RunOutcome::cancelled(),
                reply = self.sink.invoke_tool(&tool_id, &call) => reply,
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(_) if self.cancel.is_cancelled() => return RunOutcome::cancelled(),
                Err(e) => return RunOutcome::failed(format!("Tool call {} failed: {}", call.name, e)),
            };

            self.sink.record(Role::Tool, &reply.content);
            messages.push(ChatMessage::new(ChatRole::User, reply.content));
            if let Some(completion) = reply.completion {
                return RunOutcome::completed(completion.result.clone(), Some(completion));
            }
        }
    }

    async fn consume(&self, mut stream: TextStream, parser: &mut ToolCallParser) -> TurnEnd {
        let mut open: Option<(String, ToolName)> = None;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return TurnEnd::Cancelled,
                next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()) => next,
            };
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return TurnEnd::Failed(format!("Provider stream failed: {}", e)),
                Ok(None) => break,
                Err(_) => {
                    return TurnEnd::Failed(format!(
                        "AI stream timeout: no data received for {} seconds",
                        STREAM_IDLE_TIMEOUT.as_secs()
                    ))
                }
            };
            for event in parser.feed(&chunk) {
                if let Some(end) = self.forward(event, &mut open) {
                    return end;
                }
            }
        }
        for event in parser.finish() {
            if let Some(end) = self.forward(event, &mut open) {
                return end;
            }
        }
        TurnEnd::Text
    }

    /// Send one parse event to the sink; a finished call ends the turn
    fn forward(&self, event: ParseEvent, open: &mut Option<(String, ToolName)>) -> Option<TurnEnd> {
        match event {
            ParseEvent::Text(text) => {
                self.sink.emit(OutputChunk::new(StreamRole::Llm, text));
                None
            }
            ParseEvent::ToolStart(name) => {
                let id = Uuid::new_v4().to_string();
                self.sink.emit(
                    OutputChunk::new(StreamRole::ToolJson, "").with_tool(id.as_str(), Some(name.as_str())),
                );
                *open = Some((id, name));
                None
            }
            ParseEvent::ToolArgs(args) => {
                if let Some((id, name)) = open.as_ref() {
                    self.sink.emit(
                        OutputChunk::new(StreamRole::ToolJsonArgs, args)
                            .with_tool(id.as_str(), Some(name.as_str())),
                    );
                }
                None
            }
            ParseEvent::ToolEnd(call) => {
                let (id, _) = open.take()?;
                self.sink.emit(
                    OutputChunk::new(StreamRole::ToolJsonEnd, "").with_tool(id.as_str(), Some(call.name.as_str())),
                );
                Some(TurnEnd::Call { tool_id: id, call })
            }
            ParseEvent::ToolAbandoned(raw) => {
                debug!("Unterminated tool block treated as text ({} chars)", raw.len());
                if let Some((id, name)) = open.take() {
                    self.sink.emit(
                        OutputChunk::new(StreamRole::ToolJsonEnd, "").with_tool(id, Some(name.as_str())),
                    );
                }
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::agent::RunStatus;
    use crate::provider::scripted::{ScriptedProvider, Step};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            ..RetryConfig::default()
        }
    }

    fn input(config: RunConfig) -> RunInput {
        RunInput {
            config,
            system_prompt: "SYSTEM".into(),
            history: vec![Turn::new(Role::User, "rename foo to bar in a.py")],
            environment: "<environment_details>first</environment_details>".into(),
        }
    }

    async fn run_with(
        provider: Arc<ScriptedProvider>,
        sink: Arc<RecordingSink>,
        config: RunConfig,
    ) -> RunOutcome {
        AgentLoop::new(provider, sink, CancellationToken::new())
            .with_retry(fast_retry())
            .run(input(config))
            .await
    }

    #[tokio::test]
    async fn test_text_only_turn_completes() {
        let provider = ScriptedProvider::replies(&["Nothing to do here."]);
        let sink = Arc::new(RecordingSink::default());
        let outcome = run_with(provider.clone(), sink.clone(), RunConfig::default()).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.message, "no further tool use");
        assert_eq!(sink.text(StreamRole::Llm), "Nothing to do here.");
        assert!(sink
            .events()
            .contains(&SinkEvent::Turn(Role::Assistant, "Nothing to do here.".into())));

        let request = &provider.requests()[0];
        assert_eq!(request.messages[0].role, ChatRole::System);
        assert_eq!(
            request.messages[1].content,
            "rename foo to bar in a.py\n\n<environment_details>first</environment_details>"
        );
    }

    #[tokio::test]
    async fn test_tool_then_completion() {
        let provider = ScriptedProvider::replies(&[
            "Reading.\n<read_file>\n<path>a.py</path>\n</read_file>",
            "<attempt_completion><result>Renamed</result><command>python a.py</command></attempt_completion>",
        ]);
        let sink = Arc::new(RecordingSink::default());
        let outcome = run_with(provider.clone(), sink.clone(), RunConfig::default()).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        let completion = outcome.completion.unwrap();
        assert_eq!(completion.result, "Renamed");
        assert_eq!(completion.command.as_deref(), Some("python a.py"));

        let tools = sink.tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].params.get("path").unwrap(), "a.py");

        let events = sink.events();
        assert_eq!(events.iter().filter(|e| **e == SinkEvent::Environment).count(), 1);
        assert!(events.contains(&SinkEvent::State(AgentState::ToolPending)));

        // Tool framing shares one id
        let framed: Vec<&OutputChunk> = events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Chunk(c) if c.tool_id.is_some() => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(framed.first().unwrap().role, StreamRole::ToolJson);
        assert_eq!(framed.first().unwrap().tool_id, framed[1].tool_id);

        // Second request sees the tool result with fresh environment attached
        let second = &provider.requests()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, ChatRole::User);
        assert!(last.content.starts_with("[read_file] Result:"));
        assert!(last.content.ends_with("<environment_details>fresh</environment_details>"));
        assert!(!second.messages[1].content.contains("first"));
    }

    #[tokio::test]
    async fn test_tool_call_limit() {
        let call = "<list_files><path>.</path></list_files>";
        let provider = ScriptedProvider::replies(&[call, call, call]);
        let sink = Arc::new(RecordingSink::default());
        let config = RunConfig {
            max_tool_calls: 2,
            ..RunConfig::default()
        };
        let outcome = run_with(provider, sink.clone(), config).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.message, "exceeded 2 tool calls without completion");
        assert_eq!(sink.tools().len(), 2);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let provider = ScriptedProvider::new(vec![
            Step::Status(503),
            Step::Status(429),
            Step::Reply("done".into()),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let outcome = run_with(provider.clone(), sink, RunConfig::default()).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_run() {
        let provider = ScriptedProvider::new(vec![Step::Status(401), Step::Reply("never".into())]);
        let sink = Arc::new(RecordingSink::default());
        let outcome = run_with(provider.clone(), sink, RunConfig::default()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.message.contains("401"));
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let provider = ScriptedProvider::new(vec![Step::Status(500), Step::Status(500)]);
        let sink = Arc::new(RecordingSink::default());
        let config = RunConfig {
            max_retries: 2,
            ..RunConfig::default()
        };
        let outcome = run_with(provider.clone(), sink, config).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_broken_stream_keeps_partial_text() {
        let provider = ScriptedProvider::new(vec![Step::Broken("Working on it".into())]);
        let sink = Arc::new(RecordingSink::default());
        let outcome = run_with(provider, sink.clone(), RunConfig::default()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.message.contains("connection reset"));
        assert!(sink
            .events()
            .contains(&SinkEvent::Turn(Role::Assistant, "Working on it".into())));
    }

    #[tokio::test]
    async fn test_unterminated_block_is_plain_content() {
        let provider = ScriptedProvider::replies(&["<read_file><path>a.py</path>"]);
        let sink = Arc::new(RecordingSink::default());
        let outcome = run_with(provider, sink.clone(), RunConfig::default()).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(sink.tools().is_empty());
        assert!(sink.text(StreamRole::ToolJsonArgs).contains("a.py"));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let provider = ScriptedProvider::new(vec![Step::Hang("partial ".into())]);
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let agent = AgentLoop::new(provider, sink.clone(), cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(5), agent.run(input(RunConfig::default())))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(sink.text(StreamRole::Llm), "partial ");
    }

    #[tokio::test]
    async fn test_cancel_while_tool_runs() {
        let provider = ScriptedProvider::replies(&["<execute_command><command>sleep 60</command></execute_command>"]);
        let sink = Arc::new(RecordingSink {
            hang_tools: true,
            ..RecordingSink::default()
        });
        let cancel = CancellationToken::new();
        let agent = AgentLoop::new(provider, sink.clone(), cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(5), agent.run(input(RunConfig::default())))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(sink.tools().len(), 1);
    }
}
