//! Parent side of a worker link
//!
//! The worker streams output and history through here and calls back for
//! tools and environment details. Everything that touches the session or
//! the host happens on this side.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{CancelHandle, Session, Turn};
use crate::agent::ToolReply;
use crate::config::RunConfig;
use crate::context::{self, ContextProvider};
use crate::error::OrchestratorError;
use crate::rpc::methods::{
    self, OutputChunk, StateParams, StreamRole, ToolInvokeParams, TurnParams,
};
use crate::rpc::{parse_params, HostApi, RpcError, RpcHandler};
use crate::tools::{ToolContext, ToolRegistry};

pub(crate) struct RunLink {
    session: Arc<Session>,
    host: Arc<dyn HostApi>,
    registry: Arc<ToolRegistry>,
    config: RunConfig,
    context: Arc<dyn ContextProvider>,
    cancel: CancelHandle,
}

impl RunLink {
    pub(crate) fn new(
        session: Arc<Session>,
        host: Arc<dyn HostApi>,
        registry: Arc<ToolRegistry>,
        config: RunConfig,
        context: Arc<dyn ContextProvider>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            session,
            host,
            registry,
            config,
            context,
            cancel,
        }
    }

    async fn invoke(&self, params: ToolInvokeParams) -> Result<ToolReply, RpcError> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Tool("run cancelled".into()).into());
        }
        let ctx = ToolContext {
            session: Arc::clone(&self.session),
            host: Arc::clone(&self.host),
            config: self.config.clone(),
            context: Arc::clone(&self.context),
            cancel: self.cancel.token(),
        };

        let ToolInvokeParams {
            tool_id,
            name,
            params,
        } = params;
        let result = tokio::select! {
            result = self.registry.invoke(&name, params, &ctx) => result,
            _ = self.cancel.cancelled() => {
                debug!(tool = %name, "Tool abandoned by cancellation");
                return Err(OrchestratorError::Tool("run cancelled".into()).into());
            }
        };

        let text = result.to_model_text();
        self.host.flush_output(
            self.session.root(),
            OutputChunk::new(StreamRole::Tool, text.clone()).with_tool(tool_id, Some(name.as_str())),
        );
        Ok(ToolReply {
            content: format!("[{}] Result:\n{}", name, text),
            completion: result.completion,
        })
    }
}

#[async_trait]
impl RpcHandler for RunLink {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            methods::TOOL_INVOKE => {
                let reply = self.invoke(parse_params(params)?).await?;
                serde_json::to_value(reply).map_err(|e| RpcError::Malformed(e.to_string()))
            }
            methods::CONTEXT_ENVIRONMENT => {
                let env = context::environment_details(&self.session, self.context.as_ref()).await;
                Ok(Value::String(env))
            }
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        // Nothing from a cancelled run reaches the host or the history
        if self.cancel.is_cancelled() {
            return;
        }
        match method {
            methods::RUN_STREAM => match parse_params::<OutputChunk>(params) {
                Ok(chunk) => self.host.flush_output(self.session.root(), chunk),
                Err(e) => warn!("Bad stream chunk from worker: {}", e),
            },
            methods::RUN_TURN => match parse_params::<TurnParams>(params) {
                Ok(turn) => self.session.push_turn(Turn::new(turn.role, turn.content)),
                Err(e) => warn!("Bad turn from worker: {}", e),
            },
            methods::RUN_STATE => match parse_params::<StateParams>(params) {
                Ok(p) => {
                    self.session.set_state(p.state);
                }
                Err(e) => warn!("Bad state from worker: {}", e),
            },
            other => debug!("Ignoring worker notification {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use crate::context::FileTreeProvider;
    use crate::rpc::host::testing::{HostEvent, RecordingHost};
    use crate::session::Role;
    use serde_json::json;
    use tempfile::TempDir;

    fn link(host: Arc<RecordingHost>) -> (TempDir, RunLink) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("a.py"), "x = 1\n").unwrap();
        let link = RunLink::new(
            Arc::new(Session::new(root)),
            host,
            Arc::new(ToolRegistry::with_defaults()),
            RunConfig::default(),
            Arc::new(FileTreeProvider::default()),
            CancelHandle::new(),
        );
        (dir, link)
    }

    #[tokio::test]
    async fn test_tool_invoke_flushes_result() {
        let host = Arc::new(RecordingHost::default());
        let (_dir, link) = link(host.clone());
        let reply = link
            .handle_request(
                methods::TOOL_INVOKE,
                json!({"tool_id": "t1", "name": "read_file", "params": {"path": "a.py"}}),
            )
            .await
            .unwrap();
        let reply: ToolReply = serde_json::from_value(reply).unwrap();
        assert!(reply.content.starts_with("[read_file] Result:\nTool executed successfully."));
        assert!(reply.content.contains("x = 1"));

        match &host.events()[0] {
            HostEvent::Output(_, chunk) => {
                assert_eq!(chunk.role, StreamRole::Tool);
                assert_eq!(chunk.tool_id.as_deref(), Some("t1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_result_not_an_error() {
        let host = Arc::new(RecordingHost::default());
        let (_dir, link) = link(host);
        let reply = link
            .handle_request(
                methods::TOOL_INVOKE,
                json!({"tool_id": "t1", "name": "format_disk", "params": {}}),
            )
            .await
            .unwrap();
        assert_eq!(reply["content"], "[format_disk] Result:\n[Tool Error] Unsupported tool: format_disk");
    }

    #[tokio::test]
    async fn test_notifications_update_session_until_cancelled() {
        let host = Arc::new(RecordingHost::default());
        let (_dir, link) = link(host.clone());

        link.handle_notification(methods::RUN_STATE, json!({"state": "streaming"}))
            .await;
        link.handle_notification(methods::RUN_STREAM, json!({"content": "hi", "role": "llm"}))
            .await;
        link.handle_notification(methods::RUN_TURN, json!({"role": "assistant", "content": "hi"}))
            .await;
        assert_eq!(link.session.state(), AgentState::Streaming);
        assert_eq!(link.session.history()[0].role, Role::Assistant);
        assert_eq!(host.output_text(StreamRole::Llm), "hi");

        link.cancel.cancel();
        link.handle_notification(methods::RUN_STREAM, json!({"content": "late", "role": "llm"}))
            .await;
        link.handle_notification(methods::RUN_TURN, json!({"role": "assistant", "content": "late"}))
            .await;
        assert_eq!(host.output_text(StreamRole::Llm), "hi");
        assert_eq!(link.session.history().len(), 1);
    }

    #[tokio::test]
    async fn test_environment_request() {
        let host = Arc::new(RecordingHost::default());
        let (_dir, link) = link(host);
        let env = link
            .handle_request(methods::CONTEXT_ENVIRONMENT, Value::Null)
            .await
            .unwrap();
        assert!(env.as_str().unwrap().contains("a.py"));
    }
}
