//! Worker side of a run
//!
//! A worker owns exactly one thing: the agent loop for a run the parent
//! started with `run/start`. Output, history, and state go back as
//! notifications; tool calls and environment refreshes are requests the
//! parent answers. When the link drops the run is abandoned.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentLoop, AgentState, RunInput, RunOutcome, RunSink, ToolReply};
use crate::provider::{OpenAiFactory, ProviderFactory, RetryConfig};
use crate::rpc::methods::{self, OutputChunk, RunStartParams, StateParams, ToolInvokeParams, TurnParams};
use crate::rpc::{parse_params, RpcError, RpcHandler, RpcPeer};
use crate::session::Role;
use crate::tools::ToolCall;

/// Forwards a run's side effects to the parent
struct ParentSink {
    peer: Arc<RpcPeer>,
}

impl ParentSink {
    fn send<P: serde::Serialize>(&self, method: &str, params: P) {
        if let Err(e) = self.peer.notify(method, params) {
            debug!("Dropped {} to parent: {}", method, e);
        }
    }
}

#[async_trait]
impl RunSink for ParentSink {
    fn emit(&self, chunk: OutputChunk) {
        self.send(methods::RUN_STREAM, chunk);
    }

    fn record(&self, role: Role, content: &str) {
        self.send(
            methods::RUN_TURN,
            TurnParams {
                role,
                content: content.to_string(),
            },
        );
    }

    fn state(&self, state: AgentState) {
        self.send(methods::RUN_STATE, StateParams { state });
    }

    async fn invoke_tool(&self, tool_id: &str, call: &ToolCall) -> Result<ToolReply, RpcError> {
        self.peer
            .call(
                methods::TOOL_INVOKE,
                ToolInvokeParams {
                    tool_id: tool_id.to_string(),
                    name: call.name.as_str().to_string(),
                    params: call.params.clone(),
                },
            )
            .await
    }

    async fn environment(&self) -> Result<String, RpcError> {
        self.peer.call(methods::CONTEXT_ENVIRONMENT, Value::Null).await
    }
}

pub struct WorkerHandler {
    peer: Arc<RpcPeer>,
    factory: Arc<dyn ProviderFactory>,
    retry: RetryConfig,
    runs: Mutex<Vec<AbortHandle>>,
}

impl WorkerHandler {
    pub fn new(peer: Arc<RpcPeer>, factory: Arc<dyn ProviderFactory>, retry: RetryConfig) -> Self {
        Self {
            peer,
            factory,
            retry,
            runs: Mutex::new(Vec::new()),
        }
    }

    async fn start(&self, params: RunStartParams) -> RunOutcome {
        info!(session = %params.session_path.display(), model = %params.config.model, "Starting run");
        let provider = match self.factory.create(&params.config) {
            Ok(provider) => provider,
            Err(e) => return RunOutcome::failed(format!("Provider error: {}", e)),
        };

        let sink = Arc::new(ParentSink {
            peer: Arc::clone(&self.peer),
        });
        let agent = AgentLoop::new(provider, sink, CancellationToken::new())
            .with_retry(self.retry.clone());
        let input = RunInput {
            config: params.config,
            system_prompt: params.system_prompt,
            history: params.history,
            environment: params.environment,
        };

        let peer = Arc::clone(&self.peer);
        let task = tokio::spawn(async move {
            tokio::select! {
                outcome = agent.run(input) => outcome,
                _ = peer.closed() => RunOutcome::cancelled(),
            }
        });
        {
            let mut runs = self.runs.lock();
            runs.retain(|h| !h.is_finished());
            runs.push(task.abort_handle());
        }

        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => RunOutcome::cancelled(),
            Err(e) => RunOutcome::failed(format!("run panicked: {}", e)),
        }
    }

    /// Drop every run still in flight
    pub fn abort_runs(&self) {
        for handle in self.runs.lock().drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl RpcHandler for WorkerHandler {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            methods::RUN_START => {
                let outcome = self.start(parse_params(params)?).await;
                serde_json::to_value(outcome).map_err(|e| RpcError::Malformed(e.to_string()))
            }
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }

    async fn handle_notification(&self, method: &str, _params: Value) {
        warn!("Worker ignoring notification {}", method);
    }
}

/// Serve one parent link until it closes
pub async fn serve<R, W>(reader: R, writer: W, factory: Arc<dyn ProviderFactory>) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve_with_retry(reader, writer, factory, RetryConfig::default()).await
}

pub(crate) async fn serve_with_retry<R, W>(
    reader: R,
    writer: W,
    factory: Arc<dyn ProviderFactory>,
    retry: RetryConfig,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let peer = RpcPeer::connect("worker", writer);
    let handler = Arc::new(WorkerHandler::new(Arc::clone(&peer), factory, retry));
    let reading = peer.serve(reader, handler.clone());
    reading.await.context("worker reader failed")?;
    handler.abort_runs();
    debug!("Worker link closed");
    Ok(())
}

/// Entry point for `tandem worker`: the parent is on stdin/stdout
pub async fn run_stdio() -> anyhow::Result<()> {
    serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        Arc::new(OpenAiFactory::default()),
    )
    .await
}
