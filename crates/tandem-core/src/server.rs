//! Host-facing JSON-RPC server
//!
//! Every host method is accepted both as a request and as a notification.
//! Requests get the result or a typed error back; a failed notification is
//! reported to the host as an error chunk for the session it named.
//! Notifications for one session run in order on that session's lane, so one
//! that waits on the host stalls neither the link nor other sessions.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::config::{OrchestratorConfig, RunConfig, WorkerMode};
use crate::provider::OpenAiFactory;
use crate::rpc::methods::{self, *};
use crate::rpc::{parse_params, HostApi, RpcError, RpcHandler, RpcHost, RpcPeer};
use crate::session::{InProcessLauncher, ProcessLauncher, SessionManager, WorkerLauncher};

pub struct OrchestratorServer {
    manager: Arc<SessionManager>,
    host: Arc<dyn HostApi>,
}

fn reply<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Malformed(e.to_string()))
}

impl OrchestratorServer {
    pub fn new(manager: Arc<SessionManager>, host: Arc<dyn HostApi>) -> Self {
        Self { manager, host }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let m = &self.manager;
        match method {
            methods::SEND => {
                let p: SendParams = parse_params(params)?;
                m.send(&p.session_path, &p.prompt)?;
                Ok(Value::Null)
            }
            methods::SEND_REVISED_HISTORY => {
                let p: SendRevisedHistoryParams = parse_params(params)?;
                m.send_revised_history(&p.session_path, p.history)?;
                Ok(Value::Null)
            }
            methods::CANCEL => {
                let p: SessionParams = parse_params(params)?;
                reply(m.cancel(&p.session_path)?)
            }
            methods::CLEAR_HISTORY => {
                let p: SessionParams = parse_params(params)?;
                m.clear_history(&p.session_path).await?;
                reply(true)
            }
            methods::GET_HISTORY => {
                let p: SessionParams = parse_params(params)?;
                reply(m.get_history(&p.session_path)?)
            }
            methods::GET_CHAT_FILES => {
                let p: SessionParams = parse_params(params)?;
                reply(m.get_chat_files(&p.session_path)?)
            }
            methods::ADD_FILE_TO_CONTEXT => {
                let p: ContextFileParams = parse_params(params)?;
                reply(m.add_file_to_context(&p.session_path, &p.file)?)
            }
            methods::REMOVE_FILE_FROM_CONTEXT => {
                let p: ContextFileParams = parse_params(params)?;
                reply(m.remove_file_from_context(&p.session_path, &p.file)?)
            }
            methods::GET_SESSION_STATE => {
                let p: SessionParams = parse_params(params)?;
                reply(m.state(&p.session_path).await?)
            }
            methods::CONFIGURE => {
                let p: ConfigureParams = parse_params(params)?;
                m.configure(&p.session_path, p.config)?;
                Ok(Value::Null)
            }
            methods::LIST_PATCHES => {
                let p: ListPatchesParams = parse_params(params)?;
                reply(m.list_patches(&p.session_path, p.file.as_deref()).await?)
            }
            methods::APPLY_HUNK => {
                let p: HunkParams = parse_params(params)?;
                reply(m.apply_hunk(&p.session_path, &p.file, p.hunk_id).await?)
            }
            methods::CANCEL_HUNK => {
                let p: HunkParams = parse_params(params)?;
                reply(m.cancel_hunk(&p.session_path, &p.file, p.hunk_id).await?)
            }
            methods::APPLY_FILE => {
                let p: FileParams = parse_params(params)?;
                reply(m.apply_file(&p.session_path, &p.file).await?)
            }
            methods::CANCEL_FILE => {
                let p: FileParams = parse_params(params)?;
                reply(m.cancel_file(&p.session_path, &p.file).await?)
            }
            methods::APPLY_ALL => {
                let p: SessionParams = parse_params(params)?;
                reply(m.apply_all(&p.session_path).await?)
            }
            methods::CANCEL_ALL => {
                let p: SessionParams = parse_params(params)?;
                reply(m.cancel_all(&p.session_path).await?)
            }
            methods::CLEANUP => {
                m.cleanup().await;
                Ok(Value::Null)
            }
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }
}

#[async_trait]
impl RpcHandler for OrchestratorServer {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.dispatch(method, params).await
    }

    fn notification_lane(&self, _method: &str, params: &Value) -> Option<String> {
        let session = params.get("session_path").and_then(Value::as_str);
        Some(session.unwrap_or_default().to_string())
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        let session = params
            .get("session_path")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        if let Err(e) = self.dispatch(method, params).await {
            warn!("Notification {} failed: {}", method, e);
            if let Some(session) = session {
                let message = match e {
                    RpcError::Remote { message, .. } => message,
                    other => other.to_string(),
                };
                self.host
                    .flush_output(&session, OutputChunk::new(StreamRole::Error, message));
            }
        }
    }
}

/// Serve the host on `reader`/`writer` until it hangs up or `shutdown` fires
pub async fn serve<R, W, F>(
    reader: R,
    writer: W,
    defaults: RunConfig,
    launcher: Arc<dyn WorkerLauncher>,
    shutdown: F,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let peer = RpcPeer::connect("host", writer);
    let host: Arc<dyn HostApi> = Arc::new(RpcHost::new(Arc::clone(&peer)));
    let manager = Arc::new(SessionManager::new(Arc::clone(&host), defaults, launcher));
    let server = Arc::new(OrchestratorServer::new(Arc::clone(&manager), host));
    let reading = peer.serve(reader, server);
    info!("Orchestrator ready");

    tokio::select! {
        result = reading => {
            result.context("host reader failed")?;
            info!("Host closed the connection");
        }
        _ = shutdown => info!("Shutdown requested"),
    }
    manager.cleanup().await;
    peer.shutdown();
    Ok(())
}

/// Entry point for `tandem serve`: the host is on stdin/stdout
pub async fn serve_stdio(config: OrchestratorConfig) -> anyhow::Result<()> {
    let launcher: Arc<dyn WorkerLauncher> = match config.worker {
        WorkerMode::Process => Arc::new(ProcessLauncher::current_exe()?),
        WorkerMode::InProcess => Arc::new(InProcessLauncher::new(Arc::new(OpenAiFactory::default()))),
    };
    info!(worker = ?config.worker, model = %config.run.model, "Starting orchestrator on stdio");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.run,
        launcher,
        shutdown,
    )
    .await
}
