//! Worker lifecycle for session runs
//!
//! Every run gets a fresh worker. The parent keeps the session, the tools,
//! and the host link; the worker only streams. Cancelling a run kills its
//! worker, so nothing the worker was doing can outlive the cancel.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::link::RunLink;
use super::{CancelHandle, Session};
use crate::agent::{system_prompt, AgentState, RunOutcome, RunStatus};
use crate::config::RunConfig;
use crate::context;
use crate::process;
use crate::provider::{ProviderFactory, RetryConfig};
use crate::rpc::methods::{self, OutputChunk, RunStartParams, StreamRole};
use crate::rpc::{HostApi, RpcError, RpcHandler, RpcPeer};
use crate::tools::ToolRegistry;
use crate::worker;

const LAUNCH_ATTEMPTS: u32 = 3;
const LAUNCH_BACKOFF: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_secs(1);
const LINK_BUFFER: usize = 256 * 1024;

enum WorkerKind {
    Process(Child),
    InProcess(JoinHandle<anyhow::Result<()>>),
}

/// A running worker and the parent's end of its link
pub struct Worker {
    peer: Arc<RpcPeer>,
    kind: WorkerKind,
}

impl Worker {
    pub fn peer(&self) -> &Arc<RpcPeer> {
        &self.peer
    }

    /// Drop the link and make sure the worker is gone
    pub async fn kill(self) {
        self.peer.shutdown();
        match self.kind {
            WorkerKind::Process(mut child) => {
                if let Some(pid) = child.id() {
                    process::kill_group(pid);
                }
                if let Err(e) = child.start_kill() {
                    debug!("Worker already exited: {}", e);
                }
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(Ok(status)) => debug!(%status, "Worker reaped"),
                    Ok(Err(e)) => warn!("Failed to reap worker: {}", e),
                    Err(_) => warn!("Worker did not exit after kill"),
                }
            }
            WorkerKind::InProcess(task) => {
                // The worker sees EOF and aborts its own run; give it a moment
                let abort = task.abort_handle();
                if tokio::time::timeout(KILL_GRACE, task).await.is_err() {
                    abort.abort();
                }
            }
        }
    }
}

/// Starts workers and wires their link to `handler`
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, handler: Arc<dyn RpcHandler>) -> anyhow::Result<Worker>;
}

/// Runs `tandem worker` as a child process talking over stdin/stdout
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run this executable in worker mode
    pub fn current_exe() -> anyhow::Result<Self> {
        let program = std::env::current_exe().context("cannot locate own executable")?;
        Ok(Self::new(program, vec!["worker".to_string()]))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, handler: Arc<dyn RpcHandler>) -> anyhow::Result<Worker> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;
        let stdin = child.stdin.take().context("worker stdin not piped")?;
        let stdout = child.stdout.take().context("worker stdout not piped")?;

        let name = format!("worker-{}", child.id().unwrap_or_default());
        debug!("Spawned {}", name);
        let peer = RpcPeer::connect(name, stdin);
        peer.serve(stdout, handler);
        Ok(Worker {
            peer,
            kind: WorkerKind::Process(child),
        })
    }
}

/// Runs the worker as a task over an in-memory pipe
pub struct InProcessLauncher {
    factory: Arc<dyn ProviderFactory>,
    retry: RetryConfig,
}

impl InProcessLauncher {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, handler: Arc<dyn RpcHandler>) -> anyhow::Result<Worker> {
        let (parent_io, worker_io) = tokio::io::duplex(LINK_BUFFER);
        let (parent_read, parent_write) = tokio::io::split(parent_io);
        let (worker_read, worker_write) = tokio::io::split(worker_io);

        let task = tokio::spawn(worker::serve_with_retry(
            worker_read,
            worker_write,
            Arc::clone(&self.factory),
            self.retry.clone(),
        ));
        let peer = RpcPeer::connect("worker", parent_write);
        peer.serve(parent_read, handler);
        Ok(Worker {
            peer,
            kind: WorkerKind::InProcess(task),
        })
    }
}

/// Drives one run per call on a fresh worker
pub struct Supervisor {
    host: Arc<dyn HostApi>,
    registry: Arc<ToolRegistry>,
    launcher: Arc<dyn WorkerLauncher>,
}

impl Supervisor {
    pub fn new(
        host: Arc<dyn HostApi>,
        registry: Arc<ToolRegistry>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            host,
            registry,
            launcher,
        }
    }

    /// Run to a terminal state and release the session
    ///
    /// `handle` must be the one `session.begin_run()` returned.
    pub async fn run(&self, session: Arc<Session>, handle: CancelHandle, config: RunConfig) -> RunOutcome {
        let root = session.root().to_path_buf();
        session.set_state(AgentState::Streaming);

        let outcome = self.execute(&session, &handle, config).await;
        info!(session = %root.display(), status = ?outcome.status, "Run ended: {}", outcome.message);

        session.set_state(outcome.status.state());
        session.end_run(&handle);
        if outcome.status == RunStatus::Failed {
            self.host
                .flush_output(&root, OutputChunk::new(StreamRole::Error, outcome.message.clone()));
        }
        self.host.agent_finished(&root);
        outcome
    }

    async fn execute(&self, session: &Arc<Session>, handle: &CancelHandle, config: RunConfig) -> RunOutcome {
        if handle.is_cancelled() {
            return RunOutcome::cancelled();
        }

        let overview = context::provider_for(&config, Arc::clone(&self.host));
        let link = Arc::new(RunLink::new(
            Arc::clone(session),
            Arc::clone(&self.host),
            Arc::clone(&self.registry),
            config.clone(),
            Arc::clone(&overview),
            handle.clone(),
        ));
        let worker = match self.launch(link).await {
            Ok(worker) => worker,
            Err(e) => return RunOutcome::failed(format!("transport error: could not start worker: {:#}", e)),
        };

        let params = RunStartParams {
            session_path: session.root().to_path_buf(),
            system_prompt: system_prompt(&self.registry, session.root()),
            history: session.history(),
            environment: context::environment_details(session, overview.as_ref()).await,
            config,
        };
        let result = tokio::select! {
            result = worker.peer().call::<_, RunOutcome>(methods::RUN_START, params) => Some(result),
            _ = handle.cancelled() => None,
        };
        worker.kill().await;

        match result {
            None => RunOutcome::cancelled(),
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) if handle.is_cancelled() => RunOutcome::cancelled(),
            Some(Err(RpcError::Disconnected)) => {
                RunOutcome::failed("transport error: worker exited unexpectedly")
            }
            Some(Err(e)) => RunOutcome::failed(format!("transport error: {}", e)),
        }
    }

    async fn launch(&self, handler: Arc<dyn RpcHandler>) -> anyhow::Result<Worker> {
        let mut delay = LAUNCH_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.launcher.launch(Arc::clone(&handler)).await {
                Ok(worker) => return Ok(worker),
                Err(e) if attempt < LAUNCH_ATTEMPTS => {
                    warn!(attempt, "Worker launch failed, retrying in {:?}: {:#}", delay, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
