//! Session registry and the host-facing operations on it

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::supervisor::{Supervisor, WorkerLauncher};
use super::{CancelHandle, Role, Session, SessionSnapshot, Turn};
use crate::agent::RunOutcome;
use crate::config::RunConfig;
use crate::error::{OrchestratorError, Result};
use crate::patch::{DiskWriter, FilePatchView, PatchWriter};
use crate::rpc::methods::{OutputChunk, RevisedTurn, StreamRole};
use crate::rpc::{HostApi, HostWriter};
use crate::tools::ToolRegistry;

/// How long cleanup waits for cancelled runs to wind down
const CLEANUP_GRACE: Duration = Duration::from_secs(5);

static FILE_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"@(\S+)").expect("valid mention regex"));

/// Add every `@path` in `prompt` that names an existing file to the context set
fn add_mentioned_files(session: &Session, prompt: &str) {
    for cap in FILE_MENTION.captures_iter(prompt) {
        let mention = cap[1].trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if mention.is_empty() {
            continue;
        }
        match session.add_context_file(Path::new(mention)) {
            Ok(rel) => debug!(session = %session.root().display(), file = %rel.display(), "Mentioned file added"),
            Err(e) => debug!(session = %session.root().display(), "Ignoring mention @{}: {}", mention, e),
        }
    }
}

pub struct SessionManager {
    sessions: DashMap<PathBuf, Arc<Session>>,
    host: Arc<dyn HostApi>,
    defaults: RwLock<RunConfig>,
    supervisor: Arc<Supervisor>,
    runs: Mutex<HashMap<PathBuf, JoinHandle<RunOutcome>>>,
}

impl SessionManager {
    pub fn new(host: Arc<dyn HostApi>, defaults: RunConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self::with_registry(host, defaults, launcher, Arc::new(ToolRegistry::with_defaults()))
    }

    pub fn with_registry(
        host: Arc<dyn HostApi>,
        defaults: RunConfig,
        launcher: Arc<dyn WorkerLauncher>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let supervisor = Arc::new(Supervisor::new(Arc::clone(&host), registry, launcher));
        Self {
            sessions: DashMap::new(),
            host,
            defaults: RwLock::new(defaults),
            supervisor,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Canonical session key for `path`: absolute, existing directory
    fn canonical(path: &Path) -> Result<PathBuf> {
        if !path.is_absolute() {
            return Err(OrchestratorError::invalid_path(path, "session path must be absolute"));
        }
        let canonical = path
            .canonicalize()
            .map_err(|e| OrchestratorError::invalid_path(path, e.to_string()))?;
        if !canonical.is_dir() {
            return Err(OrchestratorError::invalid_path(path, "not a directory"));
        }
        Ok(canonical)
    }

    pub fn get_or_create(&self, path: &Path) -> Result<Arc<Session>> {
        let root = Self::canonical(path)?;
        let session = self
            .sessions
            .entry(root.clone())
            .or_insert_with(|| {
                info!(session = %root.display(), "Created session");
                Arc::new(Session::new(root.clone()))
            })
            .clone();
        Ok(session)
    }

    pub fn get(&self, path: &Path) -> Result<Arc<Session>> {
        let root = Self::canonical(path).map_err(|_| OrchestratorError::SessionNotFound(path.to_path_buf()))?;
        self.sessions
            .get(&root)
            .map(|s| Arc::clone(s.value()))
            .ok_or(OrchestratorError::SessionNotFound(root))
    }

    /// Append `prompt` and start a run. Busy if one is active.
    ///
    /// Files the prompt mentions as `@path` join the context set first.
    pub fn send(&self, path: &Path, prompt: &str) -> Result<()> {
        let session = self.get_or_create(path)?;
        let handle = session.begin_run()?;
        add_mentioned_files(&session, prompt);
        session.push_turn(Turn::new(Role::User, prompt));
        self.host
            .flush_output(session.root(), OutputChunk::new(StreamRole::User, prompt));
        self.start_run(session, handle);
        Ok(())
    }

    /// Replace the history with an edited one and start a run on it
    pub fn send_revised_history(&self, path: &Path, history: Vec<RevisedTurn>) -> Result<()> {
        let session = self.get_or_create(path)?;
        let handle = session.begin_run()?;
        let turns = history
            .into_iter()
            .map(|t| Turn::new(t.role, t.content))
            .collect();
        session.replace_history(turns);
        self.start_run(session, handle);
        Ok(())
    }

    fn start_run(&self, session: Arc<Session>, handle: CancelHandle) {
        let config = session.run_config(&self.defaults.read());
        let root = session.root().to_path_buf();
        debug!(session = %root.display(), run = handle.run_id(), "Starting run");

        let supervisor = Arc::clone(&self.supervisor);
        let task = tokio::spawn(async move { supervisor.run(session, handle, config).await });
        let mut runs = self.runs.lock();
        runs.retain(|_, t| !t.is_finished());
        runs.insert(root, task);
    }

    /// Signal the active run. False when idle or already cancelling.
    pub fn cancel(&self, path: &Path) -> Result<bool> {
        let session = self.get(path)?;
        let signalled = session.cancel();
        if signalled {
            info!(session = %session.root().display(), "Cancel requested");
        }
        Ok(signalled)
    }

    /// Wait for the latest run of `path` to finish
    pub async fn wait(&self, path: &Path) -> Option<RunOutcome> {
        let root = Self::canonical(path).ok()?;
        let task = self.runs.lock().remove(&root)?;
        match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(session = %root.display(), "Run task failed: {}", e);
                None
            }
        }
    }

    pub async fn clear_history(&self, path: &Path) -> Result<()> {
        let session = self.get(path)?;
        if session.is_running() {
            return Err(OrchestratorError::Busy(session.root().to_path_buf()));
        }
        session.clear().await;
        info!(session = %session.root().display(), "Cleared history");
        Ok(())
    }

    pub fn get_history(&self, path: &Path) -> Result<Vec<Turn>> {
        Ok(self.get(path)?.history())
    }

    pub fn get_chat_files(&self, path: &Path) -> Result<Vec<PathBuf>> {
        Ok(self.get(path)?.context_files())
    }

    pub fn add_file_to_context(&self, path: &Path, file: &Path) -> Result<PathBuf> {
        self.get_or_create(path)?.add_context_file(file)
    }

    pub fn remove_file_from_context(&self, path: &Path, file: &Path) -> Result<bool> {
        self.get(path)?.remove_context_file(file)
    }

    pub async fn state(&self, path: &Path) -> Result<SessionSnapshot> {
        Ok(self.get(path)?.snapshot().await)
    }

    /// Per-session run config; takes effect from the next run
    pub fn configure(&self, path: &Path, config: RunConfig) -> Result<()> {
        self.get_or_create(path)?.configure(config);
        Ok(())
    }

    pub async fn list_patches(&self, path: &Path, file: Option<&Path>) -> Result<Vec<FilePatchView>> {
        let session = self.get(path)?;
        let mut views = session.patches().list_all().await;
        if let Some(file) = file {
            let file = session.absolute_path(file)?;
            views.retain(|v| v.file == file);
        }
        views.sort_by(|a, b| a.file.cmp(&b.file));
        Ok(views)
    }

    pub async fn apply_hunk(&self, path: &Path, file: &Path, hunk_id: u64) -> Result<bool> {
        let session = self.get(path)?;
        let file = session.absolute_path(file)?;
        let writer = self.writer_for(&session);
        let applied = session
            .patches()
            .apply_hunk(&file, hunk_id, writer.as_ref())
            .await?;
        if applied {
            self.host.file_written_externally(&file);
        }
        Ok(applied)
    }

    pub async fn cancel_hunk(&self, path: &Path, file: &Path, hunk_id: u64) -> Result<bool> {
        let session = self.get(path)?;
        let file = session.absolute_path(file)?;
        Ok(session.patches().cancel_hunk(&file, hunk_id).await?)
    }

    pub async fn apply_file(&self, path: &Path, file: &Path) -> Result<usize> {
        let session = self.get(path)?;
        let file = session.absolute_path(file)?;
        self.apply_one(&session, &file).await
    }

    pub async fn cancel_file(&self, path: &Path, file: &Path) -> Result<usize> {
        let session = self.get(path)?;
        let file = session.absolute_path(file)?;
        Ok(session.patches().cancel_file(&file).await?)
    }

    /// Apply every open patch. Each file is tried; the first error wins.
    pub async fn apply_all(&self, path: &Path) -> Result<usize> {
        let session = self.get(path)?;
        let mut applied = 0;
        let mut first_err = None;
        for file in session.patches().files().await {
            match self.apply_one(&session, &file).await {
                Ok(n) => applied += n,
                Err(e) => {
                    warn!(file = %file.display(), "Apply failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    /// Cancel every open patch. Each file is tried; the first error wins.
    pub async fn cancel_all(&self, path: &Path) -> Result<usize> {
        let session = self.get(path)?;
        let mut cancelled = 0;
        let mut first_err = None;
        for file in session.patches().files().await {
            match session.patches().cancel_file(&file).await {
                Ok(n) => cancelled += n,
                Err(e) => {
                    warn!(file = %file.display(), "Cancel failed: {}", e);
                    first_err.get_or_insert(OrchestratorError::from(e));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(cancelled),
        }
    }

    async fn apply_one(&self, session: &Session, file: &Path) -> Result<usize> {
        let writer = self.writer_for(session);
        let count = session.patches().apply_file(file, writer.as_ref()).await?;
        if count > 0 {
            self.host.file_written_externally(file);
        }
        Ok(count)
    }

    fn writer_for(&self, session: &Session) -> Box<dyn PatchWriter> {
        if session.run_config(&self.defaults.read()).apply_via_host {
            Box::new(HostWriter::new(Arc::clone(&self.host)))
        } else {
            Box::new(DiskWriter)
        }
    }

    /// Cancel every run and wait for the workers to go away
    pub async fn cleanup(&self) {
        let mut cancelled = 0;
        for entry in self.sessions.iter() {
            if entry.value().cancel() {
                cancelled += 1;
            }
        }
        let tasks: Vec<_> = self.runs.lock().drain().collect();
        info!(cancelled, runs = tasks.len(), "Cleaning up sessions");
        for (root, task) in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLEANUP_GRACE, task).await.is_err() {
                warn!(session = %root.display(), "Run did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}
