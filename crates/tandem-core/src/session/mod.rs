//! Sessions: one conversation per project root
//!
//! A session owns its history, its context files, its pending patches and
//! the cancellation handle of the run in flight. Nothing here is shared
//! between sessions.

pub mod cancel;
mod link;
pub mod manager;
pub mod supervisor;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::AgentState;
use crate::config::RunConfig;
use crate::error::{OrchestratorError, Result};
use crate::patch::PatchEngine;
use crate::paths;

pub use cancel::{CancelHandle, CancelPhase};
pub use manager::SessionManager;
pub use supervisor::{InProcessLauncher, ProcessLauncher, Supervisor, Worker, WorkerLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One history entry; never edited once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            content: content.into(),
        }
    }
}

/// Host-visible summary of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_path: PathBuf,
    pub state: AgentState,
    pub running: bool,
    pub turns: usize,
    pub context_files: Vec<PathBuf>,
    pub pending_files: Vec<PathBuf>,
}

/// Context file content as of the given modification time and length
struct CachedFile {
    modified: SystemTime,
    len: u64,
    content: String,
}

pub struct Session {
    root: PathBuf,
    history: RwLock<Vec<Turn>>,
    /// Relative to `root`, insertion order
    context_files: RwLock<Vec<PathBuf>>,
    file_cache: Mutex<HashMap<PathBuf, CachedFile>>,
    /// Latest `list_repomap` result, shown in later environment blocks
    last_overview: RwLock<Option<String>>,
    patches: PatchEngine,
    run: Mutex<Option<CancelHandle>>,
    state: Mutex<AgentState>,
    config: RwLock<Option<RunConfig>>,
}

impl Session {
    /// `root` must already be canonical
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            history: RwLock::new(Vec::new()),
            context_files: RwLock::new(Vec::new()),
            file_cache: Mutex::new(HashMap::new()),
            last_overview: RwLock::new(None),
            patches: PatchEngine::new(),
            run: Mutex::new(None),
            state: Mutex::new(AgentState::Idle),
            config: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn patches(&self) -> &PatchEngine {
        &self.patches
    }

    pub fn history(&self) -> Vec<Turn> {
        self.history.read().clone()
    }

    pub fn push_turn(&self, turn: Turn) {
        self.history.write().push(turn);
    }

    pub fn replace_history(&self, turns: Vec<Turn>) {
        *self.history.write() = turns;
    }

    /// Drop history, pending patches and cached context; context files stay
    pub async fn clear(&self) {
        self.history.write().clear();
        self.file_cache.lock().clear();
        *self.last_overview.write() = None;
        self.patches.clear().await;
        self.set_state(AgentState::Idle);
    }

    pub fn context_files(&self) -> Vec<PathBuf> {
        self.context_files.read().clone()
    }

    /// Resolve `path` inside the session root, relative form
    pub fn relative_path(&self, path: &Path) -> Result<PathBuf> {
        let resolved = paths::resolve_within(&self.root, path).ok_or_else(|| {
            OrchestratorError::invalid_path(path, "outside the session root")
        })?;
        Ok(paths::relative_to(&self.root, &resolved))
    }

    /// Resolve `path` inside the session root, absolute form
    pub fn absolute_path(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.root.join(self.relative_path(path)?))
    }

    /// Add a file to the context set. Returns its root-relative path.
    pub fn add_context_file(&self, path: &Path) -> Result<PathBuf> {
        let relative = self.relative_path(path)?;
        if !self.root.join(&relative).is_file() {
            return Err(OrchestratorError::invalid_path(path, "no such file"));
        }
        let mut files = self.context_files.write();
        if !files.contains(&relative) {
            debug!(session = %self.root.display(), file = %relative.display(), "Added context file");
            files.push(relative.clone());
        }
        Ok(relative)
    }

    /// Returns false when the file was not in the set
    pub fn remove_context_file(&self, path: &Path) -> Result<bool> {
        let relative = self.relative_path(path)?;
        self.file_cache.lock().remove(&relative);
        let mut files = self.context_files.write();
        let before = files.len();
        files.retain(|f| f != &relative);
        Ok(files.len() != before)
    }

    /// Content of a context file, re-read only when it changed on disk
    pub async fn context_file_content(&self, relative: &Path) -> std::io::Result<String> {
        let path = self.root.join(relative);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                self.file_cache.lock().remove(relative);
                return Err(e);
            }
        };
        let modified = meta.modified()?;
        let len = meta.len();

        let cached = self
            .file_cache
            .lock()
            .get(relative)
            .filter(|c| c.modified == modified && c.len == len)
            .map(|c| c.content.clone());
        if let Some(content) = cached {
            return Ok(content);
        }

        let content = tokio::fs::read_to_string(&path).await?;
        self.file_cache.lock().insert(
            relative.to_path_buf(),
            CachedFile {
                modified,
                len,
                content: content.clone(),
            },
        );
        Ok(content)
    }

    pub fn last_overview(&self) -> Option<String> {
        self.last_overview.read().clone()
    }

    pub fn set_last_overview(&self, overview: String) {
        *self.last_overview.write() = Some(overview);
    }

    /// Claim the session for a new run
    pub fn begin_run(&self) -> Result<CancelHandle> {
        let mut run = self.run.lock();
        if run.is_some() {
            return Err(OrchestratorError::Busy(self.root.clone()));
        }
        let handle = CancelHandle::new();
        *run = Some(handle.clone());
        Ok(handle)
    }

    /// Release the session if `handle` still owns it
    pub fn end_run(&self, handle: &CancelHandle) {
        handle.finish();
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(|h| h.same_run(handle)) {
            *run = None;
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    /// Signal the active run. False when idle or already cancelling.
    pub fn cancel(&self) -> bool {
        self.run.lock().as_ref().is_some_and(CancelHandle::cancel)
    }

    pub(crate) fn active_run(&self) -> Option<CancelHandle> {
        self.run.lock().clone()
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    /// Move to `next`; illegal transitions are logged and ignored
    pub fn set_state(&self, next: AgentState) -> bool {
        let mut state = self.state.lock();
        let current = *state;
        if !current.can_transition_to(next) {
            warn!(session = %self.root.display(), from = %current, to = %next, "Ignoring invalid state transition");
            return false;
        }
        *state = next;
        true
    }

    /// Effective run config: the session override or `defaults`
    pub fn run_config(&self, defaults: &RunConfig) -> RunConfig {
        self.config.read().clone().unwrap_or_else(|| defaults.clone())
    }

    pub fn configure(&self, config: RunConfig) {
        *self.config.write() = Some(config);
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let pending_files = self.patches.files().await;
        let turns = self.history.read().len();
        SessionSnapshot {
            session_path: self.root.clone(),
            state: self.state(),
            running: self.is_running(),
            turns,
            context_files: self.context_files(),
            pending_files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session() -> (TempDir, Session) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/a.py"), "x = 1\n").unwrap();
        std::fs::write(root.join("b.py"), "y = 2\n").unwrap();
        (dir, Session::new(root))
    }

    #[test]
    fn test_context_files_keep_order_and_dedupe() {
        let (_dir, session) = session();
        session.add_context_file(Path::new("src/a.py")).unwrap();
        session.add_context_file(Path::new("b.py")).unwrap();
        let absolute = session.root().join("src/a.py");
        session.add_context_file(&absolute).unwrap();

        assert_eq!(
            session.context_files(),
            vec![PathBuf::from("src/a.py"), PathBuf::from("b.py")]
        );
        assert!(session.remove_context_file(Path::new("src/a.py")).unwrap());
        assert!(!session.remove_context_file(Path::new("src/a.py")).unwrap());
        assert_eq!(session.context_files(), vec![PathBuf::from("b.py")]);
    }

    #[test]
    fn test_context_file_outside_root_rejected() {
        let (_dir, session) = session();
        let err = session.add_context_file(Path::new("../elsewhere.py")).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidPath { .. }));
        let err = session.add_context_file(Path::new("missing.py")).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidPath { .. }));
        assert!(session.context_files().is_empty());
    }

    #[test]
    fn test_second_run_is_busy() {
        let (_dir, session) = session();
        let first = session.begin_run().unwrap();
        assert!(matches!(session.begin_run(), Err(OrchestratorError::Busy(_))));

        assert!(session.cancel());
        assert!(!session.cancel());
        session.end_run(&first);
        assert!(!session.is_running());
        assert!(session.begin_run().is_ok());
    }

    #[test]
    fn test_stale_handle_does_not_release_new_run() {
        let (_dir, session) = session();
        let first = session.begin_run().unwrap();
        session.end_run(&first);
        let second = session.begin_run().unwrap();
        session.end_run(&first);
        assert!(session.is_running());
        session.end_run(&second);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_clear_keeps_context_files() {
        let (_dir, session) = session();
        session.add_context_file(Path::new("b.py")).unwrap();
        session.push_turn(Turn::new(Role::User, "hello"));
        session
            .patches()
            .propose(
                &session.root().join("b.py"),
                Some("y = 2\n".into()),
                crate::patch::compute_hunks("y = 2\n", "y = 3\n"),
            )
            .await
            .unwrap();

        session.clear().await;
        assert!(session.history().is_empty());
        assert!(session.patches().list_all().await.is_empty());
        assert_eq!(session.context_files(), vec![PathBuf::from("b.py")]);
    }

    #[tokio::test]
    async fn test_snapshot_runs_on_another_task() {
        let (_dir, session) = session();
        let session = std::sync::Arc::new(session);
        session.push_turn(Turn::new(Role::User, "hello"));
        session
            .patches()
            .propose(
                &session.root().join("b.py"),
                Some("y = 2\n".into()),
                crate::patch::compute_hunks("y = 2\n", "y = 3\n"),
            )
            .await
            .unwrap();

        let snapshot = tokio::spawn({
            let session = session.clone();
            async move { session.snapshot().await }
        })
        .await
        .unwrap();
        assert_eq!(snapshot.turns, 1);
        assert_eq!(snapshot.pending_files, vec![session.root().join("b.py")]);

        // History stays writable while a snapshot is in flight
        session.push_turn(Turn::new(Role::Assistant, "hi"));
        assert_eq!(session.snapshot().await.turns, 2);
    }

    #[tokio::test]
    async fn test_context_content_follows_disk() {
        let (_dir, session) = session();
        let rel = session.add_context_file(Path::new("b.py")).unwrap();
        assert_eq!(session.context_file_content(&rel).await.unwrap(), "y = 2\n");

        std::fs::write(session.root().join("b.py"), "y = 2000\n").unwrap();
        assert_eq!(session.context_file_content(&rel).await.unwrap(), "y = 2000\n");

        std::fs::remove_file(session.root().join("b.py")).unwrap();
        assert!(session.context_file_content(&rel).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_forgets_overview() {
        let (_dir, session) = session();
        session.set_last_overview("src/\n  a.py\n".into());
        assert_eq!(session.last_overview().as_deref(), Some("src/\n  a.py\n"));
        session.clear().await;
        assert!(session.last_overview().is_none());
    }

    #[test]
    fn test_invalid_transition_ignored() {
        let (_dir, session) = session();
        assert!(!session.set_state(AgentState::Executing));
        assert_eq!(session.state(), AgentState::Idle);
        assert!(session.set_state(AgentState::Streaming));
    }
}
