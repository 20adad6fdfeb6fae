//! Shell command execution with process-group teardown
//!
//! Every command runs in its own process group. Dropping the future (a
//! cancelled run) or hitting the timeout kills the whole group, so a
//! backgrounded grandchild can't outlive the run that started it.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct CommandOutput {
    /// stdout and stderr, interleaved by line
    pub output: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command timed out after {}s", .after.as_secs())]
    TimedOut { after: Duration, output: String },

    #[error("command cancelled")]
    Cancelled { output: String },
}

/// Kills the process group on drop unless disarmed
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
pub(crate) fn kill_group(pgid: u32) {
    debug!(pgid, "Killing process group");
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, "Process group already gone");
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pgid: u32) {}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    }
}

/// Run `command` through the shell in `cwd`
///
/// Resolves when the command exits, the timeout fires, or `cancel` is
/// triggered. Non-zero exits are not errors here; callers decide.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, CommandError> {
    let mut cmd = shell(command);
    cmd.current_dir(cwd)
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let mut guard = GroupGuard { pgid: child.id() };

    let buffer = Arc::new(Mutex::new(String::new()));
    let stdout = tokio::spawn(collect(child.stdout.take(), Arc::clone(&buffer)));
    let stderr = tokio::spawn(collect(child.stderr.take(), Arc::clone(&buffer)));

    let status = tokio::select! {
        status = timeout(limit, child.wait()) => status,
        _ = cancel.cancelled() => {
            drop(guard);
            let _ = child.kill().await;
            let output = drain(stdout, stderr, &buffer).await;
            return Err(CommandError::Cancelled { output });
        }
    };

    match status {
        Ok(Ok(status)) => {
            guard.disarm();
            let output = drain(stdout, stderr, &buffer).await;
            Ok(CommandOutput {
                output,
                exit_code: exit_code(status),
            })
        }
        Ok(Err(e)) => Err(CommandError::Spawn(e)),
        Err(_) => {
            warn!(command, "Command timed out");
            drop(guard);
            let _ = child.kill().await;
            let output = drain(stdout, stderr, &buffer).await;
            Err(CommandError::TimedOut {
                after: limit,
                output,
            })
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

async fn collect<R>(pipe: Option<R>, buffer: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else {
        return;
    };
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut buf = buffer.lock().await;
        buf.push_str(&line);
        buf.push('\n');
    }
}

async fn drain(
    stdout: tokio::task::JoinHandle<()>,
    stderr: tokio::task::JoinHandle<()>,
    buffer: &Arc<Mutex<String>>,
) -> String {
    for mut handle in [stdout, stderr] {
        if timeout(READER_JOIN_TIMEOUT, &mut handle).await.is_err() {
            handle.abort();
        }
    }
    std::mem::take(&mut *buffer.lock().await)
}
