//! Process spawning
//!
//! [`CommandRunner`] is the seam between the engine and the host. The
//! production [`ShellRunner`] runs literals through `sh -c`.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_plan::CommandText;

use crate::ExecError;

/// How long pipe readers may keep draining once the process is gone
const PIPE_DRAIN: Duration = Duration::from_secs(1);

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ExitState {
    /// Exited with a code
    Exited(i32),
    /// Killed by a signal
    Signalled,
    /// Killed at the timeout
    TimedOut,
    /// Killed because the task was cancelled
    Cancelled,
    /// Could not be started
    SpawnFailed(String),
    /// Launched in the background
    Detached,
}

impl ExitState {
    /// Exit 0 or detached
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0) | Self::Detached)
    }
}

/// Captured result of a foreground run
#[derive(Debug, Clone)]
pub struct RawOutcome {
    /// Termination
    pub exit: ExitState,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Wall-clock time
    pub duration: Duration,
}

impl RawOutcome {
    /// Stdout followed by stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// A detached process that can be stopped later
#[async_trait]
pub trait ServerProcess: Send + Sync {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Stop the process and reap it
    async fn terminate(&mut self);
}

/// Spawns planned commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, killing on timeout or cancellation
    async fn run(
        &self,
        command: &CommandText,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RawOutcome;

    /// Launch detached
    ///
    /// # Errors
    /// [`ExecError::Spawn`] if the process could not be started
    async fn spawn_background(
        &self,
        command: &CommandText,
        cwd: &Path,
    ) -> Result<Box<dyn ServerProcess>, ExecError>;
}

/// Runs commands through `sh -c`
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self { shell: "sh".into() }
    }
}

impl ShellRunner {
    /// Runner using `sh`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner using another POSIX shell
    #[must_use]
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }

    fn command(&self, command: &CommandText, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command.literal())
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // Own process group, so a kill reaches everything the shell started.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &CommandText,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RawOutcome {
        let started = Instant::now();
        let child = self
            .command(command, cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                return RawOutcome {
                    exit: ExitState::SpawnFailed(e.to_string()),
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration: started.elapsed(),
                }
            }
        };
        let group = child.id();
        let stdout = Capture::start(child.stdout.take());
        let stderr = Capture::start(child.stderr.take());

        let exit = tokio::select! {
            res = tokio::time::timeout(timeout, child.wait()) => match res {
                Ok(Ok(status)) => status.code().map_or(ExitState::Signalled, ExitState::Exited),
                Ok(Err(e)) => ExitState::SpawnFailed(e.to_string()),
                Err(_) => ExitState::TimedOut,
            },
            () = cancel.cancelled() => ExitState::Cancelled,
        };
        if matches!(exit, ExitState::TimedOut | ExitState::Cancelled) {
            tracing::warn!(command = %command, pid = ?group, exit = ?exit, "killing process group");
            kill_group(&mut child, group).await;
        }

        let stdout = stdout.finish().await;
        let mut stderr = stderr.finish().await;
        let note = match &exit {
            ExitState::TimedOut => Some(format!("timed out after {}s", timeout.as_secs())),
            ExitState::Cancelled => Some("cancelled".to_string()),
            ExitState::SpawnFailed(reason) => Some(reason.clone()),
            _ => None,
        };
        if let Some(note) = note {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&note);
        }

        RawOutcome {
            exit,
            stdout,
            stderr,
            duration: started.elapsed(),
        }
    }

    async fn spawn_background(
        &self,
        command: &CommandText,
        cwd: &Path,
    ) -> Result<Box<dyn ServerProcess>, ExecError> {
        let child = self
            .command(command, cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: command.literal().to_string(),
                source,
            })?;
        let group = child.id();
        tracing::info!(command = %command, pid = ?group, "background process started");
        Ok(Box::new(ChildServer { child, group }))
    }
}

/// A pipe drained into a shared buffer, so a killed process keeps its partial output
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let reader = pipe.map(|mut pipe| {
            let sink = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { buf, reader }
    }

    async fn finish(self) -> String {
        if let Some(mut reader) = self.reader {
            // A stray process outside the group may hold the pipe open.
            if tokio::time::timeout(PIPE_DRAIN, &mut reader).await.is_err() {
                reader.abort();
            }
        }
        let text = String::from_utf8_lossy(&self.buf.lock()).into_owned();
        text
    }
}

/// SIGKILL the whole process group led by `group`, then reap the leader
async fn kill_group(child: &mut Child, group: Option<u32>) {
    #[cfg(unix)]
    {
        let Some(pgid) = group else {
            return reap(child).await;
        };
        let status = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{pgid}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => tracing::debug!(pgid, status = ?s.code(), "process group already gone"),
            Err(e) => tracing::warn!(pgid, error = %e, "failed to invoke kill for process group"),
        }
    }
    #[cfg(not(unix))]
    let _ = group;
    reap(child).await;
}

async fn reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "process already gone");
    }
    if let Err(e) = child.wait().await {
        tracing::debug!(error = %e, "failed to reap process");
    }
}

struct ChildServer {
    child: Child,
    group: Option<u32>,
}

#[async_trait]
impl ServerProcess for ChildServer {
    fn id(&self) -> Option<u32> {
        self.group
    }

    async fn terminate(&mut self) {
        kill_group(&mut self.child, self.group).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CommandText {
        CommandText::parse(s).unwrap()
    }

    #[tokio::test]
    async fn captures_exit_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellRunner::new()
            .run(
                &text("echo out; echo err >&2; exit 3"),
                dir.path(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.exit, ExitState::Exited(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.combined_output(), "out\n\nerr\n");
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellRunner::new()
            .run(
                &text("sleep 5"),
                dir.path(),
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.exit, ExitState::TimedOut);
        assert!(out.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let out = ShellRunner::new()
            .run(&text("sleep 5"), dir.path(), Duration::from_secs(10), &token)
            .await;
        assert_eq!(out.exit, ExitState::Cancelled);
    }

    /// Live process, ignoring zombies waiting on a non-reaping init
    #[cfg(target_os = "linux")]
    fn alive(pid: &str) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().to_string()))
            .is_some_and(|rest| !rest.starts_with('Z') && !rest.starts_with('X'))
    }

    #[cfg(target_os = "linux")]
    async fn read_pid(dir: &Path, name: &str) -> String {
        for _ in 0..50 {
            if let Ok(pid) = std::fs::read_to_string(dir.join(name)) {
                if !pid.trim().is_empty() {
                    return pid.trim().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{name} was never written");
    }

    #[cfg(target_os = "linux")]
    async fn gone(pid: &str) -> bool {
        for _ in 0..100 {
            if !alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_grandchildren_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellRunner::new()
            .run(
                &text("echo started; sleep 4242 & echo $! > child.pid; wait"),
                dir.path(),
                Duration::from_millis(300),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.exit, ExitState::TimedOut);
        assert_eq!(out.stdout.trim(), "started");
        assert!(out.stderr.contains("timed out"));

        let pid = read_pid(dir.path(), "child.pid").await;
        assert!(gone(&pid).await, "sleep {pid} survived the timeout");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancel_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let out = ShellRunner::new()
            .run(
                &text("sleep 4141 & echo $! > child.pid; wait"),
                dir.path(),
                Duration::from_secs(30),
                &token,
            )
            .await;
        assert_eq!(out.exit, ExitState::Cancelled);
        let pid = read_pid(dir.path(), "child.pid").await;
        assert!(gone(&pid).await, "sleep {pid} survived cancellation");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminating_a_server_kills_its_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = ShellRunner::new()
            .spawn_background(&text("sleep 4343 & echo $! > server.pid; wait"), dir.path())
            .await
            .unwrap();
        let pid = read_pid(dir.path(), "server.pid").await;
        assert!(alive(&pid));

        server.terminate().await;
        assert!(gone(&pid).await, "sleep {pid} survived terminate");
    }

    #[tokio::test]
    async fn missing_shell_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellRunner::with_shell("/nonexistent/shell")
            .run(&text("true"), dir.path(), Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert!(matches!(out.exit, ExitState::SpawnFailed(_)));
    }
}
