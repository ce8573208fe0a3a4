//! Long-lived Claude Code worker process spawning and control.
//!
//! This module provides a builder for the worker command line and a handle
//! for a running worker. The handle owns the child and exposes parsed stdout
//! events through a channel. Request lines go to a writer task that owns
//! stdin, so a worker that stops reading never blocks the caller.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::cli::{StreamParser, UserMessage, WorkerEvent, DEFAULT_CHANNEL_BUFFER};

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The binary was not found.
    #[error("Worker binary not found: {0}")]
    NotFound(String),
    /// Permission denied when spawning.
    #[error("Permission denied spawning {0}")]
    PermissionDenied(String),
    /// A stdio pipe was not available after spawning.
    #[error("Worker {0} pipe not available")]
    MissingPipe(&'static str),
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(binary: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(binary.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(binary.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Builder for the worker command line.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    binary: String,
    prefix_args: Vec<String>,
    model: Option<String>,
    skip_permissions: bool,
    append_system_prompt: Option<String>,
    resume_session: Option<String>,
    working_dir: Option<PathBuf>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl WorkerCommand {
    /// Create a builder for the given worker binary.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            prefix_args: Vec::new(),
            model: None,
            skip_permissions: false,
            append_system_prompt: None,
            resume_session: None,
            working_dir: None,
        }
    }

    /// Arguments placed before the worker flags, for launchers such as
    /// `npx` or an interpreter running a script.
    #[must_use]
    pub fn prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Select the model.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Skip interactive permission prompts.
    #[must_use]
    pub fn skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = skip;
        self
    }

    /// Append to the system prompt.
    #[must_use]
    pub fn append_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.append_system_prompt = Some(prompt.into());
        self
    }

    /// Resume an existing conversation.
    #[must_use]
    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session = Some(session_id.into());
        self
    }

    /// Set the working directory for the worker.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Get the binary name.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Get the working directory, if set.
    #[must_use]
    pub fn get_working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Build the command-line arguments.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.extend([
            "-p".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ]);

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }

        if let Some(prompt) = &self.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }

        if let Some(session_id) = &self.resume_session {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }

        args
    }
}

/// A running worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    lines: mpsc::UnboundedSender<String>,
    events: mpsc::Receiver<WorkerEvent>,
}

impl WorkerProcess {
    /// Spawn a worker with the given command configuration.
    ///
    /// stdout is handed to a [`StreamParser`] task and stderr is drained
    /// into the debug log.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn(command: &WorkerCommand) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(&command.binary);
        cmd.args(command.build_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_io(&command.binary, e))?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr, child.id());
        }

        let events = StreamParser::into_channel(stdout, DEFAULT_CHANNEL_BUFFER);
        let lines = spawn_stdin_writer(stdin, child.id());

        Ok(Self {
            child,
            lines,
            events,
        })
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Queue one request line for the stdin writer.
    ///
    /// Returns immediately; the write itself happens on the writer task.
    ///
    /// # Errors
    ///
    /// Returns `BrokenPipe` if an earlier write failed and the writer has
    /// stopped, usually because the worker exited.
    pub fn send(&self, message: &UserMessage) -> std::io::Result<()> {
        let line = message.to_line().map_err(std::io::Error::other)?;
        self.lines.send(line).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin closed")
        })
    }

    /// Receive the next parsed event.
    ///
    /// Returns `None` once stdout has closed. Cancel safe.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Wait up to `grace` for the process to exit, then kill it.
    ///
    /// Returns the exit code when one was observed.
    pub async fn reap(mut self, grace: Duration) -> Option<i32> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Failed to wait for worker");
                None
            }
            Err(_) => {
                let _ = self.child.kill().await;
                None
            }
        }
    }

    /// Forcefully kill the process without waiting.
    ///
    /// The kill signal is sent immediately; reaping happens in the background.
    pub fn kill(self) {
        let Self {
            mut child, lines, ..
        } = self;
        drop(lines);
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "Worker already gone");
        }
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }

    /// Attempt graceful termination with a timeout.
    ///
    /// Stops the stdin writer, which closes stdin once queued lines are
    /// written. Then on Unix sends SIGTERM and falls back to SIGKILL
    /// after the timeout. On other platforms, falls back to immediate kill.
    ///
    /// # Errors
    ///
    /// Returns an error if termination fails.
    pub async fn graceful_terminate(self, timeout: Duration) -> std::io::Result<()> {
        let Self {
            mut child, lines, ..
        } = self;
        drop(lines);

        #[cfg(unix)]
        {
            graceful_terminate_unix(&mut child, timeout).await
        }

        #[cfg(not(unix))]
        {
            let _ = timeout;
            child.kill().await
        }
    }
}

#[cfg(unix)]
async fn graceful_terminate_unix(child: &mut Child, timeout: Duration) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        let _ = kill(nix_pid, Signal::SIGTERM);

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => child.kill().await,
        }
    } else {
        // Process already exited
        Ok(())
    }
}

/// Own `stdin` on a task that writes queued lines in order.
///
/// The task ends when the sender is dropped or a write fails; stdin is
/// closed either way.
fn spawn_stdin_writer(mut stdin: ChildStdin, pid: Option<u32>) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut stdin, &line).await {
                tracing::warn!(pid = ?pid, error = %e, "Failed to write to worker stdin");
                break;
            }
        }
    });
    tx
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(pid = ?pid, stderr = %line, "Worker stderr");
        }
    });
}
