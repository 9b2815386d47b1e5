//! Bounded execution of external commands.
//!
//! Every command runs under a timeout and is tracked in a registry so that
//! shutdown can cancel whatever is still in flight.

use crate::error::PreviewError;
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

/// Description of an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Capture stderr as well as stdout (non-silent mode)
    pub capture_stderr: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capture_stderr: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run `script` through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn verbose(mut self) -> Self {
        self.capture_stderr = true;
        self
    }

    /// Human readable command line, for logs and errors
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Quote `value` for safe interpolation into a POSIX shell script
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// How a command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Process exited on its own. `None` means it was killed by a signal.
    Exited { code: Option<i32> },
    /// Budget expired and the process was killed
    TimedOut { after_ms: u64 },
    /// Process never started
    SpawnFailed { not_found: bool },
    /// Cancelled through [`PendingCommands::cancel_all`]
    Cancelled,
}

/// Result of one command. Never an error: failures are folded into `outcome`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub outcome: CommandOutcome,
    pub stdout: String,
    /// Captured stderr, or the failure message for timeouts and spawn errors
    pub stderr: String,
}

impl CommandOutput {
    pub fn exited(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            outcome: CommandOutcome::Exited { code: Some(code) },
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        let after_ms = after.as_millis() as u64;
        Self {
            outcome: CommandOutcome::TimedOut { after_ms },
            stdout: String::new(),
            stderr: format!("Timeout after {}ms", after_ms),
        }
    }

    pub fn spawn_failed(err: &std::io::Error) -> Self {
        Self {
            outcome: CommandOutcome::SpawnFailed {
                not_found: err.kind() == std::io::ErrorKind::NotFound,
            },
            stdout: String::new(),
            stderr: err.to_string(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            outcome: CommandOutcome::Cancelled,
            stdout: String::new(),
            stderr: "Cancelled".to_string(),
        }
    }

    /// Exit status zero
    pub fn success(&self) -> bool {
        self.outcome == CommandOutcome::Exited { code: Some(0) }
    }

    /// The program itself does not exist
    pub fn tool_missing(&self) -> bool {
        self.outcome == CommandOutcome::SpawnFailed { not_found: true }
    }

    /// Classify a failed run. `None` for any exited process, successful or not.
    pub fn error(&self, spec: &CommandSpec) -> Option<PreviewError> {
        match &self.outcome {
            CommandOutcome::Exited { .. } => None,
            CommandOutcome::TimedOut { after_ms } => Some(PreviewError::Timeout {
                command: spec.display(),
                after_ms: *after_ms,
            }),
            CommandOutcome::SpawnFailed { not_found: true } => {
                Some(PreviewError::ToolMissing(spec.program.clone()))
            }
            CommandOutcome::SpawnFailed { not_found: false } | CommandOutcome::Cancelled => {
                Some(PreviewError::Spawn {
                    command: spec.display(),
                    message: self.stderr.clone(),
                })
            }
        }
    }
}

/// Runs external commands. The seam that tests replace with scripted output.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run `spec`, killing it if it is still alive after `timeout`
    fn run(&self, spec: CommandSpec, timeout: Duration)
        -> impl Future<Output = CommandOutput> + Send;

    /// Cancel every command still in flight
    fn cancel_all(&self) {}
}

/// Registry of in-flight commands
#[derive(Debug, Clone, Default)]
pub struct PendingCommands {
    next_id: Arc<AtomicU64>,
    entries: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, handle: AbortHandle) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, handle.clone());
        Registration {
            id,
            handle,
            pending: self.clone(),
        }
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Abort every tracked command. Their processes are killed as the tasks unwind.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<AbortHandle> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.abort();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes the registry entry and stops the task when the caller is done with it
struct Registration {
    id: u64,
    handle: AbortHandle,
    pending: PendingCommands,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.pending.remove(self.id);
        self.handle.abort();
    }
}

/// Spawns real processes with tokio
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    pending: PendingCommands,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }
}

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        spec: CommandSpec,
        timeout: Duration,
    ) -> impl Future<Output = CommandOutput> + Send {
        let pending = self.pending.clone();
        async move {
            let task = tokio::spawn(execute(spec, timeout));
            // Dropped before the output is handed back, or when the caller gives up
            let registration = pending.register(task.abort_handle());
            let output = match task.await {
                Ok(output) => output,
                Err(_) => CommandOutput::cancelled(),
            };
            drop(registration);
            output
        }
    }

    fn cancel_all(&self) {
        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled pending commands");
        }
    }
}

async fn execute(spec: CommandSpec, limit: Duration) -> CommandOutput {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(if spec.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!(command = %spec.display(), error = %e, "spawn failed");
            return CommandOutput::spawn_failed(&e);
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let collect = async {
        let (stdout, stderr) = tokio::join!(read_pipe(stdout), read_pipe(stderr));
        let status = child.wait().await;
        (status, stdout, stderr)
    };
    let finished = tokio::time::timeout(limit, collect).await;

    match finished {
        Ok((Ok(status), stdout, stderr)) => CommandOutput {
            outcome: CommandOutcome::Exited {
                code: status.code(),
            },
            stdout,
            stderr,
        },
        Ok((Err(e), stdout, _)) => CommandOutput {
            outcome: CommandOutcome::Exited { code: None },
            stdout,
            stderr: e.to_string(),
        },
        Err(_) => {
            let _ = child.kill().await;
            debug!(command = %spec.display(), timeout_ms = limit.as_millis() as u64, "command timed out");
            CommandOutput::timed_out(limit)
        }
    }
}

async fn read_pipe<P: AsyncRead + Unpin>(pipe: Option<P>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Continuation style entry point: `on_done` runs exactly once with the output
///
/// Aborting the returned handle drops `on_done` without calling it.
pub fn run_with<R, F>(
    runner: Arc<R>,
    spec: CommandSpec,
    timeout: Duration,
    on_done: F,
) -> JoinHandle<()>
where
    R: CommandRunner,
    F: FnOnce(CommandOutput) + Send + 'static,
{
    tokio::spawn(async move {
        let output = runner.run(spec, timeout).await;
        on_done(output);
    })
}
