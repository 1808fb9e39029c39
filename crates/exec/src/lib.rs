//! Child-process execution with allowlist screening, privilege elevation,
//! deadline supervision, and signal-based cancellation.
//!
//! Every spawn is tracked in a process table; the supervising call drives
//! the child to completion and removes the entry on every exit path.
//! Deadline expiry and kill requests both escalate SIGTERM → SIGKILL with a
//! fixed grace period.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use mcp_hostd_core::{HostdError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{geteuid, Pid};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Character sequences rejected in the command token; they enable shell
/// chaining or path traversal and have no place in a bare command name.
const FORBIDDEN_SEQUENCES: [&str; 6] = [";", "&&", "||", "|", "..", "~"];

/// Grace period between SIGTERM and SIGKILL.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Byte ceiling for captured output across both streams.
const DEFAULT_MAX_OUTPUT: usize = 10 * 1024 * 1024;

#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Deadline for the child; falls back to the executor default.
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
    pub capture_output: bool,
}

impl ExecOptions {
    pub fn captured() -> Self {
        Self {
            capture_output: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }
}

/// Outcome of a child process that ran to completion (including non-zero
/// exits). Timeouts and kills surface as errors, not outcomes.
#[derive(Clone, Debug)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub success: bool,
    /// Name of the terminating signal when the child died without a code.
    pub signal: Option<String>,
    pub truncated: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KillRequest {
    None,
    Graceful,
}

struct ProcessEntry {
    pid: Option<u32>,
    command: String,
    started_at: Instant,
    kill_tx: watch::Sender<KillRequest>,
    done_rx: watch::Receiver<bool>,
}

/// Summary of a live process-table entry.
#[derive(Clone, Debug)]
pub struct ProcessInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub running_for: Duration,
}

pub struct CommandExecutor {
    allowed_commands: Vec<String>,
    default_timeout: Duration,
    kill_grace: Duration,
    max_output: usize,
    counter: AtomicU64,
    processes: Mutex<HashMap<String, ProcessEntry>>,
}

impl CommandExecutor {
    pub fn new(allowed_commands: Vec<String>, default_timeout: Duration) -> Self {
        Self {
            allowed_commands,
            default_timeout,
            kill_grace: DEFAULT_KILL_GRACE,
            max_output: DEFAULT_MAX_OUTPUT,
            counter: AtomicU64::new(0),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output = bytes;
        self
    }

    /// Run a command under the configured safety checks.
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> Result<ExecOutcome> {
        self.screen(command, args)?;
        self.spawn_supervised(command, command, args, options).await
    }

    /// Run a command with superuser privileges. When the daemon already has
    /// euid 0 this is a plain execution; otherwise the invocation is
    /// rewritten through the non-interactive elevation helper.
    pub async fn execute_with_elevation(
        &self,
        command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> Result<ExecOutcome> {
        self.screen(command, args)?;
        if geteuid().is_root() {
            return self.spawn_supervised(command, command, args, options).await;
        }
        let mut elevated = Vec::with_capacity(args.len() + 2);
        elevated.push("-n".to_string());
        elevated.push(command.to_string());
        elevated.extend_from_slice(args);
        self.spawn_supervised("sudo", command, &elevated, options)
            .await
    }

    /// Whether `command` resolves to an executable, either as an absolute
    /// path or through PATH.
    pub fn check_command_exists(&self, command: &str) -> bool {
        if command.contains('/') {
            return is_executable(&PathBuf::from(command));
        }
        let path = match std::env::var_os("PATH") {
            Some(path) => path,
            None => return false,
        };
        std::env::split_paths(&path).any(|dir| is_executable(&dir.join(command)))
    }

    /// Request graceful termination of one tracked process and wait for the
    /// supervisor to reap it.
    pub async fn kill_process(&self, id: &str) -> Result<()> {
        let done_rx = {
            let table = self.processes.lock();
            match table.get(id) {
                Some(entry) => {
                    debug!(process_id = %id, command = %entry.command, "kill requested");
                    let _ = entry.kill_tx.send(KillRequest::Graceful);
                    entry.done_rx.clone()
                }
                None => {
                    return Err(HostdError::Internal(format!("no such process: {id}")));
                }
            }
        };
        await_done(done_rx).await;
        Ok(())
    }

    /// Gracefully terminate every live entry concurrently and wait for all
    /// of them; invoked during shutdown.
    pub async fn kill_all_processes(&self) {
        let waiters: Vec<_> = {
            let table = self.processes.lock();
            table
                .values()
                .map(|entry| {
                    let _ = entry.kill_tx.send(KillRequest::Graceful);
                    entry.done_rx.clone()
                })
                .collect()
        };
        if waiters.is_empty() {
            return;
        }
        debug!(count = waiters.len(), "terminating all tracked processes");
        join_all(waiters.into_iter().map(await_done)).await;
    }

    pub fn active_processes(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.processes
            .lock()
            .iter()
            .map(|(id, entry)| ProcessInfo {
                id: id.clone(),
                pid: entry.pid,
                command: entry.command.clone(),
                running_for: entry.started_at.elapsed(),
            })
            .collect()
    }

    fn screen(&self, command: &str, args: &[String]) -> Result<()> {
        if !self.allowed_commands.is_empty()
            && !self.allowed_commands.iter().any(|allowed| allowed == command)
        {
            return Err(HostdError::NotAllowed(format!(
                "Command not allowed: {command}"
            )));
        }
        for sequence in FORBIDDEN_SEQUENCES {
            if command.contains(sequence) {
                return Err(HostdError::NotAllowed(format!(
                    "command contains forbidden sequence '{sequence}'"
                )));
            }
        }
        for arg in args {
            if arg.contains("..") || arg.contains('~') {
                return Err(HostdError::NotAllowed(
                    "path traversal in arguments not allowed".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn next_process_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{seq}-{}", Uuid::new_v4().simple())
    }

    async fn spawn_supervised(
        &self,
        program: &str,
        display_command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> Result<ExecOutcome> {
        let command_line = if args.is_empty() {
            display_command.to_string()
        } else {
            format!("{display_command} {}", args.join(" "))
        };
        debug!(command = %command_line, "spawning child process");

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        if let Some(dir) = &options.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &options.env {
            command.env(key, value);
        }
        if options.capture_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
            command.stdin(if options.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        } else {
            command
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .stdin(if options.stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::inherit()
                });
        }

        let mut child = command
            .spawn()
            .map_err(|e| HostdError::Command(format!("Failed to spawn command: {e}")))?;
        let pid = child.id();
        let started = Instant::now();

        if let Some(payload) = &options.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(payload.as_bytes())
                    .await
                    .map_err(|e| HostdError::Command(format!("failed to write stdin: {e}")))?;
            }
        }

        let stdout_reader = child.stdout.take().map(|mut stream| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut stream| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf).await;
                buf
            })
        });

        let (kill_tx, mut kill_rx) = watch::channel(KillRequest::None);
        let (done_tx, done_rx) = watch::channel(false);
        let id = self.next_process_id();
        self.processes.lock().insert(
            id.clone(),
            ProcessEntry {
                pid,
                command: command_line.clone(),
                started_at: started,
                kill_tx,
                done_rx,
            },
        );

        let deadline = options.timeout.unwrap_or(self.default_timeout);

        enum WaitOutcome {
            Exited(std::io::Result<ExitStatus>),
            DeadlineExpired,
            KillRequested,
        }

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = tokio::time::sleep(deadline) => WaitOutcome::DeadlineExpired,
            _ = kill_rx.wait_for(|req| *req == KillRequest::Graceful) => WaitOutcome::KillRequested,
        };

        let resolution = match outcome {
            WaitOutcome::Exited(Ok(status)) => Ok(status),
            WaitOutcome::Exited(Err(e)) => {
                self.terminate(&mut child).await;
                Err(HostdError::Command(format!("Command error: {e}")))
            }
            WaitOutcome::DeadlineExpired => {
                warn!(command = %command_line, timeout_ms = deadline.as_millis() as u64, "deadline expired, terminating child");
                self.terminate(&mut child).await;
                Err(HostdError::Command(format!(
                    "Command timed out after {}ms: {command_line}",
                    deadline.as_millis()
                )))
            }
            WaitOutcome::KillRequested => {
                self.terminate(&mut child).await;
                Err(HostdError::Command(format!(
                    "Command killed: {command_line}"
                )))
            }
        };

        let stdout_bytes = match stdout_reader {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr_bytes = match stderr_reader {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        self.processes.lock().remove(&id);
        let _ = done_tx.send(true);

        let status = resolution?;
        let duration = started.elapsed();
        let per_stream = self.max_output / 2;
        let (stdout, stdout_truncated) = clamp_output(&stdout_bytes, per_stream);
        let (stderr, stderr_truncated) = clamp_output(&stderr_bytes, per_stream);
        if stdout_truncated || stderr_truncated {
            warn!(command = %command_line, "command output exceeded size limit");
        }

        let exit_code = status.code();
        Ok(ExecOutcome {
            exit_code,
            stdout,
            stderr,
            duration,
            success: exit_code == Some(0),
            signal: status.signal().map(signal_name),
            truncated: stdout_truncated || stderr_truncated,
        })
    }

    /// SIGTERM, then SIGKILL after the grace period, then reap.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {}
                Err(Errno::ESRCH) => {
                    let _ = child.wait().await;
                    return;
                }
                Err(e) => warn!(pid, error = %e, "failed to signal child"),
            }
        }
        match timeout(self.kill_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to force-kill child");
                }
                let _ = child.wait().await;
            }
        }
    }
}

async fn await_done(mut done_rx: watch::Receiver<bool>) {
    // The supervisor either flags completion or drops the sender; both end
    // the wait.
    let _ = done_rx.wait_for(|done| *done).await;
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn clamp_output(bytes: &[u8], cap: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= cap {
        (text.into_owned(), false)
    } else {
        (text.chars().take(cap).collect(), true)
    }
}

fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("signal {signal}"),
    }
}
