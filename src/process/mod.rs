//! Subprocess execution for the PostgreSQL client tools.
//!
//! Commands are described by a [`CommandSpec`] (program, structured argument
//! list, environment, timeout, capture cap) and run through a
//! [`CommandRunner`]. Nothing goes through a shell. Secrets travel in the
//! environment only and are never printed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::{AppError, Result};

/// Default cap for each captured stream (10 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receives subprocess output as it is produced, one line at a time.
pub trait OutputObserver: Send + Sync {
    fn on_line(&self, program: &str, stream: StreamKind, line: &str);
}

/// Forwards tool output into the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl OutputObserver for TracingObserver {
    fn on_line(&self, program: &str, stream: StreamKind, line: &str) {
        match stream {
            StreamKind::Stdout => debug!(program, "stdout: {}", line),
            StreamKind::Stderr => warn!(program, "stderr: {}", line),
        }
    }
}

#[derive(Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: Duration::from_secs(60),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Short name used in logs and errors, e.g. `pg_restore`.
    pub fn program_name(&self) -> String {
        program_name(&self.program)
    }
}

// Env values are left out on purpose: they carry PGPASSWORD.
impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &self.env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("max_output_bytes", &self.max_output_bytes)
            .finish()
    }
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// Output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// True when either stream produced more than the capture cap.
    pub truncated: bool,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion. A non-zero exit, a launch failure or a
    /// timeout is always an error, whatever output was produced.
    async fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}

#[async_trait]
impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        (**self).run(spec).await
    }
}

/// Runs commands as child processes of this one.
///
/// Children are spawned with `kill_on_drop`, so a caller that drops the
/// future (cancellation) also takes the process down.
#[derive(Clone)]
pub struct SubprocessExecutor {
    observer: Arc<dyn OutputObserver>,
}

impl Default for SubprocessExecutor {
    fn default() -> Self {
        Self::new(Arc::new(TracingObserver))
    }
}

impl SubprocessExecutor {
    pub fn new(observer: Arc<dyn OutputObserver>) -> Self {
        Self { observer }
    }
}

#[async_trait]
impl CommandRunner for SubprocessExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let program = spec.program_name();
        debug!(command = ?spec, "Spawning process");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| AppError::Spawn {
            program: program.clone(),
            source,
        })?;

        let mut stdout_task = tokio::spawn(capture_stream(
            child.stdout.take(),
            StreamKind::Stdout,
            program.clone(),
            spec.max_output_bytes,
            self.observer.clone(),
        ));
        let mut stderr_task = tokio::spawn(capture_stream(
            child.stderr.take(),
            StreamKind::Stderr,
            program.clone(),
            spec.max_output_bytes,
            self.observer.clone(),
        ));

        // One deadline covers the exit and draining the pipes, which a
        // backgrounded descendant can hold open after the child is gone.
        let deadline = tokio::time::Instant::now() + spec.timeout;
        let waited = tokio::time::timeout_at(deadline, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(AppError::Io(e));
            }
            Err(_elapsed) => {
                if let Err(e) = child.kill().await {
                    warn!(program = %program, error = %e, "Failed to kill timed out process");
                }
                stdout_task.abort();
                stderr_task.abort();
                return Err(AppError::Timeout {
                    program,
                    timeout: spec.timeout,
                });
            }
        };

        let drained = tokio::time::timeout_at(deadline, async {
            tokio::join!(&mut stdout_task, &mut stderr_task)
        })
        .await;
        let (stdout, stderr) = match drained {
            Ok((stdout, stderr)) => (stdout.unwrap_or_default(), stderr.unwrap_or_default()),
            Err(_elapsed) => {
                warn!(program = %program, "Output still open after exit, giving up at the deadline");
                stdout_task.abort();
                stderr_task.abort();
                return Err(AppError::Timeout {
                    program,
                    timeout: spec.timeout,
                });
            }
        };
        debug!(
            program = %program,
            status = %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Process exited"
        );

        if !status.success() {
            return Err(AppError::Process {
                program,
                exit_code: status.code(),
                stderr: stderr.text.trim_end().to_string(),
            });
        }

        Ok(ExecutionResult {
            exit_code: status.code().unwrap_or(0),
            truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.text,
            stderr: stderr.text,
        })
    }
}

#[derive(Debug, Default)]
struct Captured {
    text: String,
    truncated: bool,
}

/// Reads a stream line by line, handing every line to the observer and
/// keeping at most `cap` bytes of it.
async fn capture_stream<R>(
    handle: Option<R>,
    stream: StreamKind,
    program: String,
    cap: usize,
    observer: Arc<dyn OutputObserver>,
) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let Some(handle) = handle else {
        return captured;
    };

    let mut reader = BufReader::new(handle);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                observer.on_line(&program, stream, line.trim_end_matches(['\n', '\r']));

                let room = cap.saturating_sub(captured.text.len());
                if line.len() <= room {
                    captured.text.push_str(&line);
                } else {
                    let mut end = room;
                    while !line.is_char_boundary(end) {
                        end -= 1;
                    }
                    captured.text.push_str(&line[..end]);
                    captured.truncated = true;
                }
            }
            Err(e) => {
                warn!(program = %program, error = %e, "Failed to read process output");
                break;
            }
        }
    }
    captured
}
