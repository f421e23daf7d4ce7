//! Subprocess execution abstraction.
//!
//! Every external tool the orchestrator drives -- `systemd-run`,
//! `systemd-nspawn`, `podman`, `btrfs`, `apt-get`, `dnf`, `git`, `gbp`,
//! `rpmbuild` -- goes through `CommandExecutor`. This keeps a single seam
//! for dry-run mode and for the `MockCommandExecutor` used by tests (C11),
//! instead of scattering `std::process::Command` through every component.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Result, bail};
use camino::Utf8PathBuf;
use which::which;

use crate::runlog::RunLog;

/// Maximum size of captured output kept per stream, in bytes.
pub const MAX_OUTPUT_SIZE: usize = 64 * 1024;

struct LineEntry {
    data: Vec<u8>,
}

/// FIFO ring buffer that keeps the most recent `max_size` bytes of lines.
struct RingLineBuffer {
    lines: VecDeque<LineEntry>,
    total_size: usize,
    max_size: usize,
}

impl RingLineBuffer {
    fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            total_size: 0,
            max_size,
        }
    }

    fn push_line(&mut self, line: Vec<u8>) {
        let line = if line.len() > self.max_size {
            line[line.len() - self.max_size..].to_vec()
        } else {
            line
        };
        let line_size = line.len();
        while self.total_size + line_size > self.max_size && !self.lines.is_empty() {
            if let Some(old) = self.lines.pop_front() {
                self.total_size -= old.data.len();
            }
        }
        self.total_size += line_size;
        self.lines.push_back(LineEntry { data: line });
    }

    fn into_vec(self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.total_size);
        for entry in self.lines {
            result.extend(entry.data);
        }
        result
    }
}

#[derive(Clone, Copy)]
enum StreamType {
    Stdout,
    Stderr,
}

impl StreamType {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn panic_message(err: &(dyn std::any::Any + Send)) -> &str {
    err.downcast_ref::<&str>()
        .copied()
        .or_else(|| err.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

fn log_line(line: &[u8], stream_type: StreamType) {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim_end_matches('\r');
    match stream_type {
        StreamType::Stdout => tracing::info!(stream = %stream_type, "{}", trimmed),
        StreamType::Stderr => tracing::warn!(stream = %stream_type, "{}", trimmed),
    }
}

fn read_pipe_to_buffer<R: Read>(pipe: Option<R>, stream_type: StreamType) -> Vec<u8> {
    let Some(pipe) = pipe else {
        return Vec::new();
    };
    let mut reader = BufReader::new(pipe);
    let mut ring_buffer = RingLineBuffer::new(MAX_OUTPUT_SIZE);
    let mut line_buf = Vec::new();
    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf) {
            Ok(0) => break,
            Ok(_) => {
                let log_content = line_buf.strip_suffix(b"\n").unwrap_or(&line_buf);
                log_line(log_content, stream_type);
                ring_buffer.push_line(std::mem::take(&mut line_buf));
            }
            Err(e) => {
                tracing::warn!(stream = %stream_type, error = %e, "I/O error, stopping read");
                break;
            }
        }
    }
    ring_buffer.into_vec()
}

/// Specification for a single command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Binary name or path to execute (looked up on `$PATH` via `which`).
    pub command: String,
    pub args: Vec<OsString>,
    pub cwd: Option<Utf8PathBuf>,
    pub env: Vec<(String, String)>,
    /// When true, stdio is inherited from the parent instead of captured
    /// (used for `monci shell` and `monci run` without `--quiet`).
    pub interactive: bool,
}

impl CommandSpec {
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<OsString>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: None,
            env: Vec::new(),
            interactive: false,
        }
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: Utf8PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Renders `command arg1 arg2 ...` for diagnostics and run-log entries.
    pub fn display_args(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// `None` in dry-run mode.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status.as_ref().is_none_or(|s| s.success())
    }

    pub fn code(&self) -> Option<i32> {
        self.status.as_ref().and_then(|s| s.code())
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Strategy for running a [`CommandSpec`] and producing an [`ExecutionResult`].
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}

/// Runs commands for real via `std::process::Command`, streaming output
/// into `tracing` while keeping a bounded tail for error reporting.
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

impl RealCommandExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        if self.dry_run {
            tracing::info!("dry run: {}", spec.display_args());
            return Ok(ExecutionResult {
                status: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
            });
        }

        let cmd = which(&spec.command)
            .map_err(|e| anyhow::anyhow!("command not found: {}: {}", spec.command, e))?;
        tracing::trace!("command found: {}: {}", spec.command, cmd.to_string_lossy());

        let mut command = Command::new(cmd);
        command.args(&spec.args);
        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        if spec.interactive {
            command.stdin(Stdio::inherit());
            command.stdout(Stdio::inherit());
            command.stderr(Stdio::inherit());
            let status = command
                .status()
                .map_err(|e| anyhow::anyhow!("failed to spawn `{}`: {}", spec.display_args(), e))?;
            return Ok(ExecutionResult {
                status: Some(status),
                stdout: Vec::new(),
                stderr: Vec::new(),
            });
        }

        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn `{}`: {}", spec.display_args(), e))?;
        tracing::trace!("spawned command: {}: pid={}", spec.command, child.id());

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdout_handle = thread::Builder::new()
            .name("stdout-reader".to_string())
            .spawn(move || read_pipe_to_buffer(stdout_pipe, StreamType::Stdout))
            .map_err(|e| anyhow::anyhow!("failed to spawn stdout reader thread: {}", e))?;

        let stderr_handle = match thread::Builder::new()
            .name("stderr-reader".to_string())
            .spawn(move || read_pipe_to_buffer(stderr_pipe, StreamType::Stderr))
        {
            Ok(handle) => handle,
            Err(e) => {
                let _ = stdout_handle.join();
                bail!("failed to spawn stderr reader thread: {}", e);
            }
        };

        let status = match child.wait() {
            Ok(s) => s,
            Err(e) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                bail!("failed to wait for `{}`: {}", spec.display_args(), e);
            }
        };

        let stdout = stdout_handle.join().unwrap_or_else(|e| {
            tracing::error!(stream = "stdout", panic = panic_message(&*e), "reader thread panicked");
            Vec::new()
        });
        let stderr = stderr_handle.join().unwrap_or_else(|e| {
            tracing::error!(stream = "stderr", panic = panic_message(&*e), "reader thread panicked");
            Vec::new()
        });

        tracing::trace!("executed command: {}: success={}", spec.command, status.success());

        Ok(ExecutionResult {
            status: Some(status),
            stdout,
            stderr,
        })
    }
}

/// A queued, by-regex result for [`MockCommandExecutor`], mirroring the
/// `set_process_result`/`get_process_result` regex-keyed queue pattern.
pub struct QueuedResult {
    pub returncode: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Test executor: records every invocation into a shared [`RunLog`] and
/// replays a queue of results keyed by regex against the rendered command
/// line, falling back to a successful no-op result.
pub struct MockCommandExecutor {
    pub log: Arc<Mutex<RunLog>>,
    queue: Mutex<Vec<(regex::Regex, QueuedResult)>>,
}

impl MockCommandExecutor {
    pub fn new(log: Arc<Mutex<RunLog>>) -> Self {
        Self {
            log,
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_result(&self, pattern: &str, result: QueuedResult) {
        let re = regex::Regex::new(pattern).expect("valid regex");
        self.queue.lock().unwrap().push((re, result));
    }
}

impl CommandExecutor for MockCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let rendered = spec.display_args();
        self.log.lock().unwrap().append(&rendered);

        let mut queue = self.queue.lock().unwrap();
        if let Some(idx) = queue.iter().position(|(re, _)| re.is_match(&rendered)) {
            let (_, result) = queue.remove(idx);
            return Ok(ExecutionResult {
                status: Some(exit_status_from_code(result.returncode)),
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }

        Ok(ExecutionResult {
            status: Some(exit_status_from_code(0)),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

#[cfg(unix)]
fn exit_status_from_code(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

#[cfg(not(unix))]
fn exit_status_from_code(code: i32) -> ExitStatus {
    // Best-effort fallback; monci only targets unix hosts.
    std::process::Command::new("true").status().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_spec_display_args() {
        let spec = CommandSpec::new("apt-get", vec!["update".into()]);
        assert_eq!(spec.display_args(), "apt-get update");
    }

    #[test]
    fn execution_result_success_true_when_status_none() {
        let result = ExecutionResult {
            status: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert!(result.success());
        assert_eq!(result.code(), None);
    }

    #[test]
    fn mock_executor_records_to_runlog() {
        let log = Arc::new(Mutex::new(RunLog::new()));
        let executor = MockCommandExecutor::new(log.clone());
        let spec = CommandSpec::new("dnf", vec!["check-update".into()]);
        let result = executor.execute(&spec).unwrap();
        assert!(result.success());
        log.lock().unwrap().assert_pop_first_exact("dnf check-update").unwrap();
        log.lock().unwrap().assert_empty().unwrap();
    }

    #[test]
    fn mock_executor_replays_queued_result_by_regex() {
        let log = Arc::new(Mutex::new(RunLog::new()));
        let executor = MockCommandExecutor::new(log.clone());
        executor.queue_result(
            "dnf check-update",
            QueuedResult {
                returncode: 100,
                stdout: b"foo".to_vec(),
                stderr: Vec::new(),
            },
        );
        let spec = CommandSpec::new("dnf", vec!["check-update".into()]);
        let result = executor.execute(&spec).unwrap();
        assert_eq!(result.code(), Some(100));
        assert_eq!(result.stdout_string(), "foo");
    }
}
