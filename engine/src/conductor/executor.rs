//! Artifact executor
//!
//! Runs one artifact in its own working directory under a hard wall-clock
//! deadline. With `safety.sandbox_enabled` the child also gets a cleared
//! environment and its own process group, so a timeout kills everything the
//! artifact spawned, not just the interpreter. The group is killed again once
//! the interpreter exits, so nothing started in the background outlives the
//! step.
//!
//! Before running, the artifact goes through `execution.syntax_check` (for
//! Python, `python3 -m py_compile`). A rejected artifact never runs.
//!
//! Captured output is bounded twice: per stream by `max_output_lines` and
//! `max_output_bytes` (the newest output is kept), and per line by
//! [`MAX_LINE_BYTES`] (the head of the line is kept).
//!
//! The executor never blocks its caller for longer than
//! `timeout + teardown_grace`: after a kill, output readers get the grace
//! period to drain and are then abandoned.

use anyhow::{Context, Result};
use sdk::types::{ExecutionResult, Outcome};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::ExecutionConfig;

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Longest line kept from an output stream
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// One attempt to run a step's artifact
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub step_id: String,
    pub sequence_index: u32,
    pub attempt_number: u32,
    pub artifact: String,
}

#[derive(Debug, Clone, Copy)]
struct CaptureLimits {
    max_lines: usize,
    max_bytes: usize,
}

/// Bounded capture of one output stream, keeping the newest lines
#[derive(Debug, Default)]
struct StreamCapture {
    lines: VecDeque<String>,
    bytes: usize,
    dropped: usize,
}

impl StreamCapture {
    /// The newest line is always kept, even when it alone exceeds the byte limit
    fn push(&mut self, line: String, limits: CaptureLimits) {
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.lines.len() > limits.max_lines
            || (self.bytes > limits.max_bytes && self.lines.len() > 1)
        {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
                self.dropped += 1;
            }
        }
    }

    fn render(&self) -> String {
        let body = self.lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if self.dropped > 0 {
            format!("... (truncated {} lines)\n{}", self.dropped, body)
        } else {
            body
        }
    }
}

type SharedCapture = Arc<Mutex<StreamCapture>>;

pub struct Executor {
    config: ExecutionConfig,
    sandbox_enabled: bool,
}

impl Executor {
    pub fn new(config: ExecutionConfig, sandbox_enabled: bool) -> Self {
        Self {
            config,
            sandbox_enabled,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Working directory of one step
    pub fn step_dir(&self, task_id: &str, sequence_index: u32) -> PathBuf {
        self.config
            .sandbox_dir
            .join(task_id)
            .join(format!("step_{}", sequence_index + 1))
    }

    /// File name the artifact is written to
    pub fn artifact_file_name(&self) -> String {
        format!("main.{}", self.config.artifact_extension)
    }

    /// Run an artifact and capture the outcome
    ///
    /// A failure to start the interpreter is reported as an `Exception`
    /// result so it goes through classification like any other failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory or artifact file cannot be
    /// written, or if waiting on the child fails.
    #[instrument(skip_all, fields(task_id = %request.task_id, step_id = %request.step_id, attempt = request.attempt_number))]
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let work_dir = self.step_dir(&request.task_id, request.sequence_index);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("Failed to create sandbox dir {}", work_dir.display()))?;

        let file_name = self.artifact_file_name();
        let artifact_path = work_dir.join(&file_name);
        tokio::fs::write(&artifact_path, &request.artifact)
            .await
            .with_context(|| format!("Failed to write artifact {}", artifact_path.display()))?;

        let timeout = self.timeout();
        let limits = CaptureLimits {
            max_lines: self.config.max_output_lines.max(1),
            max_bytes: self.config.max_output_bytes.max(1),
        };
        let started = Instant::now();

        if let Some(rejected) = self.check_syntax(&work_dir, &file_name, limits).await {
            info!("Artifact rejected by syntax check");
            return Ok(ExecutionResult {
                step_id: request.step_id.clone(),
                attempt_number: request.attempt_number,
                stdout: String::new(),
                stderr: rejected.stderr,
                exit_code: rejected.exit_code,
                exit_signal: None,
                duration_ms: started.elapsed().as_millis() as u64,
                outcome: Outcome::Exception,
            });
        }

        // The check and the run share one deadline
        let remaining = timeout.saturating_sub(started.elapsed());
        let mut cmd = self.command(&work_dir, &file_name);
        info!(
            "Running {} {} (timeout {}s)",
            self.config.interpreter,
            artifact_path.display(),
            timeout.as_secs()
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start interpreter {}: {}", self.config.interpreter, e);
                return Ok(ExecutionResult {
                    step_id: request.step_id.clone(),
                    attempt_number: request.attempt_number,
                    stdout: String::new(),
                    stderr: format!(
                        "Failed to start interpreter '{}': {}",
                        self.config.interpreter, e
                    ),
                    exit_code: None,
                    exit_signal: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    outcome: Outcome::Exception,
                });
            }
        };

        let stdout_capture = SharedCapture::default();
        let stderr_capture = SharedCapture::default();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&stdout_capture), limits));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&stderr_capture), limits));
        }

        let pid = child.id();
        let (status, timed_out) = match tokio::time::timeout(remaining, child.wait()).await {
            Ok(status) => (status.context("Failed to wait for artifact process")?, false),
            Err(_) => {
                warn!("Artifact exceeded {}s, killing", timeout.as_secs());
                self.kill(&mut child, pid);
                let status = child
                    .wait()
                    .await
                    .context("Failed to reap artifact process after kill")?;
                (status, true)
            }
        };

        // Background jobs of a finished artifact share its process group
        self.kill_leftovers(pid);
        self.join_readers(readers).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = if timed_out {
            Outcome::Timeout
        } else if status.success() {
            Outcome::Success
        } else {
            Outcome::Exception
        };

        debug!(exit_code = ?status.code(), timed_out, duration_ms, "artifact finished");

        Ok(ExecutionResult {
            step_id: request.step_id.clone(),
            attempt_number: request.attempt_number,
            stdout: render(&stdout_capture),
            stderr: render(&stderr_capture),
            exit_code: status.code(),
            exit_signal: exit_signal(&status),
            duration_ms,
            outcome,
        })
    }

    /// Run the configured syntax check, returning the rejection if any
    ///
    /// A checker that cannot be started is skipped with a warning. One that
    /// outlives the deadline is abandoned, which leaves the run no time.
    async fn check_syntax(
        &self,
        work_dir: &Path,
        file_name: &str,
        limits: CaptureLimits,
    ) -> Option<SyntaxRejection> {
        let (program, args) = self.config.syntax_check.split_first()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(file_name)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        self.isolate(&mut cmd, work_dir);

        let output = match tokio::time::timeout(self.timeout(), cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Syntax check {} unavailable, skipping: {}", program, e);
                return None;
            }
            Err(_) => {
                warn!("Syntax check {} timed out, abandoning it", program);
                return None;
            }
        };
        if output.status.success() {
            return None;
        }

        let mut capture = StreamCapture::default();
        for bytes in [&output.stderr, &output.stdout] {
            for line in String::from_utf8_lossy(bytes).lines() {
                capture.push(line.to_string(), limits);
            }
        }
        Some(SyntaxRejection {
            stderr: capture.render(),
            exit_code: output.status.code(),
        })
    }

    fn command(&self, work_dir: &Path, file_name: &str) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(file_name)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.isolate(&mut cmd, work_dir);
        cmd
    }

    fn isolate(&self, cmd: &mut Command, work_dir: &Path) {
        if self.sandbox_enabled {
            let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
            cmd.env_clear()
                .env("PATH", path)
                .env("HOME", work_dir)
                .env("TMPDIR", work_dir)
                .env("LANG", "C.UTF-8")
                .env("PYTHONDONTWRITEBYTECODE", "1");

            #[cfg(unix)]
            {
                cmd.process_group(0);
            }
        }
    }

    /// Kill whatever is left in the artifact's process group
    ///
    /// Without the sandbox the artifact shares our group and nothing is done.
    fn kill_leftovers(&self, pid: Option<u32>) {
        #[cfg(unix)]
        {
            if let (true, Some(pid)) = (self.sandbox_enabled, pid) {
                use nix::errno::Errno;
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;

                match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) => debug!("Killed leftover processes in group {}", pid),
                    Err(Errno::ESRCH) => {}
                    Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
                }
            }
        }

        #[cfg(not(unix))]
        let _ = pid;
    }

    /// Forced termination; generated code gets no chance to clean up
    fn kill(&self, child: &mut tokio::process::Child, pid: Option<u32>) {
        #[cfg(unix)]
        {
            if let (true, Some(pid)) = (self.sandbox_enabled, pid) {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;

                match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) => return,
                    Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
                }
            }
        }

        #[cfg(not(unix))]
        let _ = pid;

        if let Err(e) = child.start_kill() {
            warn!("Failed to kill artifact process: {}", e);
        }
    }

    /// Wait for output readers, abandoning them after the grace period
    ///
    /// A grandchild outside the process group can hold a pipe open forever.
    async fn join_readers(&self, readers: Vec<JoinHandle<()>>) {
        let grace = Duration::from_millis(self.config.teardown_grace_ms);
        let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();

        if tokio::time::timeout(grace, futures::future::join_all(readers))
            .await
            .is_err()
        {
            warn!(
                "Output readers still open after {}ms, abandoning them",
                grace.as_millis()
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

struct SyntaxRejection {
    stderr: String,
    exit_code: Option<i32>,
}

fn spawn_reader<R>(stream: R, capture: SharedCapture, limits: CaptureLimits) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let push = |line: String| {
            let mut capture = capture.lock().unwrap_or_else(|e| e.into_inner());
            capture.push(line, limits);
        };
        if let Err(e) = read_lines(&mut reader, MAX_LINE_BYTES, push).await {
            debug!("Output stream closed with error: {}", e);
        }
    })
}

/// Split a stream into lines, never buffering more than `max_line` bytes
///
/// Bytes past `max_line` are discarded and counted in a marker at the end
/// of the line.
async fn read_lines<R, F>(reader: &mut R, max_line: usize, mut push: F) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(String),
{
    let mut line: Vec<u8> = Vec::new();
    let mut cut = 0usize;

    let finish = |line: &mut Vec<u8>, cut: &mut usize| {
        let mut text = String::from_utf8_lossy(&line[..])
            .trim_end_matches('\r')
            .to_string();
        if *cut > 0 {
            text.push_str(&format!(" ... (cut {} bytes)", cut));
        }
        line.clear();
        *cut = 0;
        text
    };

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if !line.is_empty() || cut > 0 {
                push(finish(&mut line, &mut cut));
            }
            return Ok(());
        }

        let (segment_len, newline) = match chunk.iter().position(|b| *b == b'\n') {
            Some(i) => (i, true),
            None => (chunk.len(), false),
        };
        let take = max_line.saturating_sub(line.len()).min(segment_len);
        line.extend_from_slice(&chunk[..take]);
        cut += segment_len - take;

        reader.consume(segment_len + usize::from(newline));
        if newline {
            push(finish(&mut line, &mut cut));
        }
    }
}

fn render(capture: &SharedCapture) -> String {
    capture.lock().unwrap_or_else(|e| e.into_inner()).render()
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_lines: usize, max_bytes: usize) -> CaptureLimits {
        CaptureLimits {
            max_lines,
            max_bytes,
        }
    }

    #[test]
    fn test_capture_keeps_newest_lines() {
        let mut capture = StreamCapture::default();
        for i in 0..5 {
            capture.push(format!("line {}", i), limits(2, 1024));
        }
        assert_eq!(capture.render(), "... (truncated 3 lines)\nline 3\nline 4");
    }

    #[test]
    fn test_capture_without_truncation() {
        let mut capture = StreamCapture::default();
        capture.push("only".to_string(), limits(10, 1024));
        assert_eq!(capture.render(), "only");
    }

    #[test]
    fn test_capture_respects_byte_limit() {
        let mut capture = StreamCapture::default();
        for i in 0..10 {
            capture.push(format!("{:0>10}", i), limits(100, 25));
        }
        assert_eq!(
            capture.render(),
            "... (truncated 8 lines)\n0000000008\n0000000009"
        );

        // A single oversized line is still kept
        let mut capture = StreamCapture::default();
        capture.push("x".repeat(50), limits(100, 25));
        assert_eq!(capture.render().len(), 50);
    }

    #[tokio::test]
    async fn test_read_lines_cuts_long_lines() {
        let input = format!("short\r\n{}\ntail", "y".repeat(100));
        let mut reader = BufReader::with_capacity(8, input.as_bytes());
        let mut lines = Vec::new();
        read_lines(&mut reader, 16, |line| lines.push(line))
            .await
            .unwrap();

        assert_eq!(
            lines,
            vec![
                "short".to_string(),
                format!("{} ... (cut 84 bytes)", "y".repeat(16)),
                "tail".to_string(),
            ]
        );
    }

    #[test]
    fn test_step_dir_layout() {
        let executor = Executor::new(
            ExecutionConfig {
                sandbox_dir: PathBuf::from("/tmp/sandbox"),
                artifact_extension: "sh".to_string(),
                ..ExecutionConfig::default()
            },
            true,
        );
        assert_eq!(
            executor.step_dir("task-1", 0),
            PathBuf::from("/tmp/sandbox/task-1/step_1")
        );
        assert_eq!(executor.artifact_file_name(), "main.sh");
    }
}
