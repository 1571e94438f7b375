//! # Command Executor
//!
//! Runs one external program to completion on behalf of a remote requester and
//! collects its output.
//!
//! For every invocation the executor:
//! - Spawns the program with stdin closed and both output streams piped
//! - Attaches one reader task per stream; each reads fixed-size chunks, frames
//!   them into trimmed lines and funnels them through a single channel, so the
//!   collected output preserves arrival order across both streams
//! - Races process exit against a wall-clock ceiling; when the ceiling wins the
//!   program's whole process group is killed and the child reaped before the
//!   call returns
//! - Drains both readers (bounded by [`DRAIN_GRACE`]) before returning
//!
//! On Unix every program runs in its own process group, so anything it forks
//! is killed along with it. Captured text is capped at
//! [`MAX_OUTPUT_BYTES`] per run; later lines are discarded and a single
//! `Error` line records the truncation.
//!
//! ```text
//!   spawn ──┬── stdout reader ──┐
//!           │                   ├──▶ line funnel ──▶ Execution.outputs
//!           ├── stderr reader ──┘
//!           └── wait ◀── race ──▶ deadline ──▶ kill + reap
//! ```

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::messages::{OutputLine, OutputStream};

/// Default wall-clock ceiling for one program run.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Size of each read from a child's output pipe.
const READ_CHUNK_SIZE: usize = 1024;

/// A line that grows beyond this without a newline is emitted as-is.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Captured text kept per run, summed over both streams.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How long to wait for the output readers after the process is gone.
///
/// A background process the program left behind can keep the pipes open
/// after the direct child exits; once this elapses the process group is
/// killed and the readers are abandoned.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Errors from running a program.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The process could not be created (missing binary, permissions, ...)
    #[error("error starting {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited with a non-zero status
    #[error("process {pid} exited with {status}")]
    Exited { pid: u32, status: ExitStatus },

    /// The process ran past the ceiling and was killed
    #[error("process {pid} killed after exceeding {timeout:?} execution limit")]
    TimedOut { pid: u32, timeout: Duration },

    /// Waiting on the process failed
    #[error("error waiting for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a program that was started.
#[derive(Debug)]
pub struct Execution {
    /// OS process id of the child
    pub pid: u32,
    /// Captured output in arrival order
    pub outputs: Vec<OutputLine>,
    /// Why the run did not succeed, `None` for a zero exit status
    pub failure: Option<ExecError>,
}

impl Execution {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Something that can run a program for the dispatcher.
///
/// `Err` is reserved for programs that never started; every other outcome is
/// an [`Execution`], possibly carrying a failure.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<Execution, ExecError>;
}

/// Runs programs as local child processes.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    timeout: Duration,
    output_limit: usize,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTION_TIMEOUT)
    }
}

impl CommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            output_limit: MAX_OUTPUT_BYTES,
        }
    }

    /// Caps the captured text of each run at `bytes`.
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `program` with `args` and blocks until it has exited and both of
    /// its output streams are drained.
    pub async fn execute(&self, program: &str, args: &[String]) -> Result<Execution, ExecError> {
        info!("Executing {} {:?}", program, args);

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        let mut child = command.spawn().map_err(|source| ExecError::Start {
            program: program.to_string(),
            source,
        })?;

        // id() is only None once the child has been reaped.
        let pid = child.id().unwrap_or_default();
        debug!("Started {} as pid {}", program, pid);

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let budget = Arc::new(OutputBudget::new(self.output_limit));
        let mut readers = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            let sink = LineSink::new(OutputStream::Info, line_tx.clone(), budget.clone());
            readers.spawn(read_lines(stdout, sink));
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = LineSink::new(OutputStream::Error, line_tx.clone(), budget.clone());
            readers.spawn(read_lines(stderr, sink));
        }
        drop(line_tx);

        let failure = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => None,
            Ok(Ok(status)) => Some(ExecError::Exited { pid, status }),
            Ok(Err(source)) => Some(ExecError::Wait { pid, source }),
            Err(_) => {
                warn!(
                    "Process {} exceeded {:?} execution limit, killing it",
                    pid, self.timeout
                );
                kill_and_reap(&mut child, pid).await;
                Some(ExecError::TimedOut {
                    pid,
                    timeout: self.timeout,
                })
            }
        };

        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while readers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Output streams of process {} still open after {:?}, killing its process group",
                pid, DRAIN_GRACE
            );
            kill_group(pid);
            readers.abort_all();
        }

        let mut outputs = Vec::new();
        while let Ok(line) = line_rx.try_recv() {
            outputs.push(line);
        }
        if budget.exhausted() {
            warn!(
                "Output of process {} exceeded {} bytes and was truncated",
                pid, self.output_limit
            );
            outputs.push(OutputLine::error(format!(
                "output truncated after {} bytes",
                self.output_limit
            )));
        }

        match &failure {
            None => info!("Process {} completed successfully", pid),
            Some(e) => warn!("Process {} failed: {}", pid, e),
        }

        Ok(Execution {
            pid,
            outputs,
            failure,
        })
    }
}

#[async_trait]
impl CommandRunner for CommandExecutor {
    async fn run(&self, program: &str, args: &[String]) -> Result<Execution, ExecError> {
        self.execute(program, args).await
    }
}

/// Sends SIGKILL to every process in the group led by `pid`.
///
/// The child was spawned with `process_group(0)`, so its pid is the group id.
fn kill_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return;
        };
        if pgid <= 0 {
            return;
        }
        // SAFETY: kill(2) with a negative pid signals the process group; a
        // group that no longer exists yields ESRCH, which is ignored.
        let result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
        if result != 0 {
            debug!(
                "Killing process group {}: {}",
                pgid,
                std::io::Error::last_os_error()
            );
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Kills the program and everything it started, then reaps the child.
async fn kill_and_reap(child: &mut Child, pid: u32) {
    kill_group(pid);
    // kill() signals the child again and then waits, so it is reaped here.
    if let Err(e) = child.kill().await {
        warn!("Failed to kill process {}: {}", pid, e);
    }
}

/// Byte allowance shared by both output streams of one run.
struct OutputBudget {
    remaining: AtomicUsize,
    exhausted: AtomicBool,
}

impl OutputBudget {
    fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Reserves `bytes`; false once the allowance cannot cover them.
    fn take(&self, bytes: usize) -> bool {
        let taken = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                left.checked_sub(bytes)
            })
            .is_ok();
        if !taken {
            self.exhausted.store(true, Ordering::Release);
        }
        taken
    }

    fn exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }
}

/// Where one reader delivers its lines.
struct LineSink {
    stream: OutputStream,
    tx: mpsc::UnboundedSender<OutputLine>,
    budget: Arc<OutputBudget>,
}

impl LineSink {
    fn new(
        stream: OutputStream,
        tx: mpsc::UnboundedSender<OutputLine>,
        budget: Arc<OutputBudget>,
    ) -> Self {
        Self { stream, tx, budget }
    }

    fn emit(&self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if text.is_empty() || self.budget.exhausted() || !self.budget.take(text.len()) {
            return;
        }
        let _ = self.tx.send(OutputLine {
            stream: self.stream,
            text: text.to_string(),
        });
    }
}

/// Reads one output pipe until it closes, sending each trimmed line.
///
/// The pipe is read to the end even after the output budget is spent so the
/// program never blocks on a full pipe.
async fn read_lines<R>(mut pipe: R, sink: LineSink)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("{} stream read failed: {}", sink.stream, e);
                break;
            }
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            sink.emit(&line);
        }
        if pending.len() >= MAX_LINE_BYTES {
            let cut = char_boundary(&pending);
            let line: Vec<u8> = pending.drain(..cut).collect();
            sink.emit(&line);
        }
    }

    sink.emit(&pending);
}

/// Length of the longest prefix of `bytes` that does not end inside a UTF-8
/// sequence.
fn char_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in (len.saturating_sub(4)..len).rev() {
        let b = bytes[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = match b {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            _ => 4,
        };
        return if i + width > len { i } else { len };
    }
    len
}
