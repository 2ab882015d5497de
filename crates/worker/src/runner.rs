//! Process Runner: spawn, stream, wait, terminate.
//!
//! Each run is spawned in its own process group so termination reaches
//! everything the automation tool forks. Output flows through two stages
//! per stream:
//!
//! 1. A reader task splits the pipe into lines, keeps a capped copy for the
//!    outcome and sends each line into a bounded channel.
//! 2. A forwarder task drains that channel in order, hands every line to
//!    the [`OutputSink`] and feeds the shared [`ProgressEstimator`].
//!
//! Both tasks are joined with a deadline once the process exits, so a
//! grandchild that keeps the pipe open cannot wedge the worker.
//!
//! The [`ProcessRegistry`] maps job ids to live processes. It is shared
//! with the revoke listener, which terminates processes by job id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opsdeck_core::progress::{phase_label, ProgressEstimator};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lines longer than this are cut and marked.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Maximum stdout or stderr size kept in the [`RunOutcome`] (10 MiB).
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// SIGTERM to SIGKILL grace period.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How long output tasks may take to drain after the process exits.
pub const DEFAULT_READER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code reported for runs killed by the wall-clock limit.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported for runs stopped by [`ProcessRunner::terminate`].
pub const TERMINATED_EXIT_CODE: i32 = -15;

const TRUNCATION_MARKER: &str = "... [truncated]";
const LINE_CHANNEL_CAPACITY: usize = 256;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Destination for a run's output.
///
/// Calls for one stream arrive in output order. Implementations handle
/// their own errors; the runner never stops because a sink failed.
#[async_trait]
pub trait OutputSink: Send + Sync + 'static {
    async fn on_line(&self, stream: OutputStream, line: &str);

    /// Called only when the estimate advanced.
    async fn on_progress(&self, progress: u8, step: Option<String>);
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Job {0} already has a running process")]
    AlreadyRunning(String),

    #[error("Runner is shutting down")]
    ShuttingDown,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for process: {0}")]
    Wait(#[from] std::io::Error),
}

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job_id: String,
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub working_directory: PathBuf,
    /// Additional environment variables set for the child process.
    pub env_vars: Vec<(String, String)>,
}

/// Why the process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Real exit code, `-signal` when killed by a signal, or the synthetic
    /// [`TIMEOUT_EXIT_CODE`] / [`TERMINATED_EXIT_CODE`].
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub termination: Termination,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// ProcessRegistry
// ---------------------------------------------------------------------------

struct RegisteredProcess {
    pid: Option<u32>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    processes: HashMap<String, RegisteredProcess>,
    closed: bool,
}

/// Job id → live process. At most one entry per job id.
///
/// Once closed, no new process can be reserved.
#[derive(Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reserve(&self, job_id: &str, cancel: CancellationToken) -> Result<(), RunnerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RunnerError::ShuttingDown);
        }
        if state.processes.contains_key(job_id) {
            return Err(RunnerError::AlreadyRunning(job_id.to_string()));
        }
        state
            .processes
            .insert(job_id.to_string(), RegisteredProcess { pid: None, cancel });
        Ok(())
    }

    fn set_pid(&self, job_id: &str, pid: Option<u32>) {
        if let Some(entry) = self.lock().processes.get_mut(job_id) {
            entry.pid = pid;
        }
    }

    fn remove(&self, job_id: &str) {
        self.lock().processes.remove(job_id);
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().processes.contains_key(job_id)
    }

    pub fn pid(&self, job_id: &str) -> Option<u32> {
        self.lock().processes.get(job_id).and_then(|p| p.pid)
    }

    /// Job ids with a live process, sorted.
    pub fn running_jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = self.lock().processes.keys().cloned().collect();
        jobs.sort();
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().processes.is_empty()
    }

    /// Ask the owner of `job_id` to terminate it. Returns `false` when the
    /// job has no process or termination was already requested.
    pub fn request_termination(&self, job_id: &str) -> bool {
        match self.lock().processes.get(job_id) {
            Some(process) if !process.cancel.is_cancelled() => {
                process.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Request termination of every process. Returns how many were asked.
    pub fn terminate_all(&self) -> usize {
        Self::cancel_all(&self.lock())
    }

    /// Refuse new reservations, then terminate every process. Both happen
    /// under one lock, so no process can slip in between.
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        Self::cancel_all(&state)
    }

    fn cancel_all(state: &RegistryState) -> usize {
        let mut requested = 0;
        for process in state.processes.values() {
            if !process.cancel.is_cancelled() {
                process.cancel.cancel();
                requested += 1;
            }
        }
        requested
    }
}

/// Removes the registry entry when the run is finished or abandoned.
struct Registration {
    registry: Arc<ProcessRegistry>,
    job_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.job_id);
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

struct StreamPipeline {
    stream: OutputStream,
    reader: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    captured: Arc<Mutex<String>>,
}

/// A started process. Pass it to [`ProcessRunner::wait`].
pub struct RunHandle {
    job_id: String,
    pid: Option<u32>,
    child: Child,
    cancel: CancellationToken,
    started: Instant,
    stdout: StreamPipeline,
    stderr: StreamPipeline,
    registration: Registration,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("job_id", &self.job_id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ProcessRunner {
    registry: Arc<ProcessRegistry>,
    grace_period: Duration,
    reader_join_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self {
            registry,
            grace_period: DEFAULT_GRACE_PERIOD,
            reader_join_timeout: DEFAULT_READER_JOIN_TIMEOUT,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_reader_join_timeout(mut self, timeout: Duration) -> Self {
        self.reader_join_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Spawn the process and start streaming its output into `sink`.
    pub fn start(
        &self,
        request: RunRequest,
        sink: Arc<dyn OutputSink>,
    ) -> Result<RunHandle, RunnerError> {
        let Some((program, args)) = request.argv.split_first() else {
            return Err(RunnerError::EmptyCommand);
        };

        let cancel = CancellationToken::new();
        self.registry.reserve(&request.job_id, cancel.clone())?;
        let registration = Registration {
            registry: Arc::clone(&self.registry),
            job_id: request.job_id.clone(),
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.env_vars {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        self.registry.set_pid(&request.job_id, pid);

        let estimator = Arc::new(ProgressEstimator::default());
        let stdout = spawn_pipeline(
            child.stdout.take(),
            OutputStream::Stdout,
            Arc::clone(&sink),
            Arc::clone(&estimator),
        );
        let stderr = spawn_pipeline(child.stderr.take(), OutputStream::Stderr, sink, estimator);

        tracing::info!(job_id = %request.job_id, pid, program = %program, "Process started");

        Ok(RunHandle {
            job_id: request.job_id,
            pid,
            child,
            cancel,
            started: Instant::now(),
            stdout,
            stderr,
            registration,
        })
    }

    /// Wait for the process to exit, time out or be terminated.
    ///
    /// The registry entry is gone by the time this returns.
    pub async fn wait(
        &self,
        mut handle: RunHandle,
        timeout: Option<Duration>,
    ) -> Result<RunOutcome, RunnerError> {
        let result = self.wait_for_exit(&mut handle, timeout).await;
        let duration_ms = handle.started.elapsed().as_millis() as u64;
        drop(handle.registration);

        let (exit_code, termination) = match result {
            Ok(exit) => exit,
            Err(e) => {
                for pipeline in [&handle.stdout, &handle.stderr] {
                    pipeline.reader.abort();
                    pipeline.forwarder.abort();
                }
                return Err(e);
            }
        };

        let deadline = tokio::time::Instant::now() + self.reader_join_timeout;
        let stdout = join_pipeline(handle.stdout, deadline, &handle.job_id).await;
        let stderr = join_pipeline(handle.stderr, deadline, &handle.job_id).await;

        tracing::info!(
            job_id = %handle.job_id,
            exit_code,
            termination = ?termination,
            duration_ms,
            "Process finished",
        );

        Ok(RunOutcome {
            exit_code,
            stdout,
            stderr,
            duration_ms,
            termination,
        })
    }

    /// [`start`](Self::start) followed by [`wait`](Self::wait).
    pub async fn run(
        &self,
        request: RunRequest,
        sink: Arc<dyn OutputSink>,
        timeout: Option<Duration>,
    ) -> Result<RunOutcome, RunnerError> {
        let handle = self.start(request, sink)?;
        self.wait(handle, timeout).await
    }

    /// Request termination of the process running `job_id`.
    ///
    /// Returns `false` when no such process is registered or it is already
    /// being terminated. The owning `wait` performs SIGTERM, the grace
    /// period and SIGKILL.
    pub fn terminate(&self, job_id: &str) -> bool {
        let requested = self.registry.request_termination(job_id);
        if requested {
            tracing::info!(job_id, "Termination requested");
        }
        requested
    }

    /// Request termination of every running process.
    pub fn terminate_all(&self) -> usize {
        self.registry.terminate_all()
    }

    /// Terminate every running process and refuse new ones from now on.
    pub fn shutdown(&self) -> usize {
        self.registry.close()
    }

    async fn wait_for_exit(
        &self,
        handle: &mut RunHandle,
        timeout: Option<Duration>,
    ) -> Result<(i32, Termination), RunnerError> {
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let termination = tokio::select! {
            biased;
            status = handle.child.wait() => {
                return Ok((exit_code(status?), Termination::Exited));
            }
            _ = handle.cancel.cancelled() => Termination::Terminated,
            _ = &mut deadline => Termination::TimedOut,
        };

        match termination {
            Termination::TimedOut => tracing::warn!(
                job_id = %handle.job_id,
                timeout_secs = timeout.map(|t| t.as_secs()),
                "Process timed out",
            ),
            _ => tracing::info!(job_id = %handle.job_id, "Terminating process"),
        }

        terminate_process_group(&mut handle.child, self.grace_period).await;

        let code = match termination {
            Termination::TimedOut => TIMEOUT_EXIT_CODE,
            _ => TERMINATED_EXIT_CODE,
        };
        Ok((code, termination))
    }
}

// ---------------------------------------------------------------------------
// Output pipelines
// ---------------------------------------------------------------------------

fn spawn_pipeline<R>(
    pipe: Option<R>,
    stream: OutputStream,
    sink: Arc<dyn OutputSink>,
    estimator: Arc<ProgressEstimator>,
) -> StreamPipeline
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
    let captured = Arc::new(Mutex::new(String::new()));

    let reader_captured = Arc::clone(&captured);
    let reader = tokio::spawn(async move {
        let Some(pipe) = pipe else {
            return;
        };
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        let mut forwarding = true;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = normalize_line(&buf);
                    capture(&reader_captured, &line);
                    // Keep draining after the forwarder is gone so the
                    // child never blocks on a full pipe.
                    if forwarding && tx.send(line).await.is_err() {
                        forwarding = false;
                    }
                }
                Err(e) => {
                    tracing::warn!(stream = stream.as_str(), error = %e, "Error reading process output");
                    break;
                }
            }
        }
    });

    let forwarder = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            sink.on_line(stream, &line).await;
            if let Some(progress) = estimator.observe(&line) {
                sink.on_progress(progress, phase_label(&line)).await;
            }
        }
    });

    StreamPipeline {
        stream,
        reader,
        forwarder,
        captured,
    }
}

/// Join both tasks of a pipeline by `deadline`; abort whatever is left.
async fn join_pipeline(
    pipeline: StreamPipeline,
    deadline: tokio::time::Instant,
    job_id: &str,
) -> String {
    let StreamPipeline {
        stream,
        mut reader,
        mut forwarder,
        captured,
    } = pipeline;

    if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
        tracing::warn!(job_id, stream = stream.as_str(), "Output reader did not finish, aborting");
        reader.abort();
    }
    if tokio::time::timeout_at(deadline, &mut forwarder).await.is_err() {
        tracing::warn!(job_id, stream = stream.as_str(), "Output forwarder did not finish, aborting");
        forwarder.abort();
    }

    let mut captured = captured.lock().unwrap_or_else(|e| e.into_inner());
    std::mem::take(&mut *captured)
}

/// Decode one raw line: lossy UTF-8, no line terminator, length-capped.
fn normalize_line(raw: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(raw)
        .trim_end_matches(['\n', '\r'])
        .to_string();

    if line.len() > MAX_LINE_LENGTH {
        let mut cut = MAX_LINE_LENGTH;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
        line.push_str(TRUNCATION_MARKER);
    }
    line
}

fn capture(captured: &Mutex<String>, line: &str) {
    let mut captured = captured.lock().unwrap_or_else(|e| e.into_inner());
    if captured.len() + line.len() < MAX_OUTPUT_BYTES {
        captured.push_str(line);
        captured.push('\n');
    }
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Terminate a process group gracefully.
///
/// 1. Send SIGTERM to the process group.
/// 2. Poll for exit until the grace period runs out.
/// 3. Send SIGKILL if still running.
/// 4. Reap the process.
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return; // Already exited
    };

    signal_group(pid, libc::SIGTERM);

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.try_wait().ok().flatten().is_some() {
            return;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    tracing::warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
    signal_group(pid, libc::SIGKILL);

    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the
    // process group created at spawn.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, signal, error = %err, "Failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_terminators() {
        assert_eq!(normalize_line(b"hello\r\n"), "hello");
        assert_eq!(normalize_line(b"no newline"), "no newline");
        assert_eq!(normalize_line(b"\n"), "");
    }

    #[test]
    fn normalize_truncates_long_lines() {
        let raw = vec![b'x'; MAX_LINE_LENGTH + 10];
        let line = normalize_line(&raw);
        assert!(line.ends_with(TRUNCATION_MARKER));
        assert_eq!(line.len(), MAX_LINE_LENGTH + TRUNCATION_MARKER.len());
    }

    #[test]
    fn normalize_truncates_on_char_boundary() {
        let mut raw = vec![b'a'; MAX_LINE_LENGTH - 1];
        raw.extend_from_slice("é".as_bytes());
        raw.extend_from_slice(b"tail");
        let line = normalize_line(&raw);
        assert!(line.starts_with('a'));
        assert!(line.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn registry_rejects_second_reservation() {
        let registry = ProcessRegistry::new();
        registry
            .reserve("j1", CancellationToken::new())
            .expect("first reservation");
        let err = registry
            .reserve("j1", CancellationToken::new())
            .expect_err("second reservation");
        assert!(matches!(err, RunnerError::AlreadyRunning(ref id) if id == "j1"));

        registry.remove("j1");
        assert!(registry.is_empty());
    }

    #[test]
    fn termination_is_requested_once() {
        let registry = ProcessRegistry::new();
        let token = CancellationToken::new();
        registry.reserve("j1", token.clone()).expect("reserve");

        assert!(registry.request_termination("j1"));
        assert!(token.is_cancelled());
        assert!(!registry.request_termination("j1"));
        assert!(!registry.request_termination("unknown"));
    }

    #[test]
    fn terminate_all_counts_live_processes() {
        let registry = ProcessRegistry::new();
        registry.reserve("a", CancellationToken::new()).expect("reserve");
        registry.reserve("b", CancellationToken::new()).expect("reserve");
        registry.request_termination("a");

        assert_eq!(registry.terminate_all(), 1);
        assert_eq!(registry.running_jobs(), vec!["a", "b"]);
    }

    #[test]
    fn closed_registry_refuses_reservations() {
        let registry = ProcessRegistry::new();
        let token = CancellationToken::new();
        registry.reserve("a", token.clone()).expect("reserve");

        assert_eq!(registry.close(), 1);
        assert!(token.is_cancelled());

        let err = registry
            .reserve("b", CancellationToken::new())
            .expect_err("closed");
        assert!(matches!(err, RunnerError::ShuttingDown));
        assert_eq!(registry.running_jobs(), vec!["a"]);
    }

    #[test]
    fn exit_codes() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
            assert_eq!(exit_code(ExitStatus::from_raw(2 << 8)), 2);
            assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), -9);
        }
    }
}
