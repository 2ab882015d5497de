//! Execution Orchestrator: one attempt of one job.
//!
//! Manages the lifecycle of an attempt:
//! 1. Load the job and stop early if it was revoked.
//! 2. Validate the target descriptor and materialize inputs into a
//!    per-job work directory.
//! 3. Mark the job `STARTED`.
//! 4. Build the command line.
//! 5. Run the process, streaming output into the job log.
//! 6. Parse the run summary.
//! 7. Record `SUCCESS`, or return the failure to the retry driver.
//!
//! The work directory is removed when the attempt ends, whatever the
//! outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opsdeck_core::command::{build_command, PlaybookPaths};
use opsdeck_core::job::{JobStatus, JobUpdate};
use opsdeck_core::progress::PROGRESS_COMPLETE;
use opsdeck_core::retry::FailureKind;
use opsdeck_core::summary::parse_recap;
use opsdeck_core::target::TargetDescriptor;
use opsdeck_store::{JobTracker, StoreError};
use serde_json::{json, Value};

use crate::config::WorkerConfig;
use crate::runner::{
    OutputSink, OutputStream, ProcessRunner, RunOutcome, RunRequest, RunnerError, Termination,
};

/// Lines of stderr kept in results and error messages.
const STDERR_TAIL_LINES: usize = 20;

const INVENTORY_FILE: &str = "inventory.ini";

/// Environment for every run: line-buffered output, no color codes.
const RUN_ENV: [(&str, &str); 3] = [
    ("PYTHONUNBUFFERED", "1"),
    ("ANSIBLE_FORCE_COLOR", "0"),
    ("ANSIBLE_NOCOLOR", "1"),
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    #[error("Playbook exited with code {exit_code}: {stderr_tail}")]
    Failed { exit_code: i32, stderr_tail: String },

    #[error("Playbook timed out after {0}s")]
    TimedOut(u64),

    #[error("Job was revoked")]
    Cancelled,

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutionError {
    /// Input for the retry policy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Cancelled => FailureKind::Cancelled,
            Self::NotFound(_) | Self::InvalidInput(_) => FailureKind::InvalidInput(self.to_string()),
            Self::Failed {
                exit_code,
                stderr_tail,
            } => FailureKind::ProcessExit {
                exit_code: *exit_code,
                stderr: stderr_tail.clone(),
            },
            Self::TimedOut(_) => FailureKind::TimedOut,
            Self::Runner(RunnerError::Spawn { source, .. }) | Self::Io(source)
                if is_resource_exhaustion(source) =>
            {
                FailureKind::ResourceExhausted(self.to_string())
            }
            Self::Runner(RunnerError::EmptyCommand) => FailureKind::InvalidInput(self.to_string()),
            Self::Runner(_) | Self::Store(_) | Self::Io(_) => {
                FailureKind::Infrastructure(self.to_string())
            }
        }
    }

    /// Short machine-readable code, sent with `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Failed { .. } => "PLAYBOOK_FAILED",
            Self::TimedOut(_) => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
            Self::Runner(_) => "RUNNER_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

fn is_resource_exhaustion(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::ENOMEM | libc::EAGAIN | libc::EMFILE | libc::ENFILE | libc::ENOSPC)
        )
    }
    #[cfg(not(unix))]
    {
        err.kind() == std::io::ErrorKind::OutOfMemory
    }
}

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

/// Streams process output into the job log and progress fields.
pub struct TrackerSink {
    tracker: JobTracker,
    job_id: String,
}

impl TrackerSink {
    pub fn new(tracker: JobTracker, job_id: impl Into<String>) -> Self {
        Self {
            tracker,
            job_id: job_id.into(),
        }
    }
}

#[async_trait]
impl OutputSink for TrackerSink {
    async fn on_line(&self, stream: OutputStream, line: &str) {
        if let Err(e) = self.tracker.append_log(&self.job_id, line).await {
            tracing::warn!(
                job_id = %self.job_id,
                stream = stream.as_str(),
                error = %e,
                "Failed to append log line",
            );
        }
    }

    async fn on_progress(&self, progress: u8, step: Option<String>) {
        let mut update = JobUpdate::default().with_progress(progress);
        if let Some(step) = step {
            update = update.with_step(step);
        }
        if let Err(e) = self.tracker.update(&self.job_id, &update).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to record progress");
        }
    }
}

// ---------------------------------------------------------------------------
// Work directory
// ---------------------------------------------------------------------------

/// Per-job scratch directory, removed on drop.
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    fn create(root: &Path, job_id: &str) -> std::io::Result<Self> {
        let path = root.join(job_id);
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove work directory");
            }
        }
    }
}

/// Inventory file listing `hosts` under `[targets]`.
pub fn render_inventory(hosts: &[String]) -> String {
    let mut out = String::from("[targets]\n");
    for host in hosts {
        out.push_str(host);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Settings the orchestrator needs from [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub playbook_bin: String,
    pub playbook_dir: PathBuf,
    pub work_dir: PathBuf,
    pub default_timeout: Duration,
}

impl From<&WorkerConfig> for OrchestratorConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            playbook_bin: config.playbook_bin.clone(),
            playbook_dir: config.playbook_dir.clone(),
            work_dir: config.work_dir.clone(),
            default_timeout: config.job_timeout,
        }
    }
}

/// Inputs resolved for one attempt.
struct PreparedRun {
    argv: Vec<String>,
    timeout: Duration,
    work_dir: WorkDir,
}

pub struct Orchestrator {
    tracker: JobTracker,
    runner: ProcessRunner,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(tracker: JobTracker, runner: ProcessRunner, config: OrchestratorConfig) -> Self {
        Self {
            tracker,
            runner,
            config,
        }
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Run one attempt. On success the job is `SUCCESS` and its result is
    /// returned; every failure is left for the retry driver to record.
    pub async fn execute(&self, job_id: &str) -> Result<Value, ExecutionError> {
        // 1. Load the job.
        let job = self
            .tracker
            .get(job_id)
            .await?
            .ok_or_else(|| ExecutionError::NotFound(job_id.to_string()))?;
        if job.status == JobStatus::Revoked {
            tracing::info!(job_id, "Job revoked before start, skipping");
            return Err(ExecutionError::Cancelled);
        }

        // 2. Validate and materialize inputs.
        let prepared = self.prepare(job_id, &job.target_descriptor)?;

        // 3. Mark started.
        self.tracker
            .update(
                job_id,
                &JobUpdate::status(JobStatus::Started)
                    .with_progress(0)
                    .with_step("Starting playbook"),
            )
            .await?;

        // 4-5. Run the process.
        let request = RunRequest {
            job_id: job_id.to_string(),
            argv: prepared.argv.clone(),
            working_directory: prepared.work_dir.path.clone(),
            env_vars: RUN_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        tracing::info!(job_id, argv = ?prepared.argv, "Running playbook");

        let sink = Arc::new(TrackerSink::new(self.tracker.clone(), job_id));
        let handle = self.runner.start(request, sink)?;

        // A revoke that landed before the process was registered found
        // nothing to terminate.
        if self.tracker.queue().is_revoked(job_id).await? {
            self.runner.terminate(job_id);
        }

        let outcome = self.runner.wait(handle, Some(prepared.timeout)).await?;

        // 6-7. Interpret the outcome.
        self.finish(job_id, outcome, prepared.timeout).await
    }

    fn prepare(&self, job_id: &str, descriptor: &Value) -> Result<PreparedRun, ExecutionError> {
        let descriptor = TargetDescriptor::from_value(descriptor)
            .map_err(|e| ExecutionError::InvalidInput(e.to_string()))?;

        let playbook = self.config.playbook_dir.join(&descriptor.playbook);
        if !playbook.is_file() {
            return Err(ExecutionError::InvalidInput(format!(
                "Playbook '{}' not found",
                descriptor.playbook
            )));
        }

        let work_dir = WorkDir::create(&self.config.work_dir, job_id)?;
        let mut options = descriptor.options.clone();

        let inventory = match &descriptor.inventory {
            Some(name) => {
                let path = self.config.playbook_dir.join(name);
                if !path.is_file() {
                    return Err(ExecutionError::InvalidInput(format!(
                        "Inventory '{name}' not found"
                    )));
                }
                // Listed hosts narrow an existing inventory.
                if options.limit.is_none() && !descriptor.hosts.is_empty() {
                    options.limit = Some(descriptor.hosts.join(","));
                }
                path
            }
            None => {
                let path = work_dir.path.join(INVENTORY_FILE);
                std::fs::write(&path, render_inventory(&descriptor.hosts))?;
                path
            }
        };

        let paths = PlaybookPaths {
            playbook,
            inventory: Some(inventory),
        };
        let argv = build_command(&self.config.playbook_bin, &paths, &options);

        let timeout = options
            .job_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_timeout);

        Ok(PreparedRun {
            argv,
            timeout,
            work_dir,
        })
    }

    async fn finish(
        &self,
        job_id: &str,
        outcome: RunOutcome,
        timeout: Duration,
    ) -> Result<Value, ExecutionError> {
        match outcome.termination {
            Termination::Terminated => return Err(ExecutionError::Cancelled),
            Termination::TimedOut => return Err(ExecutionError::TimedOut(timeout.as_secs())),
            Termination::Exited => {}
        }

        let stderr_tail = tail_lines(&outcome.stderr, STDERR_TAIL_LINES);
        if !outcome.succeeded() {
            return Err(ExecutionError::Failed {
                exit_code: outcome.exit_code,
                stderr_tail,
            });
        }

        let summary = parse_recap(&outcome.stdout);
        let host_count = summary.hosts.len();
        let result = json!({
            "exit_code": outcome.exit_code,
            "summary": summary,
            "duration_ms": outcome.duration_ms,
            "stdout_lines": outcome.stdout.lines().count(),
            "stderr_tail": stderr_tail,
        });

        self.tracker
            .update(
                job_id,
                &JobUpdate::status(JobStatus::Success)
                    .with_progress(PROGRESS_COMPLETE)
                    .with_step("Completed")
                    .with_result(result.clone()),
            )
            .await?;

        tracing::info!(
            job_id,
            duration_ms = outcome.duration_ms,
            hosts = host_count,
            "Playbook succeeded",
        );
        Ok(result)
    }
}

/// The last `n` lines of `text`, joined with newlines.
fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
