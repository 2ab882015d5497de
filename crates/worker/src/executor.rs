//! Retry driver around the [`Orchestrator`].
//!
//! Runs attempts until one succeeds, the failure is terminal, retries run
//! out or the job is revoked. Every failure that escapes an attempt ends
//! up recorded on the job; nothing is left in `STARTED`.
//!
//! On worker shutdown a job whose process never ran goes back on the
//! queue with its retry count; a job whose process was killed fails with
//! `INTERRUPTED`.

use std::sync::Arc;
use std::time::Duration;

use opsdeck_core::job::{JobStatus, JobUpdate};
use opsdeck_core::retry::{FailureKind, RetryPolicy};
use opsdeck_store::{JobTracker, StoreResult};
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{ExecutionError, Orchestrator};
use crate::runner::RunnerError;

/// How often a backoff sleep checks for revocation.
const REVOKE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Final state of a job as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Revoked,
    /// Handed back to the queue because the worker is shutting down.
    Requeued,
    /// Not run: unknown, already finished or already running here.
    Skipped,
}

pub struct JobExecutor {
    orchestrator: Arc<Orchestrator>,
    tracker: JobTracker,
    policy: RetryPolicy,
}

impl JobExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>, tracker: JobTracker, policy: RetryPolicy) -> Self {
        Self {
            orchestrator,
            tracker,
            policy,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Drive `job_id` to a final state, or requeue it when `shutdown` fires
    /// before its process runs.
    pub async fn run(&self, job_id: &str, shutdown: &CancellationToken) -> JobOutcome {
        let mut retries = match self.tracker.get(job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                tracing::info!(job_id, status = %job.status, "Job already finished, skipping");
                return match job.status {
                    JobStatus::Revoked => JobOutcome::Revoked,
                    _ => JobOutcome::Skipped,
                };
            }
            Ok(Some(job)) => job.retry_count,
            Ok(None) => {
                tracing::warn!(job_id, "Dequeued unknown job, skipping");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Could not load job, starting fresh");
                0
            }
        };

        loop {
            if shutdown.is_cancelled() {
                return self.requeue(job_id, retries).await;
            }

            let err = match self.orchestrator.execute(job_id).await {
                Ok(_) => return JobOutcome::Succeeded,
                Err(err) => err,
            };

            match &err {
                ExecutionError::Runner(RunnerError::AlreadyRunning(_)) => {
                    tracing::warn!(job_id, "Job is already running on this worker");
                    return JobOutcome::Skipped;
                }
                ExecutionError::NotFound(_) => {
                    tracing::warn!(job_id, "Job disappeared before it could run");
                    return JobOutcome::Skipped;
                }
                ExecutionError::Runner(RunnerError::ShuttingDown) => {
                    return self.requeue(job_id, retries).await;
                }
                _ => {}
            }

            let kind = err.failure_kind();
            if kind == FailureKind::Cancelled {
                if shutdown.is_cancelled() && !matches!(self.is_revoked(job_id).await, Ok(true)) {
                    let message = "Worker shut down during execution";
                    self.record_failure(job_id, message, "INTERRUPTED", retries)
                        .await;
                    return JobOutcome::Failed;
                }
                self.record_revoked(job_id).await;
                return JobOutcome::Revoked;
            }

            let decision = self.policy.decide(&kind, retries);
            if !decision.retry {
                tracing::error!(job_id, code = err.code(), retries, error = %err, "Job failed");
                self.record_failure(job_id, &err.to_string(), err.code(), retries)
                    .await;
                return JobOutcome::Failed;
            }

            retries += 1;
            tracing::warn!(
                job_id,
                retry = retries,
                max_retries = self.policy.max_retries,
                delay_secs = decision.delay.as_secs(),
                error = %err,
                "Attempt failed, retrying",
            );
            let update = JobUpdate::status(JobStatus::Retry)
                .with_error(err.to_string())
                .with_retry_count(retries)
                .with_step(format!(
                    "Retry {retries}/{} in {}s",
                    self.policy.max_retries,
                    decision.delay.as_secs()
                ));
            if let Err(e) = self.tracker.update(job_id, &update).await {
                tracing::warn!(job_id, error = %e, "Failed to record retry");
            }

            match self.backoff(job_id, decision.delay, shutdown).await {
                Backoff::Elapsed => {}
                Backoff::Revoked => {
                    self.record_revoked(job_id).await;
                    return JobOutcome::Revoked;
                }
                Backoff::Shutdown => return self.requeue(job_id, retries).await,
            }
        }
    }

    async fn backoff(&self, job_id: &str, delay: Duration, shutdown: &CancellationToken) -> Backoff {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            match self.is_revoked(job_id).await {
                Ok(true) => return Backoff::Revoked,
                Ok(false) => {}
                Err(e) => tracing::debug!(job_id, error = %e, "Revocation check failed"),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Backoff::Elapsed;
            }
            let nap = (deadline - now).min(REVOKE_POLL_INTERVAL);

            tokio::select! {
                _ = shutdown.cancelled() => return Backoff::Shutdown,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn is_revoked(&self, job_id: &str) -> StoreResult<bool> {
        if self.tracker.queue().is_revoked(job_id).await? {
            return Ok(true);
        }
        Ok(self
            .tracker
            .get(job_id)
            .await?
            .is_some_and(|job| job.status == JobStatus::Revoked))
    }

    /// Hand a job that never reached its process back to the queue. The
    /// record is updated first so the next worker cannot be overwritten.
    /// Falls back to a terminal failure when the queue is unreachable.
    async fn requeue(&self, job_id: &str, retries: u32) -> JobOutcome {
        let mut update = JobUpdate::default()
            .with_retry_count(retries)
            .with_step("Requeued after worker shutdown");
        match self.tracker.get(job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => return JobOutcome::Skipped,
            Ok(Some(job)) if job.status == JobStatus::Started => {
                update.status = Some(JobStatus::Retry);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(job_id, error = %e, "Could not load job before requeue"),
        }
        if let Err(e) = self.tracker.update(job_id, &update).await {
            tracing::warn!(job_id, error = %e, "Failed to record requeue");
        }

        match self.tracker.queue().submit(job_id).await {
            Ok(()) => {
                tracing::info!(job_id, retries, "Worker shutting down, job requeued");
                JobOutcome::Requeued
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to requeue job at shutdown");
                let message = "Worker shut down before the job could run";
                self.record_failure(job_id, message, "INTERRUPTED", retries)
                    .await;
                JobOutcome::Failed
            }
        }
    }

    async fn record_revoked(&self, job_id: &str) {
        tracing::info!(job_id, "Job revoked");
        let update = JobUpdate::status(JobStatus::Revoked).with_step("Revoked");
        if let Err(e) = self.tracker.update(job_id, &update).await {
            tracing::warn!(job_id, error = %e, "Failed to record revocation");
        }
    }

    async fn record_failure(&self, job_id: &str, error: &str, code: &str, retries: u32) {
        let message = if retries > 0 {
            format!("{error} (after {retries} retries)")
        } else {
            error.to_string()
        };

        let update = JobUpdate::status(JobStatus::Failure)
            .with_error(message.clone())
            .with_retry_count(retries)
            .with_step("Failed");
        if let Err(e) = self.tracker.update(job_id, &update).await {
            tracing::error!(job_id, error = %e, "Failed to record job failure");
        }
        self.tracker
            .publish_error(job_id, &message, Some(code))
            .await;
    }
}

enum Backoff {
    Elapsed,
    Revoked,
    Shutdown,
}
