//! Job Tracker: the durable source of truth for job state.
//!
//! Every write goes to the State Store first and is then published on the
//! job's event channel. Publish failures are logged and never fail the
//! write; subscribers that miss an event can always re-read the record.
//!
//! Record updates are read-modify-write cycles guarded by a
//! compare-and-swap, so concurrent writers (a worker reporting progress
//! while the API revokes the job) never lose each other's fields and a
//! terminal status is never overwritten.

use std::sync::Arc;

use chrono::Utc;
use opsdeck_core::error::CoreError;
use opsdeck_core::events::{event_channel, JobEvent};
use opsdeck_core::job::{Job, JobStatus, JobUpdate, NewJob};
use opsdeck_core::types::{new_job_id, validate_job_id, JobId};

use crate::backend::StateStore;
use crate::error::{StoreError, StoreResult};
use crate::keys::{
    job_id_from_key, job_key, logs_key, owner_jobs_key, JOB_KEY_PATTERN, JOB_TTL, LOG_TTL,
    MAX_LOG_ENTRIES, MAX_OWNER_JOBS, OWNER_INDEX_TTL,
};
use crate::queue::TaskQueue;

/// Compare-and-swap attempts before an update gives up.
const MAX_UPDATE_ATTEMPTS: usize = 16;

/// Timestamp prefix of stored log lines.
const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn TaskQueue>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn StateStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Create a `PENDING` job. Returns the existing id untouched when a
    /// record with that id already exists.
    pub async fn create(&self, new: NewJob) -> StoreResult<JobId> {
        if let Some(job_id) = &new.job_id {
            validate_job_id(job_id)?;
        }
        let job_id = new.job_id.clone().unwrap_or_else(new_job_id);
        let job = Job::new(job_id.clone(), &new, Utc::now());
        let json = serde_json::to_string(&job)?;

        let created = self
            .store
            .set_if_absent(&job_key(&job_id), &json, JOB_TTL)
            .await?;
        if !created {
            tracing::debug!(job_id = %job_id, "Job already exists, create is a no-op");
            return Ok(job_id);
        }

        if let Some(owner_id) = &job.owner_id {
            self.store
                .prepend_capped(
                    &owner_jobs_key(owner_id),
                    &job_id,
                    MAX_OWNER_JOBS,
                    OWNER_INDEX_TTL,
                )
                .await?;
        }

        tracing::info!(job_id = %job_id, name = %job.name, "Job created");
        Ok(job_id)
    }

    /// Apply a partial update. Returns `false` when the job does not exist.
    pub async fn update(&self, job_id: &str, update: &JobUpdate) -> StoreResult<bool> {
        let key = job_key(job_id);

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(current) = self.store.get(&key).await? else {
                tracing::warn!(job_id, "Update for unknown job ignored");
                return Ok(false);
            };

            let mut job: Job = serde_json::from_str(&current)?;
            let written = job.apply(update, Utc::now());
            let next = serde_json::to_string(&job)?;

            if self
                .store
                .compare_and_swap(&key, &current, &next, JOB_TTL)
                .await?
            {
                if update.status.is_some() && written.status.is_none() {
                    tracing::debug!(
                        job_id,
                        status = %job.status,
                        "Job is terminal, status change dropped"
                    );
                }
                if !written.is_empty() {
                    self.publish(JobEvent::status(job_id, written)).await;
                }
                return Ok(true);
            }

            tracing::debug!(job_id, "Job record changed concurrently, retrying update");
        }

        Err(StoreError::Contention(key))
    }

    /// Append a timestamped line to the job's log and publish it.
    pub async fn append_log(&self, job_id: &str, text: &str) -> StoreResult<()> {
        let line = format!("[{}] {text}", Utc::now().format(LOG_TIMESTAMP_FORMAT));
        self.store
            .append_capped(&logs_key(job_id), &line, MAX_LOG_ENTRIES, LOG_TTL)
            .await?;
        self.publish(JobEvent::log(job_id, line)).await;
        Ok(())
    }

    /// Publish an out-of-band failure notice. Nothing is stored.
    pub async fn publish_error(&self, job_id: &str, error_message: &str, error_code: Option<&str>) {
        self.publish(JobEvent::error(
            job_id,
            error_message,
            error_code.map(str::to_string),
        ))
        .await;
    }

    /// Revoke a job that has not finished yet.
    ///
    /// Returns `false` when the job is unknown or already terminal.
    pub async fn cancel(&self, job_id: &str) -> StoreResult<bool> {
        let Some(job) = self.get(job_id).await? else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id, status = %job.status, "Cancel of finished job ignored");
            return Ok(false);
        }

        self.queue.revoke(job_id).await?;
        self.update(job_id, &JobUpdate::status(JobStatus::Revoked))
            .await
    }

    /// Create a job and hand it to the task queue.
    ///
    /// A pre-allocated id may be resubmitted only while it is still
    /// `PENDING`.
    pub async fn submit(&self, new: NewJob) -> StoreResult<JobId> {
        if let Some(existing_id) = &new.job_id {
            validate_job_id(existing_id)?;
            if let Some(existing) = self.get(existing_id).await? {
                if existing.status != JobStatus::Pending {
                    return Err(CoreError::Conflict(format!(
                        "Job {existing_id} is already {}",
                        existing.status
                    ))
                    .into());
                }
            }
        }

        let job_id = self.create(new).await?;
        self.queue.submit(&job_id).await?;
        Ok(job_id)
    }

    /// Delete jobs created more than `retention_days` ago, with their logs
    /// and owner index entries. Returns how many jobs were removed.
    pub async fn cleanup_expired(&self, retention_days: u32) -> StoreResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let mut removed = 0;

        for key in self.store.scan_keys(JOB_KEY_PATTERN).await? {
            let Some(job_id) = job_id_from_key(&key) else {
                continue;
            };
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let job: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable job record");
                    continue;
                }
            };
            if job.created_at >= cutoff {
                continue;
            }

            self.store.delete(&key).await?;
            self.store.delete(&logs_key(job_id)).await?;
            if let Some(owner_id) = &job.owner_id {
                self.store
                    .list_remove(&owner_jobs_key(owner_id), job_id)
                    .await?;
            }
            removed += 1;
        }

        if removed > 0 {
            tracing::info!(removed, retention_days, "Expired jobs removed");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, job_id: &str) -> StoreResult<Option<Job>> {
        match self.store.get(&job_key(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// The last `limit` log lines, oldest first.
    pub async fn get_logs(&self, job_id: &str, limit: usize) -> StoreResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = -(limit.min(MAX_LOG_ENTRIES) as isize);
        self.store.range(&logs_key(job_id), start, -1).await
    }

    /// Jobs of one owner, newest first. Expired entries are skipped.
    pub async fn list_for_owner(
        &self,
        owner_id: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let ids = self.store.range(&owner_jobs_key(owner_id), 0, -1).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get(&id).await? {
                if status.map_or(true, |s| s == job.status) {
                    jobs.push(job);
                }
            }
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    async fn publish(&self, event: JobEvent) {
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(job_id = %event.job_id, error = %e, "Failed to encode job event");
                return;
            }
        };

        if let Err(e) = self
            .store
            .publish(&event_channel(&event.job_id), &payload)
            .await
        {
            tracing::warn!(
                job_id = %event.job_id,
                event_type = event.event_type(),
                error = %e,
                "Failed to publish job event"
            );
        }
    }
}
