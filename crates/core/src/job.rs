//! Job record and its lifecycle rules.
//!
//! [`Job::apply`] is the single place where status transitions happen, so
//! the "terminal is final" and "start/end time set once" rules hold no
//! matter which component writes the update.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::StatusEvent;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    Revoked,
}

impl JobStatus {
    /// Wire representation, e.g. `"STARTED"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Started => "STARTED",
            JobStatus::Retry => "RETRY",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Revoked => "REVOKED",
        }
    }

    /// `SUCCESS`, `FAILURE` and `REVOKED` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Revoked
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Durable job record, stored as one JSON document per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub owner_id: Option<String>,
    /// What the job operates on (playbook, hosts, run options).
    pub target_descriptor: Value,
    pub progress: u8,
    pub current_step: Option<String>,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    /// Number of retries performed so far.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Input for creating a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    /// Pre-allocated id; a fresh one is generated when absent.
    pub job_id: Option<JobId>,
    pub name: String,
    pub owner_id: Option<String>,
    pub target_descriptor: Value,
}

impl Job {
    /// Build a `PENDING` job from a creation request.
    pub fn new(job_id: JobId, new: &NewJob, now: Timestamp) -> Self {
        Self {
            job_id,
            name: new.name.clone(),
            status: JobStatus::Pending,
            owner_id: new.owner_id.clone(),
            target_descriptor: new.target_descriptor.clone(),
            progress: 0,
            current_step: None,
            start_time: None,
            end_time: None,
            result: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update and return the fields that were written.
    ///
    /// Once the job is terminal its status is frozen: a different status
    /// in `update` is dropped (the other fields still apply) and
    /// `end_time` is never touched again.
    pub fn apply(&mut self, update: &JobUpdate, now: Timestamp) -> StatusEvent {
        let mut written = StatusEvent::default();

        if let Some(status) = update.status {
            if self.status.is_terminal() && status != self.status {
                // Frozen.
            } else {
                self.status = status;
                written.status = Some(status);

                if status == JobStatus::Started && self.start_time.is_none() {
                    self.start_time = Some(now);
                    written.start_time = Some(now);
                }
                if status.is_terminal() && self.end_time.is_none() {
                    self.end_time = Some(now);
                    written.end_time = Some(now);
                }
            }
        }

        if let Some(progress) = update.progress {
            let progress = progress.min(100);
            self.progress = progress;
            written.progress = Some(progress);
        }
        if let Some(step) = &update.current_step {
            self.current_step = Some(step.clone());
            written.current_step = Some(step.clone());
        }
        if let Some(result) = &update.result {
            self.result = Some(result.clone());
            written.result = Some(result.clone());
        }
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
            written.error_message = Some(message.clone());
        }
        if let Some(count) = update.retry_count {
            self.retry_count = count;
        }

        self.updated_at = now;
        written
    }
}

// ---------------------------------------------------------------------------
// JobUpdate
// ---------------------------------------------------------------------------

/// Partial update of a job. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub current_step: Option<String>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: Option<u32>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn pending_job() -> Job {
        let new = NewJob {
            job_id: None,
            name: "site.yml".to_string(),
            owner_id: Some("alice".to_string()),
            target_descriptor: serde_json::json!({"playbook": "site.yml"}),
        };
        Job::new("job-1".to_string(), &new, Utc::now())
    }

    #[test]
    fn status_wire_format_round_trips() {
        for status in [
            JobStatus::Pending,
            JobStatus::Started,
            JobStatus::Retry,
            JobStatus::Success,
            JobStatus::Failure,
            JobStatus::Revoked,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(serde_json::from_str::<JobStatus>(&json).unwrap(), status);
        }
        assert!(serde_json::from_str::<JobStatus>("\"RUNNING\"").is_err());
    }

    #[test]
    fn terminal_set() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failure.is_terminal());
        assert!(JobStatus::Revoked.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Started.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
    }

    #[test]
    fn start_time_is_set_once() {
        let mut job = pending_job();
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(30);

        let written = job.apply(&JobUpdate::status(JobStatus::Started), t1);
        assert_eq!(written.start_time, Some(t1));

        job.apply(&JobUpdate::status(JobStatus::Retry), t2);
        let written = job.apply(&JobUpdate::status(JobStatus::Started), t2);
        assert_eq!(job.start_time, Some(t1));
        assert!(written.start_time.is_none());
    }

    #[test]
    fn terminal_status_is_frozen() {
        let mut job = pending_job();
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(5);

        job.apply(&JobUpdate::status(JobStatus::Revoked), t1);
        assert_eq!(job.end_time, Some(t1));

        let written = job.apply(
            &JobUpdate::status(JobStatus::Failure).with_error("process killed"),
            t2,
        );
        assert_eq!(job.status, JobStatus::Revoked);
        assert_eq!(job.end_time, Some(t1));
        assert!(written.status.is_none());
        assert!(written.end_time.is_none());
        assert_eq!(written.error_message.as_deref(), Some("process killed"));
    }

    #[test]
    fn repeated_terminal_status_keeps_end_time() {
        let mut job = pending_job();
        let t1 = Utc::now();
        job.apply(&JobUpdate::status(JobStatus::Success), t1);
        let written = job.apply(
            &JobUpdate::status(JobStatus::Success),
            t1 + Duration::seconds(1),
        );
        assert_eq!(written.status, Some(JobStatus::Success));
        assert!(written.end_time.is_none());
        assert_eq!(job.end_time, Some(t1));
    }

    #[test]
    fn progress_is_clamped() {
        let mut job = pending_job();
        let written = job.apply(&JobUpdate::default().with_progress(250), Utc::now());
        assert_eq!(job.progress, 100);
        assert_eq!(written.progress, Some(100));
    }

    #[test]
    fn untouched_fields_are_not_reported() {
        let mut job = pending_job();
        let written = job.apply(&JobUpdate::default().with_step("Gathering facts"), Utc::now());
        assert!(written.status.is_none());
        assert!(written.progress.is_none());
        assert_eq!(written.current_step.as_deref(), Some("Gathering facts"));
    }
}
