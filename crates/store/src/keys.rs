//! Key, channel and retention layout in the State Store.

use std::time::Duration;

const DAY: u64 = 24 * 60 * 60;

/// Retention of job records.
pub const JOB_TTL: Duration = Duration::from_secs(7 * DAY);

/// Retention of log lists.
pub const LOG_TTL: Duration = Duration::from_secs(7 * DAY);

/// Retention of the per-owner index.
pub const OWNER_INDEX_TTL: Duration = Duration::from_secs(30 * DAY);

/// Retention of revoke markers.
pub const REVOKED_TTL: Duration = Duration::from_secs(7 * DAY);

/// Most recent log lines kept per job.
pub const MAX_LOG_ENTRIES: usize = 1000;

/// Most recent job ids kept per owner.
pub const MAX_OWNER_JOBS: usize = 100;

/// Pending job ids, consumed FIFO by workers.
pub const QUEUE_KEY: &str = "queue:jobs";

/// Revocation broadcast channel; payload is the job id.
pub const REVOKE_CHANNEL: &str = "control:revoke";

const JOB_PREFIX: &str = "job:";
const LOGS_SUFFIX: &str = ":logs";

/// Scan pattern matching job records (and their log lists).
pub const JOB_KEY_PATTERN: &str = "job:*";

pub fn job_key(job_id: &str) -> String {
    format!("{JOB_PREFIX}{job_id}")
}

pub fn logs_key(job_id: &str) -> String {
    format!("{JOB_PREFIX}{job_id}{LOGS_SUFFIX}")
}

pub fn owner_jobs_key(owner_id: &str) -> String {
    format!("owner:{owner_id}:jobs")
}

pub fn revoked_key(job_id: &str) -> String {
    format!("revoked:{job_id}")
}

/// Job id of a record key; `None` for log lists and foreign keys.
pub fn job_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(JOB_PREFIX)
        .filter(|rest| !rest.is_empty() && !rest.ends_with(LOGS_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(job_key("a1"), "job:a1");
        assert_eq!(logs_key("a1"), "job:a1:logs");
        assert_eq!(owner_jobs_key("alice"), "owner:alice:jobs");
        assert_eq!(revoked_key("a1"), "revoked:a1");
    }

    #[test]
    fn record_keys_are_told_apart_from_logs() {
        assert_eq!(job_id_from_key("job:a1"), Some("a1"));
        assert_eq!(job_id_from_key("job:a1:logs"), None);
        assert_eq!(job_id_from_key("job:"), None);
        assert_eq!(job_id_from_key("owner:alice:jobs"), None);
    }
}
