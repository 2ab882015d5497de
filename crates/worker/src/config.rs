use std::path::PathBuf;
use std::time::Duration;

use opsdeck_core::command::DEFAULT_PLAYBOOK_BIN;
use opsdeck_core::retry::RetryPolicy;

/// Worker configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// State Store URL (default: `redis://127.0.0.1:6379`).
    pub redis_url: String,
    /// Automation binary (default: `ansible-playbook`).
    pub playbook_bin: String,
    /// Directory playbooks and inventories are resolved against.
    pub playbook_dir: PathBuf,
    /// Scratch root; each job gets `<work_dir>/<job_id>/`.
    pub work_dir: PathBuf,
    /// Jobs run at the same time (default: `4`).
    pub concurrency: usize,
    /// Wall-clock limit per run unless the job overrides it.
    pub job_timeout: Duration,
    /// SIGTERM to SIGKILL grace period.
    pub grace_period: Duration,
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                  |
    /// |-------------------------|--------------------------|
    /// | `REDIS_URL`             | `redis://127.0.0.1:6379` |
    /// | `ANSIBLE_PLAYBOOK_BIN`  | `ansible-playbook`       |
    /// | `PLAYBOOK_DIR`          | `./playbooks`            |
    /// | `WORK_DIR`              | `/tmp/opsdeck`           |
    /// | `WORKER_CONCURRENCY`    | `4`                      |
    /// | `JOB_TIMEOUT_SECS`      | `3600`                   |
    /// | `PROCESS_GRACE_SECS`    | `10`                     |
    /// | `MAX_RETRIES`           | `3`                      |
    /// | `RETRY_BASE_DELAY_SECS` | `60`                     |
    /// | `RETRY_MAX_DELAY_SECS`  | `300`                    |
    pub fn from_env() -> Self {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let playbook_bin =
            std::env::var("ANSIBLE_PLAYBOOK_BIN").unwrap_or_else(|_| DEFAULT_PLAYBOOK_BIN.into());

        let playbook_dir: PathBuf = std::env::var("PLAYBOOK_DIR")
            .unwrap_or_else(|_| "./playbooks".into())
            .into();

        let work_dir: PathBuf = std::env::var("WORK_DIR")
            .unwrap_or_else(|_| "/tmp/opsdeck".into())
            .into();

        let concurrency: usize = std::env::var("WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "4".into())
            .parse()
            .expect("WORKER_CONCURRENCY must be a valid usize");
        assert!(concurrency > 0, "WORKER_CONCURRENCY must be at least 1");

        let job_timeout_secs: u64 = std::env::var("JOB_TIMEOUT_SECS")
            .unwrap_or_else(|_| "3600".into())
            .parse()
            .expect("JOB_TIMEOUT_SECS must be a valid u64");

        let grace_secs: u64 = std::env::var("PROCESS_GRACE_SECS")
            .unwrap_or_else(|_| "10".into())
            .parse()
            .expect("PROCESS_GRACE_SECS must be a valid u64");

        let max_retries: u32 = std::env::var("MAX_RETRIES")
            .unwrap_or_else(|_| "3".into())
            .parse()
            .expect("MAX_RETRIES must be a valid u32");

        let base_delay_secs: u64 = std::env::var("RETRY_BASE_DELAY_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .expect("RETRY_BASE_DELAY_SECS must be a valid u64");

        let max_delay_secs: u64 = std::env::var("RETRY_MAX_DELAY_SECS")
            .unwrap_or_else(|_| "300".into())
            .parse()
            .expect("RETRY_MAX_DELAY_SECS must be a valid u64");

        Self {
            redis_url,
            playbook_bin,
            playbook_dir,
            work_dir,
            concurrency,
            job_timeout: Duration::from_secs(job_timeout_secs),
            grace_period: Duration::from_secs(grace_secs),
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_secs(base_delay_secs),
                max_delay: Duration::from_secs(max_delay_secs),
            },
        }
    }
}
