//! Periodic removal of old job records.
//!
//! Job records, their logs and owner index entries live in the state
//! store; anything created more than the retention period ago is deleted
//! on a fixed interval.

use std::time::Duration;

use opsdeck_store::JobTracker;
use tokio_util::sync::CancellationToken;

/// How often the cleanup job runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600); // 1 hour

/// Run the retention loop until `cancel` is triggered.
pub async fn run(tracker: JobTracker, retention_days: u32, cancel: CancellationToken) {
    run_every(tracker, retention_days, CLEANUP_INTERVAL, cancel).await;
}

/// [`run`] with an explicit interval. The first sweep happens immediately.
pub async fn run_every(
    tracker: JobTracker,
    retention_days: u32,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_days,
        interval_secs = every.as_secs(),
        "Job retention job started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention job stopping");
                break;
            }
            _ = interval.tick() => {
                match tracker.cleanup_expired(retention_days).await {
                    Ok(0) => tracing::debug!("Job retention: no jobs to purge"),
                    Ok(removed) => tracing::info!(removed, "Job retention: purged old jobs"),
                    Err(e) => tracing::error!(error = %e, "Job retention: cleanup failed"),
                }
            }
        }
    }
}
