//! Queue consumer loop.
//!
//! Pops job ids and runs each on its own task. A semaphore caps how many
//! jobs run at once; the loop only pops when a slot is free, so queued
//! jobs stay available to other workers meanwhile.

use std::sync::Arc;
use std::time::Duration;

use opsdeck_store::TaskQueue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::executor::JobExecutor;

/// Blocking-pop timeout; bounds how long shutdown waits for the loop.
const POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a queue error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Consumer {
    queue: Arc<dyn TaskQueue>,
    executor: Arc<JobExecutor>,
    concurrency: usize,
    poll_timeout: Duration,
}

impl Consumer {
    pub fn new(queue: Arc<dyn TaskQueue>, executor: Arc<JobExecutor>, concurrency: usize) -> Self {
        Self {
            queue,
            executor,
            concurrency: concurrency.max(1),
            poll_timeout: POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Consume until `cancel` fires, then wait for running jobs.
    pub async fn run(self, cancel: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        tracing::info!(concurrency = self.concurrency, "Consumer started");

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Not raced against cancellation: dropping a pop mid-flight
            // could lose a job id.
            let next = self.queue.next(self.poll_timeout).await;

            match next {
                Ok(Some(job_id)) => {
                    if matches!(self.queue.is_revoked(&job_id).await, Ok(true)) {
                        tracing::info!(job_id = %job_id, "Skipping revoked job");
                    } else {
                        let executor = Arc::clone(&self.executor);
                        let shutdown = cancel.clone();
                        tasks.spawn(async move {
                            let outcome = executor.run(&job_id, &shutdown).await;
                            tracing::info!(job_id = %job_id, outcome = ?outcome, "Job finished");
                            drop(permit);
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll task queue");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }

            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Job task panicked");
                }
            }

            if cancel.is_cancelled() {
                break;
            }
        }

        tracing::info!(running = tasks.len(), "Consumer stopping, waiting for running jobs");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Job task panicked");
            }
        }
        tracing::info!("Consumer stopped");
    }
}
