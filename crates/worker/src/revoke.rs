//! Revoke listener: terminates local processes of revoked jobs.
//!
//! Revocations are broadcast to every worker; only the worker whose
//! registry holds the job acts on it. The subscription is re-established
//! with backoff when it drops.

use std::sync::Arc;

use futures::StreamExt;
use opsdeck_events::reconnect::{next_delay, ReconnectConfig};
use opsdeck_store::TaskQueue;
use tokio_util::sync::CancellationToken;

use crate::runner::ProcessRunner;

pub struct RevokeListener {
    queue: Arc<dyn TaskQueue>,
    runner: ProcessRunner,
    reconnect: ReconnectConfig,
}

impl RevokeListener {
    pub fn new(queue: Arc<dyn TaskQueue>, runner: ProcessRunner) -> Self {
        Self {
            queue,
            runner,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut delay = self.reconnect.initial_delay;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.queue.revocations() => result,
            };

            match subscribed {
                Ok(mut revocations) => {
                    tracing::info!("Revoke listener subscribed");
                    delay = self.reconnect.initial_delay;

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            message = revocations.next() => match message {
                                Some(message) => self.handle(&message.payload),
                                None => break,
                            },
                        }
                    }
                    tracing::warn!("Revoke subscription closed, resubscribing");
                }
                Err(e) => {
                    tracing::warn!(
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Revoke listener subscribe failed",
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, &self.reconnect);
        }
    }

    fn handle(&self, job_id: &str) {
        if self.runner.terminate(job_id) {
            tracing::info!(job_id, "Terminating revoked job");
        } else {
            tracing::debug!(job_id, "Revoked job not running on this worker");
        }
    }
}
