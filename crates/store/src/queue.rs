//! Task queue: hands job ids to workers and broadcasts revocations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::backend::{PubSubMessage, StateStore, Subscription};
use crate::error::StoreResult;
use crate::keys::{revoked_key, QUEUE_KEY, REVOKED_TTL, REVOKE_CHANNEL};

/// Delivery of job ids to workers.
///
/// Each submitted id is handed to exactly one `next` caller.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    async fn submit(&self, job_id: &str) -> StoreResult<()>;

    /// Mark a job revoked and notify every worker.
    async fn revoke(&self, job_id: &str) -> StoreResult<()>;

    /// Next job id, or `None` when nothing arrived within `timeout`.
    async fn next(&self, timeout: Duration) -> StoreResult<Option<String>>;

    async fn is_revoked(&self, job_id: &str) -> StoreResult<bool>;

    /// Stream of revoked job ids as they are announced.
    async fn revocations(&self) -> StoreResult<Subscription>;
}

/// [`TaskQueue`] over a [`StateStore`]: a FIFO list plus a revoke marker
/// and broadcast channel.
pub struct StoreTaskQueue {
    store: Arc<dyn StateStore>,
}

impl StoreTaskQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskQueue for StoreTaskQueue {
    async fn submit(&self, job_id: &str) -> StoreResult<()> {
        self.store.push_back(QUEUE_KEY, job_id).await?;
        tracing::debug!(job_id, "Job enqueued");
        Ok(())
    }

    async fn revoke(&self, job_id: &str) -> StoreResult<()> {
        self.store
            .set(&revoked_key(job_id), "1", REVOKED_TTL)
            .await?;
        self.store.publish(REVOKE_CHANNEL, job_id).await?;
        tracing::info!(job_id, "Job revoked");
        Ok(())
    }

    async fn next(&self, timeout: Duration) -> StoreResult<Option<String>> {
        self.store.pop_front_blocking(QUEUE_KEY, timeout).await
    }

    async fn is_revoked(&self, job_id: &str) -> StoreResult<bool> {
        Ok(self.store.get(&revoked_key(job_id)).await?.is_some())
    }

    async fn revocations(&self) -> StoreResult<Subscription> {
        let sub = self.store.psubscribe(REVOKE_CHANNEL).await?;
        Ok(sub
            .map(|msg| PubSubMessage {
                channel: msg.channel,
                payload: msg.payload.trim().to_string(),
            })
            .boxed())
    }
}
