use std::collections::HashMap;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::Message;
use opsdeck_core::events::JobEvent;
use opsdeck_core::types::Timestamp;
use opsdeck_events::EventSink;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

/// Outbound messages buffered per connection before it counts as slow.
pub const CONNECTION_CHANNEL_CAPACITY: usize = 256;

/// Channel sender half for pushing messages to a WebSocket connection.
pub type GatewaySender = mpsc::Sender<Message>;

/// A live viewer of one job. Never persisted.
pub struct GatewayConnection {
    /// Who opened the connection, as given by the client.
    pub owner_id: Option<String>,
    pub connected_at: Timestamp,
    sender: GatewaySender,
}

/// Live WebSocket connections, grouped by the job they watch.
///
/// Thread-safe via interior `RwLock`; wrap in `Arc` and share. Delivery
/// never waits on a connection: a full or closed channel drops the
/// message for that connection only.
pub struct EventGateway {
    jobs: RwLock<HashMap<String, HashMap<String, GatewayConnection>>>,
}

impl EventGateway {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection watching `job_id`.
    ///
    /// Returns a sender for replies originating from the connection itself
    /// and the receiver the caller forwards to the WebSocket sink.
    pub async fn register(
        &self,
        conn_id: impl Into<String>,
        job_id: impl Into<String>,
        owner_id: Option<String>,
    ) -> (GatewaySender, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
        let conn = GatewayConnection {
            owner_id,
            connected_at: chrono::Utc::now(),
            sender: tx.clone(),
        };
        self.jobs
            .write()
            .await
            .entry(job_id.into())
            .or_default()
            .insert(conn_id.into(), conn);
        (tx, rx)
    }

    /// Remove a connection. Unknown ids are ignored; a job left without
    /// viewers is dropped from the map.
    pub async fn deregister(&self, conn_id: &str, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(conns) = jobs.get_mut(job_id) else {
            return false;
        };
        let removed = conns.remove(conn_id).is_some();
        if conns.is_empty() {
            jobs.remove(job_id);
        }
        removed
    }

    /// Send `event` to every connection watching its job.
    ///
    /// The envelope is serialized once. Returns how many connections
    /// accepted the message.
    pub async fn broadcast(&self, event: &JobEvent) -> usize {
        let jobs = self.jobs.read().await;
        let Some(conns) = jobs.get(&event.job_id) else {
            return 0;
        };

        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(job_id = %event.job_id, error = %e, "Failed to serialize job event");
                return 0;
            }
        };
        let message = Message::Text(json.into());

        let mut delivered = 0;
        for (conn_id, conn) in conns {
            match conn.sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(
                        conn_id = %conn_id,
                        job_id = %event.job_id,
                        owner_id = ?conn.owner_id,
                        "Connection lagging, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(conn_id = %conn_id, job_id = %event.job_id, "Connection closed, event dropped");
                }
            }
        }
        delivered
    }

    /// Total live connections across all jobs.
    pub async fn connection_count(&self) -> usize {
        self.jobs.read().await.values().map(HashMap::len).sum()
    }

    /// Jobs with at least one viewer.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Viewers of one job.
    pub async fn connections_for(&self, job_id: &str) -> usize {
        self.jobs.read().await.get(job_id).map_or(0, HashMap::len)
    }

    /// Send a Ping frame to every connection.
    pub async fn ping_all(&self) {
        let jobs = self.jobs.read().await;
        for conn in jobs.values().flat_map(HashMap::values) {
            let _ = conn.sender.try_send(Message::Ping(Bytes::new()));
        }
    }

    /// Send a Close frame to every connection, then clear the map.
    pub async fn shutdown_all(&self) {
        let mut jobs = self.jobs.write().await;
        let mut count = 0;
        for conn in jobs.values().flat_map(HashMap::values) {
            let _ = conn.sender.try_send(Message::Close(None));
            count += 1;
        }
        jobs.clear();
        tracing::info!(count, "Closed all WebSocket connections");
    }
}

impl Default for EventGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for EventGateway {
    async fn dispatch(&self, event: JobEvent) {
        let delivered = self.broadcast(&event).await;
        tracing::trace!(job_id = %event.job_id, delivered, "Dispatched job event");
    }
}
