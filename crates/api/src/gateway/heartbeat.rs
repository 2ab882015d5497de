use std::sync::Arc;
use std::time::Duration;

use crate::gateway::manager::EventGateway;

/// Interval between heartbeat pings (in seconds).
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Spawn a background task that sends periodic Ping frames to all live
/// connections.
///
/// Runs until aborted through the returned handle.
pub fn start_heartbeat(gateway: Arc<EventGateway>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));

        loop {
            interval.tick().await;
            let count = gateway.connection_count().await;
            tracing::debug!(count, "WebSocket heartbeat ping");
            gateway.ping_all().await;
        }
    })
}
