use async_trait::async_trait;
use opsdeck_core::events::JobEvent;

/// Receiver of job events delivered by the [`EventBridge`](crate::EventBridge).
///
/// Implementations must not block: the bridge awaits each dispatch before
/// reading the next message.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn dispatch(&self, event: JobEvent);
}
