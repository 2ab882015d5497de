//! Cross-process event distribution.
//!
//! Job events are published on the State Store's `events:<job_id>`
//! channels by whichever process wrote the change. The [`EventBridge`]
//! runs inside every process that hosts live viewers, subscribes to all
//! job channels and hands each event to an [`EventSink`] (the WebSocket
//! gateway in the API server).

pub mod bridge;
pub mod reconnect;
pub mod sink;

pub use bridge::EventBridge;
pub use reconnect::ReconnectConfig;
pub use sink::EventSink;
