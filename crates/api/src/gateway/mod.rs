//! Event Gateway: live job events over WebSocket.
//!
//! Provides the per-job connection registry, heartbeat, and the HTTP
//! upgrade handler mounted at `/ws/jobs/{job_id}`.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::{job_events_handler, WatchParams};
pub use heartbeat::start_heartbeat;
pub use manager::EventGateway;
