pub mod health;

use axum::routing::get;
use axum::Router;

use crate::gateway;
use crate::state::AppState;

/// Build the live event route tree.
///
/// ```text
/// /ws/jobs/{job_id}     WebSocket (?owner_id=...)
/// ```
pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws/jobs/{job_id}", get(gateway::job_events_handler))
}
