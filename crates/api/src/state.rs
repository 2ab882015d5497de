use std::sync::Arc;

use opsdeck_store::{JobTracker, StateStore};

use crate::config::ServerConfig;
use crate::gateway::EventGateway;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone: everything is behind an `Arc` or is itself a handle.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub tracker: JobTracker,
    pub gateway: Arc<EventGateway>,
    pub config: Arc<ServerConfig>,
}
