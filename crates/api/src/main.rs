use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opsdeck_api::config::ServerConfig;
use opsdeck_api::gateway::{self, EventGateway};
use opsdeck_api::router::build_app_router;
use opsdeck_api::state::AppState;
use opsdeck_events::{EventBridge, EventSink};
use opsdeck_store::{JobTracker, RedisStore, StateStore, StoreTaskQueue, TaskQueue};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsdeck_api=debug,opsdeck_events=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- State store ---
    let store: Arc<dyn StateStore> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .expect("Failed to connect to Redis"),
    );
    store.ping().await.expect("Redis health check failed");
    tracing::info!("State store health check passed");

    let queue: Arc<dyn TaskQueue> = Arc::new(StoreTaskQueue::new(Arc::clone(&store)));
    let tracker = JobTracker::new(Arc::clone(&store), queue);

    // --- Event gateway ---
    let event_gateway = Arc::new(EventGateway::new());
    let heartbeat_handle = gateway::start_heartbeat(Arc::clone(&event_gateway));

    let cancel = CancellationToken::new();

    // --- Event bridge ---
    let sink: Arc<dyn EventSink> = event_gateway.clone();
    let bridge_handle = EventBridge::new(Arc::clone(&store), sink).spawn(cancel.clone());

    // --- Retention sweep ---
    let retention_handle = tokio::spawn(opsdeck_api::background::job_retention::run(
        tracker.clone(),
        config.job_retention_days,
        cancel.clone(),
    ));

    tracing::info!("Background services started (event bridge, heartbeat, job retention)");

    // --- App state ---
    let state = AppState {
        store,
        tracker,
        gateway: Arc::clone(&event_gateway),
        config: Arc::new(config.clone()),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), bridge_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), retention_handle).await;
    tracing::info!("Event bridge and retention job stopped");

    let ws_count = event_gateway.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    event_gateway.shutdown_all().await;

    heartbeat_handle.abort();
    tracing::info!("Heartbeat task stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
