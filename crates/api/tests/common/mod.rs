#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use opsdeck_events::{EventBridge, EventSink};
use opsdeck_store::{JobTracker, MemoryStore, StoreTaskQueue, TaskQueue};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use opsdeck_api::config::ServerConfig;
use opsdeck_api::gateway::EventGateway;
use opsdeck_api::router::build_app_router;
use opsdeck_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        redis_url: "redis://unused".to_string(),
        ws_heartbeat_timeout_secs: 90,
        ws_backlog_lines: 50,
        job_retention_days: 7,
    }
}

/// Application state over a fresh in-memory store.
pub fn test_state(config: ServerConfig) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let queue: Arc<dyn TaskQueue> = Arc::new(StoreTaskQueue::new(store.clone()));
    let tracker = JobTracker::new(store.clone(), queue);

    let state = AppState {
        store: store.clone(),
        tracker,
        gateway: Arc::new(EventGateway::new()),
        config: Arc::new(config),
    };
    (state, store)
}

/// The full router over an in-memory store, for `oneshot` requests.
pub fn build_test_app() -> Router {
    let config = test_config();
    let (state, _) = test_state(config.clone());
    build_app_router(state, &config)
}

/// A server bound to an ephemeral port with a running event bridge.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    cancel: CancellationToken,
}

impl TestServer {
    pub fn ws_url(&self, job_id: &str) -> String {
        format!("ws://{}/ws/jobs/{job_id}", self.addr)
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.state.tracker
    }

    pub fn gateway(&self) -> &Arc<EventGateway> {
        &self.state.gateway
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(test_config()).await
}

pub async fn spawn_server_with(config: ServerConfig) -> TestServer {
    let (state, store) = test_state(config.clone());
    let cancel = CancellationToken::new();

    let sink: Arc<dyn EventSink> = state.gateway.clone();
    EventBridge::new(store.clone(), sink).spawn(cancel.clone());
    wait_for(|| store.subscriber_count() > 0).await;

    let app = build_app_router(state.clone(), &config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .expect("server");
    });

    TestServer {
        addr,
        state,
        store,
        cancel,
    }
}

/// Poll `condition` every 10ms for up to 5 seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
