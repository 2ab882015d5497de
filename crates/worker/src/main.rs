use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opsdeck_store::{JobTracker, RedisStore, StateStore, StoreTaskQueue, TaskQueue};
use opsdeck_worker::config::WorkerConfig;
use opsdeck_worker::consumer::Consumer;
use opsdeck_worker::executor::JobExecutor;
use opsdeck_worker::orchestrator::{Orchestrator, OrchestratorConfig};
use opsdeck_worker::revoke::RevokeListener;
use opsdeck_worker::runner::{ProcessRegistry, ProcessRunner};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsdeck_worker=debug,opsdeck_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env();
    tracing::info!(
        concurrency = config.concurrency,
        playbook_dir = %config.playbook_dir.display(),
        work_dir = %config.work_dir.display(),
        "Loaded worker configuration",
    );

    std::fs::create_dir_all(&config.work_dir).expect("Failed to create WORK_DIR");

    // --- State store ---
    let store: Arc<dyn StateStore> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .expect("Failed to connect to Redis"),
    );
    store.ping().await.expect("Redis health check failed");

    let queue: Arc<dyn TaskQueue> = Arc::new(StoreTaskQueue::new(Arc::clone(&store)));
    let tracker = JobTracker::new(Arc::clone(&store), Arc::clone(&queue));

    // --- Execution stack ---
    let registry = Arc::new(ProcessRegistry::new());
    let runner = ProcessRunner::new(Arc::clone(&registry)).with_grace_period(config.grace_period);
    let orchestrator = Arc::new(Orchestrator::new(
        tracker.clone(),
        runner.clone(),
        OrchestratorConfig::from(&config),
    ));
    let executor = Arc::new(JobExecutor::new(orchestrator, tracker, config.retry));

    let cancel = CancellationToken::new();

    // --- Revoke listener ---
    let revoke_handle = tokio::spawn(
        RevokeListener::new(Arc::clone(&queue), runner.clone()).run(cancel.clone()),
    );

    // --- Consumer ---
    let consumer_handle =
        tokio::spawn(Consumer::new(queue, executor, config.concurrency).run(cancel.clone()));

    tracing::info!("Worker started");
    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();

    let terminated = runner.shutdown();
    tracing::info!(terminated, "Terminating running processes");

    let drain = config.grace_period + Duration::from_secs(10);
    if tokio::time::timeout(drain, consumer_handle).await.is_err() {
        tracing::warn!(running = ?registry.running_jobs(), "Jobs still running at shutdown");
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), revoke_handle).await;

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM.
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
