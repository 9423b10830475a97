//! Showrunner worker entrypoint
//!
//! Exit codes tell the supervisor what happened: 0 after a drain or recycle
//! (restart to keep serving), 1 when the process considered itself corrupted.

mod config;
mod executors;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::WorkerSettings;
use showrunner_tasks::{
    Broker, LifecycleManager, RedisBroker, RedisBrokerConfig, RedisStore, RedisStoreConfig,
    TaskRouter, TaskStore, Worker, WorkerExit,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = WorkerSettings::from_env()?;

    let store: Arc<dyn TaskStore> = Arc::new(
        RedisStore::new(RedisStoreConfig {
            url: settings.store_url.clone(),
            ..RedisStoreConfig::default()
        })
        .await
        .context("Store connection failed")?,
    );
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::new(RedisBrokerConfig {
            url: settings.broker_url.clone(),
            ..RedisBrokerConfig::default()
        })
        .await
        .context("Broker connection failed")?,
    );
    let router = Arc::new(TaskRouter::from_env().context("Invalid routing configuration")?);
    let lifecycle = Arc::new(LifecycleManager::new(
        store.clone(),
        broker.clone(),
        router.clone(),
    ));

    // Hard timeouts cap individual requests; the policy-level deadline is
    // enforced by the worker, so the forwarding client just needs headroom
    let registry = executors::registry(&settings.executor_url, Duration::from_secs(660))?;

    let queues = if settings.queues.is_empty() {
        router.queues()
    } else {
        settings.queues.clone()
    };
    info!(queues = ?queues, concurrency = settings.concurrency, "Worker configured");

    let worker = Arc::new(Worker::new(
        settings.worker_config(queues),
        store,
        broker,
        lifecycle,
        registry,
    ));

    {
        let worker = worker.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            worker.shutdown();
        });
    }

    let exit = worker.run().await.context("Worker run failed")?;
    match exit {
        WorkerExit::Corrupted => {
            // Non-zero so the supervisor replaces the process immediately
            std::process::exit(1)
        }
        WorkerExit::Drained | WorkerExit::Recycled | WorkerExit::MemoryCeiling => {
            info!(exit = ?exit, "Worker exiting cleanly");
            Ok(())
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
