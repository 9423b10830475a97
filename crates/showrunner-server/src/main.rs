//! Showrunner API server entrypoint
//!
//! Wires the Redis store and broker into the HTTP surface and hosts the
//! webhook deliverer and the stale-task reaper alongside the API.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use showrunner_server::{app, AppState, Settings};
use showrunner_tasks::{
    Broker, Reaper, ReaperConfig, RedisBroker, RedisBrokerConfig, RedisStore, RedisStoreConfig,
    TaskRouter, TaskStore, WebhookConfig, WebhookDeliverer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env()?;

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

    let state = AppState::new(store.clone(), broker, router, settings.clone());

    // Webhook deliverer: decoupled from the lifecycle manager via the
    // store's terminal event channel
    let deliverer = Arc::new(WebhookDeliverer::new(
        store.clone(),
        WebhookConfig {
            timeout: settings.webhook_timeout,
            max_attempts: settings.webhook_max_attempts,
            concurrency: settings.webhook_concurrency,
            ..WebhookConfig::default()
        },
    )?);
    {
        let deliverer = deliverer.clone();
        tokio::spawn(async move {
            if let Err(e) = deliverer.run().await {
                tracing::error!(error = %e, "Webhook deliverer exited");
            }
        });
    }

    // Stale-task reaper
    let reaper = Reaper::new(
        ReaperConfig {
            interval: settings.reaper_interval,
        },
        store.clone(),
        state.lifecycle.clone(),
    );
    let reaper_handle = reaper.spawn();

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "Showrunner API listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    deliverer.shutdown();
    reaper_handle.abort();
    info!("Showrunner API stopped");
    Ok(())
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
