//! Matchup background worker.
//!
//! Runs the lifecycle scheduler, the spatial index synchronizer and the periodic
//! reconciler until Ctrl+C or SIGTERM.

use anyhow::Context;
use matchup_runtime::metrics::MetricsServer;
use matchup_service::{App, Components, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; real deployments set variables directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,matchup=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting matchup server");

    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        instance = %config.server.instance_id,
        redpanda_brokers = %config.redpanda.brokers,
        lock_backend = ?config.server.lock_backend,
        "Configuration loaded"
    );

    MetricsServer::new(config.server.metrics_addr)
        .serve()
        .context("Failed to start metrics endpoint")?;

    let components = Components::connect(&config)
        .await
        .context("Failed to connect backends")?;
    let app = App::new(components, config);

    let running = app.start().await;
    info!(tasks = ?running.task_names(), "Matchup server running");

    shutdown_signal().await?;

    info!("Shutting down background tasks...");
    let stopped = running.shutdown().await;
    info!(stopped, "Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = ctrl_c => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C signal");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C signal");
    }

    Ok(())
}
