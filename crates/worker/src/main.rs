use anyhow::{Context, Result};
use stepworks_worker::{HostConfig, WorkerHost};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepworks_worker=info,stepworks_durable=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("stepworks-worker starting...");

    let config = HostConfig::from_env().context("Invalid worker configuration")?;

    tracing::info!(
        workers = config.engine.worker_count,
        worker_id_prefix = %config.engine.worker_id_prefix,
        poll_interval_ms = config.engine.worker.poll_interval.as_millis() as u64,
        "Starting step worker"
    );

    let host = WorkerHost::connect(config)
        .await
        .context("Failed to create worker host")?;

    host.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
