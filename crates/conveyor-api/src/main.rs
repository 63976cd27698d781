// Conveyor server binary

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_api::build_host;
use conveyor_core::config::load_config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONVEYOR_CONFIG").ok())
        .unwrap_or_else(|| "conveyor.yaml".to_string());
    tracing::info!(config = %config_path, "conveyor starting");

    let config = load_config(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    let host = build_host(config).context("failed to assemble modules")?;
    host.init().await.context("module init failed")?;
    host.start().await.context("module start failed")?;
    tracing::info!("all modules started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    host.stop().await;
    Ok(())
}
