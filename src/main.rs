use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod console;
mod db;
mod engine;
mod exchange;
mod metrics;
mod models;
mod notify;

use crate::config::AppConfig;
use crate::console::Console;
use crate::db::{Database, Ledger};
use crate::engine::GridEngine;
use crate::exchange::{ExchangeApi, UpbitClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting Gridbot v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    metrics::init(config.metrics_port)?;

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    tracing::info!("Database connected at {}", config.database_url);
    let ledger = Ledger::new(db.pool.clone());

    // Exchange client and engine
    let exchange: Arc<dyn ExchangeApi> =
        Arc::new(UpbitClient::new(&config.upbit_access_key, &config.upbit_secret_key));
    let engine = Arc::new(GridEngine::new(exchange.clone(), ledger.clone()));

    // Recovery must finish before the console may accept a start command.
    match engine.recover().await {
        Ok(report) => {
            tracing::info!(
                "✅ Recovery: {} closed, {} repaired, {} pending adopted",
                report.closed,
                report.repaired,
                report.adopted_pending
            );
            if engine.snapshot().await.config.is_some() {
                tracing::info!("Stored grid config found; issue START to resume trading");
            }
        }
        Err(e) => {
            tracing::error!("State recovery failed: {}", e);
            tracing::warn!("Continuing without recovery; manual check recommended");
        }
    }

    let console = Arc::new(Console::new(engine.clone(), ledger, exchange));
    if let Some(admin) = &config.admin_user_id {
        tracing::info!("Operator console bound to admin {}", admin);
    }
    if let Some(channel) = &config.notify_channel_id {
        tracing::info!("Notifications will be pushed to {}", channel);
    }

    // Forward notifications to the log; the chat transport subscribes the
    // same way and pushes to config.notify_channel_id.
    let mut notifications = console.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = notifications.recv().await {
            tracing::info!("{}", event);
        }
    });

    tracing::info!("Operator console ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    console.stop().await;

    Ok(())
}
