mod bootstrap;
mod health;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use procura_core::config::{AppConfig, LoadOptions};
use procura_db::repositories::{SqlPurchaseRequestRepository, SqlUserRepository};

fn init_logging(config: &AppConfig) {
    use procura_core::config::LogFormat::{Compact, Json, Pretty};
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let state = Arc::new(routes::ApiState {
        engine: app.engine.clone(),
        users: SqlUserRepository::new(app.db_pool.clone()),
        requests: SqlPurchaseRequestRepository::new(app.db_pool.clone()),
    });

    let router = routes::router(state).merge(health::router(app.db_pool.clone()));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener =
        tokio::net::TcpListener::bind(&address).await.context("could not bind server address")?;

    tracing::info!(bind_address = %address, "procura-server started");

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("server terminated unexpectedly")?;

    tracing::info!("procura-server stopping");

    Ok(())
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
