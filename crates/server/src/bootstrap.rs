use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use procura_core::config::AppConfig;
use procura_core::documents::{DocumentPipeline, NoopDocumentPipeline};
use procura_db::{connect_with_settings, migrations, ApprovalEngine, DbPool};
use procura_docs::DocumentService;

/// Shared application state handed to the HTTP layer.
pub struct AppContext {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<ApprovalEngine>,
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<AppContext> {
    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .context("database connection failed")?;

    migrations::run_pending(&db_pool).await.context("database migration failed")?;

    let documents: Arc<dyn DocumentPipeline> = match DocumentService::from_config(&config) {
        Ok(service) => Arc::new(service),
        Err(error) => {
            warn!(error = %error, "document pipeline unavailable; falling back to noop");
            Arc::new(NoopDocumentPipeline)
        }
    };

    let engine = Arc::new(ApprovalEngine::new(db_pool.clone(), documents));

    Ok(AppContext { config, db_pool, engine })
}
