use anyhow::{Context, Result};
use openheart_core::Config;
use openheart_db::SqlitePool;
use std::time::Duration;

/// Open the store and apply pending migrations.
pub async fn setup_database(config: &Config) -> Result<SqlitePool> {
    tracing::info!(url = %config.database_url, "Connecting to database...");
    let pool = openheart_db::connect(
        &config.database_url,
        config.db_max_connections,
        Duration::from_secs(config.db_timeout_seconds),
    )
    .await
    .context("Failed to open database")?;
    tracing::info!("Database connected and migrated");
    Ok(pool)
}
