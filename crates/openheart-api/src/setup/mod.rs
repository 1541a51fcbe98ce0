//! Application setup: database, collaborators, state and routes.

pub mod database;
pub mod routes;
pub mod server;

use crate::auth::SessionKeys;
use crate::mailer::sender_from_config;
use crate::state::AppState;
use anyhow::Context;
use axum::Router;
use openheart_archive::XnatClient;
use openheart_core::Config;
use openheart_db::{FileRepository, UserRepository};
use openheart_processing::ContainerConverter;
use openheart_services::{LifecycleConfig, SyncConfig, UploadLifecycle};
use std::sync::Arc;

/// Build the state and router for `config`.
pub async fn initialize_app(config: &Config) -> anyhow::Result<(Arc<AppState>, Router)> {
    for dir in [&config.data_path, &config.temp_path, &config.preview_path] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let pool = database::setup_database(config).await?;
    let users = UserRepository::new(pool.clone());
    let files = FileRepository::new(pool.clone());

    let archive = XnatClient::from_config(&config.archive)
        .context("Failed to create archive client")?;
    tracing::info!(server = %config.archive.server_url, "Archive client ready");
    let converter = ContainerConverter::from_config(&config.converter);

    let lifecycle = UploadLifecycle::new(
        users.clone(),
        files,
        Arc::new(converter),
        Arc::new(archive),
        SyncConfig::from_config(config),
        LifecycleConfig::from_config(config),
    );

    let state = Arc::new(AppState {
        pool,
        users,
        lifecycle,
        sessions: SessionKeys::new(&config.jwt_secret, config.jwt_expiry_hours),
        token_sender: sender_from_config(&config.smtp)?,
    });

    let router = routes::setup_routes(config, state.clone())?;
    Ok((state, router))
}
