use anyhow::Context;
use openheart_core::Config;
use openheart_infra::{init_telemetry, LogFormat};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let log_format: LogFormat = std::env::var("LOG_FORMAT")
        .unwrap_or_default()
        .parse()
        .context("Invalid LOG_FORMAT")?;
    init_telemetry(log_format)?;

    // Initialize the application (database, archive client, routes)
    let (_state, router) = openheart_api::setup::initialize_app(&config).await?;

    openheart_api::setup::server::start_server(&config, router).await?;

    Ok(())
}
