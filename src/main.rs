//! llm-hub - HTTP server entry point.
//!
//! Binds the gateway API on localhost and runs until interrupted.

use llm_hub::{api, config::Config, vault};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_hub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        host = %config.host,
        port = config.port,
        database = %config.database_path.display(),
        "Loaded configuration"
    );

    // Materialize the credential encryption key (generated and persisted on first run)
    let key = vault::load_or_create_secret_key(&config.env_file).await?;
    let vault = vault::Vault::new(key);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting server on {}", addr);

    api::serve(config, vault).await?;

    Ok(())
}
