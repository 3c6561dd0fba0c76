//! agui-bridge - HTTP Server Entry Point
//!
//! Starts the HTTP server that streams agent runs to AG-UI clients.

use agui_bridge::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agui_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: store={:?}, default_app={}, lock_timeout={:?}",
        config.store_type, config.default_app, config.lock_timeout
    );

    api::serve(config).await?;

    Ok(())
}
