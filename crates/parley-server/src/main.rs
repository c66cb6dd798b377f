//! # Parley Server
//!
//! Realtime chat, presence and call signaling for skill exchanges.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Configuration is read from the first of ./parley.toml,
//! # /etc/parley/parley.toml and ~/.config/parley/parley.toml
//! parley
//!
//! # Override any setting through the environment
//! PARLEY__PORT=8080 PARLEY__CRYPTO__MESSAGE_KEY=<base64> parley
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
