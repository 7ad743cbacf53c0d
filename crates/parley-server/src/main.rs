//! # Parley Server
//!
//! Reference backend for Parley clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley-server
//!
//! # Run with environment overrides
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 parley-server
//! ```
//!
//! A `parley.toml` in the working directory, `/etc/parley/` or
//! `~/.config/parley/` is picked up automatically.

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
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
