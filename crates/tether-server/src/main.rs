//! # Tether Server
//!
//! Presence tracking and targeted notification server for long-lived agent
//! connections.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (0.0.0.0:3000)
//! tether
//!
//! # Run with a config file in the working directory
//! cp tether.example.toml tether.toml && tether
//!
//! # Run with environment variables
//! TETHER_PORT=8080 TETHER_HOST=127.0.0.1 tether
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tether=debug,tether_core=debug,tether_transport=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Tether server on {}:{}", config.host, config.port);

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
