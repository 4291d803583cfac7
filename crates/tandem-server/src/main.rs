//! # Tandem Server
//!
//! Real-time two-party chat server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file
//! TANDEM_CONFIG=/path/to/tandem.toml tandem
//!
//! # Override settings with environment variables
//! TANDEM__PORT=8080 TANDEM__AUTH__JWT_SECRET=change-me tandem
//! ```

mod api;
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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=debug,tandem_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Tandem server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
