//! # Parley Server
//!
//! Two-party realtime chat server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (SQLite file ./parley.db)
//! parley
//!
//! # Run with a custom config file
//! PARLEY_CONFIG=/path/to/parley.toml parley
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 PARLEY_STORE__URL=memory parley
//! ```

use anyhow::Result;
use parley_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
    }

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
