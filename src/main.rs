//! ilab-standalone CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level
    let cli = ilab_standalone::cli::parse_cli();

    // Initialize tracing with environment filter
    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    tokio::select! {
        result = ilab_standalone::cli::run_with_cli(cli) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; submitted workloads keep running in the cluster");
            anyhow::bail!("interrupted")
        }
    }
}
