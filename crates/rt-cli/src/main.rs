//! RTunnel CLI
//!
//! Command-line interface for the RTunnel WebRTC TCP tunnel.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};
use rt_daemon::TunnelMode;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins when set
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Execute command
    match cli.command {
        Commands::Listen => cli::run::run(cli.config, TunnelMode::Listen).await?,
        Commands::Send => cli::run::run(cli.config, TunnelMode::Send).await?,
    }

    Ok(())
}
