//! stackd - single-host infrastructure stack daemon
//!
//! Provisions and manages composite infrastructure stacks (HA PostgreSQL
//! clusters, Nginx gateways, plain container services) on a Docker host,
//! exposing a REST API plus a live event stream.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "stackd")]
#[command(about = "Composite infrastructure stack provisioning daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "stackd.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("stackd={}", log_level).into()),
        )
        .init();

    info!("Starting stackd v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run(&cli.config).await?;
        }
        None => {
            // Default: run the daemon
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("Daemon error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
