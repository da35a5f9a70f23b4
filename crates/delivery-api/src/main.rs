//! Delivery service CLI entry point.
//!
//! Binary name: `dsvc`
//!
//! Parses CLI arguments, initializes tracing, then dispatches to the command
//! handler.

mod cli;

use std::path::PathBuf;

use clap::Parser;
use delivery_infra::config::CONFIG_FILE_NAME;
use delivery_observe::tracing_setup::{init_tracing, shutdown_tracing};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,delivery_core=debug",
        _ => "trace",
    };
    init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    let result = match cli.command {
        Commands::Demo(args) => cli::demo::run(&config_path, args, cli.json).await,
        Commands::Config { check } => cli::config::show(&config_path, check, cli.json).await,
    };

    shutdown_tracing();
    result
}
