//! Varvault - unified CLI entrypoint.
//!
//! Usage:
//!   varvault start --config config/varvault.toml
//!   varvault config validate --config config/varvault.toml
//!   varvault config show --config config/varvault.toml --format json
//!   varvault config generate --output config/varvault.toml

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use varvault::cli::commands::{run_config, run_start};
use varvault::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let explicit = cli.config.is_some();
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/varvault.toml"));

    match cli.command {
        Commands::Start(args) => run_start(args, &config_path, explicit, cli.log_level).await,
        Commands::Config(args) => run_config(args),
    }
}
