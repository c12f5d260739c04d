//! Command-line interface.
//!
//! Unified CLI for the variables server.

pub mod commands;

use clap::{Parser, Subcommand};

/// Varvault - replicated, encrypted variable store with distributed locks.
#[derive(Parser, Debug)]
#[command(name = "varvault")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the variables server.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}
