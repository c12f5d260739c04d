//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/varvault.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults filled in.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/varvault.toml")]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    let config = Config::from_file(path)?;

    println!("✓ Config file is valid");
    if !config.acl.enabled {
        println!("  ⚠ Warning: ACLs disabled, every caller has management access");
    } else if config.acl.bootstrap_token.is_none() {
        println!("  ⚠ Warning: ACLs enabled without acl.bootstrap_token");
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    let rendered = match format {
        "json" => serde_json::to_string_pretty(&config)?,
        _ => toml::to_string_pretty(&config)?,
    };
    println!("{rendered}");
    Ok(())
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = config_template();
    match output {
        Some(path) => {
            std::fs::write(path, template)?;
            println!("Generated config template: {}", path.display());
        }
        None => println!("{template}"),
    }
    Ok(())
}

fn config_template() -> &'static str {
    r#"# Varvault Configuration

[server]
node_name = "server-1"
region = "global"

[locks]
default_ttl_ms = 15000
default_lock_delay_ms = 15000
min_ttl_ms = 1000
max_ttl_ms = 86400000

[query]
default_max_query_time_ms = 300000
max_query_time_ms = 600000
jitter_fraction = 16
default_per_page = 0

[keyring]
rotation_threshold = 0

[acl]
enabled = false

[telemetry]
log_level = "info"
"#
}
