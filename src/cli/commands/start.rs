//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start the variables server.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Override the node name.
    #[arg(long)]
    pub node_name: Option<String>,

    /// Override the region.
    #[arg(long)]
    pub region: Option<String>,
}

/// Initialize the tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` takes precedence over the configured level.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Load the config at `config_path`, or defaults when it is absent and was
/// not named explicitly.
fn load_config(config_path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !config_path.exists() {
        return Ok(Config::default());
    }
    Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))
}

/// Run the start command.
pub async fn run_start(
    args: StartArgs,
    config_path: &Path,
    explicit: bool,
    log_level: Option<String>,
) -> Result<()> {
    let mut config = load_config(config_path, explicit)?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        node_name: args.node_name,
        region: args.region,
    });
    config.validate()?;

    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
