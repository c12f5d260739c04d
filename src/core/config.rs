//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML files with CLI overrides. Every section
//! has defaults, so an empty file describes a single ACL-less server.

use crate::cluster::version::{Version, DEFAULT_SERVER_VERSION};
use crate::core::time::millis;
use crate::service::QuerySettings;
use crate::vars::model::LockDefaults;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound on `locks.max_ttl_ms`.
pub const MAX_LOCK_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Upper bound on `query.max_query_time_ms`.
pub const MAX_QUERY_TIME_MS: u64 = 60 * 60 * 1000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Identity of this server.
    #[serde(default)]
    pub server: ServerConfig,

    /// Lock defaults and TTL bounds.
    #[serde(default)]
    pub locks: LocksConfig,

    /// Blocking query and pagination limits.
    #[serde(default)]
    pub query: QueryConfig,

    /// Root key management.
    #[serde(default)]
    pub keyring: KeyringConfig,

    /// Access control.
    #[serde(default)]
    pub acl: AclConfig,

    /// Telemetry and logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Server identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Node name advertised to the membership list.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Region this server belongs to.
    #[serde(default = "default_region")]
    pub region: String,

    /// Version this server advertises for feature gates.
    #[serde(default = "default_server_version")]
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            region: default_region(),
            version: default_server_version(),
        }
    }
}

/// Lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    /// TTL applied when a lock is acquired without one.
    #[serde(default = "default_lock_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Lock delay applied when a lock is acquired without one.
    #[serde(default = "default_lock_delay_ms")]
    pub default_lock_delay_ms: u64,

    /// Smallest TTL a client may request.
    #[serde(default = "default_min_ttl_ms")]
    pub min_ttl_ms: u64,

    /// Largest TTL (and lock delay) a client may request.
    #[serde(default = "default_max_ttl_ms")]
    pub max_ttl_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl_ms(),
            default_lock_delay_ms: default_lock_delay_ms(),
            min_ttl_ms: default_min_ttl_ms(),
            max_ttl_ms: default_max_ttl_ms(),
        }
    }
}

/// Blocking query configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Wait applied when a blocking query does not set one.
    #[serde(default = "default_max_query_time_ms")]
    pub default_max_query_time_ms: u64,

    /// Upper bound on any blocking query wait.
    #[serde(default = "default_query_time_limit_ms")]
    pub max_query_time_ms: u64,

    /// Jitter added to waits is `wait / jitter_fraction` at most.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: u32,

    /// Page size used when a list does not set one (0 = unlimited).
    #[serde(default)]
    pub default_per_page: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_max_query_time_ms: default_max_query_time_ms(),
            max_query_time_ms: default_query_time_limit_ms(),
            jitter_fraction: default_jitter_fraction(),
            default_per_page: 0,
        }
    }
}

/// Keyring configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyringConfig {
    /// Rotate the active key after this many encryptions (0 = never).
    #[serde(default)]
    pub rotation_threshold: u64,
}

/// ACL configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclConfig {
    /// Enforce ACLs. When disabled every caller is treated as management.
    #[serde(default)]
    pub enabled: bool,

    /// Secret registered as a management token at startup.
    #[serde(default)]
    pub bootstrap_token: Option<String>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_node_name() -> String {
    "server-1".to_string()
}

fn default_region() -> String {
    "global".to_string()
}

fn default_server_version() -> String {
    DEFAULT_SERVER_VERSION.to_string()
}

fn default_lock_ttl_ms() -> u64 {
    15_000
}

fn default_lock_delay_ms() -> u64 {
    15_000
}

fn default_min_ttl_ms() -> u64 {
    1_000
}

fn default_max_ttl_ms() -> u64 {
    86_400_000
}

fn default_max_query_time_ms() -> u64 {
    300_000
}

fn default_query_time_limit_ms() -> u64 {
    600_000
}

fn default_jitter_fraction() -> u32 {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref node_name) = overrides.node_name {
            self.server.node_name = node_name.clone();
        }
        if let Some(ref region) = overrides.region {
            self.server.region = region.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_server()?;
        self.validate_locks()?;
        self.validate_query()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        if self.server.node_name.is_empty() {
            anyhow::bail!("server.node_name must not be empty");
        }
        if self.server.region.is_empty() {
            anyhow::bail!("server.region must not be empty");
        }
        Version::parse(&self.server.version)
            .with_context(|| format!("server.version is invalid: {}", self.server.version))?;
        Ok(())
    }

    fn validate_locks(&self) -> Result<()> {
        let locks = &self.locks;
        if locks.min_ttl_ms == 0 {
            anyhow::bail!("locks.min_ttl_ms must be > 0");
        }
        if locks.max_ttl_ms > MAX_LOCK_TTL_MS {
            anyhow::bail!(
                "locks.max_ttl_ms ({}) cannot exceed {} (7 days)",
                locks.max_ttl_ms,
                MAX_LOCK_TTL_MS
            );
        }
        if locks.min_ttl_ms > locks.max_ttl_ms {
            anyhow::bail!(
                "locks.min_ttl_ms ({}) cannot exceed locks.max_ttl_ms ({})",
                locks.min_ttl_ms,
                locks.max_ttl_ms
            );
        }
        if locks.default_ttl_ms < locks.min_ttl_ms || locks.default_ttl_ms > locks.max_ttl_ms {
            anyhow::bail!(
                "locks.default_ttl_ms ({}) must be within [{}, {}]",
                locks.default_ttl_ms,
                locks.min_ttl_ms,
                locks.max_ttl_ms
            );
        }
        if locks.default_lock_delay_ms > locks.max_ttl_ms {
            anyhow::bail!(
                "locks.default_lock_delay_ms ({}) cannot exceed locks.max_ttl_ms ({})",
                locks.default_lock_delay_ms,
                locks.max_ttl_ms
            );
        }
        Ok(())
    }

    fn validate_query(&self) -> Result<()> {
        if self.query.max_query_time_ms == 0 {
            anyhow::bail!("query.max_query_time_ms must be > 0");
        }
        if self.query.max_query_time_ms > MAX_QUERY_TIME_MS {
            anyhow::bail!(
                "query.max_query_time_ms ({}) cannot exceed {} (1 hour)",
                self.query.max_query_time_ms,
                MAX_QUERY_TIME_MS
            );
        }
        if self.query.default_max_query_time_ms > self.query.max_query_time_ms {
            anyhow::bail!(
                "query.default_max_query_time_ms ({}) cannot exceed query.max_query_time_ms ({})",
                self.query.default_max_query_time_ms,
                self.query.max_query_time_ms
            );
        }
        if self.query.jitter_fraction == 0 {
            anyhow::bail!("query.jitter_fraction must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    /// Lock defaults and bounds derived from `[locks]`.
    pub fn lock_defaults(&self) -> LockDefaults {
        LockDefaults {
            default_ttl: millis(self.locks.default_ttl_ms),
            default_lock_delay: millis(self.locks.default_lock_delay_ms),
            min_ttl: millis(self.locks.min_ttl_ms),
            max_ttl: millis(self.locks.max_ttl_ms),
        }
    }

    /// Blocking query settings derived from `[query]`.
    pub fn query_settings(&self) -> QuerySettings {
        QuerySettings {
            default_max_query_time: millis(self.query.default_max_query_time_ms),
            max_query_time: millis(self.query.max_query_time_ms),
            jitter_fraction: self.query.jitter_fraction,
            default_per_page: self.query.default_per_page,
        }
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override node name.
    pub node_name: Option<String>,
    /// Override region.
    pub region: Option<String>,
}
