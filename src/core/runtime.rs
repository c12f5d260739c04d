//! Main runtime orchestration.
//!
//! The runtime owns every server component and wires them into a
//! [`VariablesService`]:
//! - Start order: state store → log → keyring → ACL → lock timers
//! - Shutdown order: lock timers → service stats flush
//!
//! This node always leads its single-node log, so lock timers are installed
//! on start and revoked on stop. `establish_leadership` and
//! `revoke_leadership` are public so embedders can drive term changes.

use crate::acl::TokenStore;
use crate::cluster::{ServerMember, StaticMembership, Version};
use crate::core::config::Config;
use crate::core::time::{Clock, SystemClock};
use crate::crypto::Keyring;
use crate::locks::{LeaderTimers, LockTimerConfig, LockTimerRegistry};
use crate::service::{ServiceDeps, ServiceSettings, VariablesService};
use crate::state::log::{LocalLog, RaftApplier};
use crate::state::store::VariableStateStore;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is degraded but functional.
    Degraded,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// State store and log.
    pub state: ComponentHealth,
    /// Lock timers; degraded while this node does not lead.
    pub lock_timers: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            state: ComponentHealth::Starting,
            lock_timers: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.state == ComponentHealth::Healthy
            && matches!(
                self.lock_timers,
                ComponentHealth::Healthy | ComponentHealth::Degraded
            )
    }
}

/// Variables server runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    store: Arc<VariableStateStore>,
    log: Arc<LocalLog>,
    keyring: Arc<Keyring>,
    tokens: Arc<TokenStore>,
    membership: Arc<StaticMembership>,
    timers: Arc<LeaderTimers>,
    clock: Arc<dyn Clock>,
    service: Arc<VariablesService>,
    health: RuntimeHealth,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let version = Version::parse(&config.server.version)?;
        let store = Arc::new(VariableStateStore::new());
        let log = Arc::new(LocalLog::new(Arc::clone(&store)));
        let keyring = Arc::new(Keyring::new(config.keyring.rotation_threshold));

        let tokens = Arc::new(TokenStore::new(config.acl.enabled));
        if let Some(ref token) = config.acl.bootstrap_token {
            tokens.insert_management(token.clone());
        }

        let membership = Arc::new(StaticMembership::new(vec![ServerMember::new(
            config.server.node_name.clone(),
            config.server.region.clone(),
            version,
        )]));
        let timers = Arc::new(LeaderTimers::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let deps = ServiceDeps {
            store: Arc::clone(&store),
            raft: log.clone(),
            encrypter: keyring.clone(),
            authorizer: tokens.clone(),
            membership: membership.clone(),
            timers: timers.clone(),
            clock: Arc::clone(&clock),
        };
        let settings = ServiceSettings {
            region: config.server.region.clone(),
            lock_defaults: config.lock_defaults(),
            query: config.query_settings(),
        };
        let service = Arc::new(VariablesService::new(deps, settings));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            store,
            log,
            keyring,
            tokens,
            membership,
            timers,
            clock,
            service,
            health: RuntimeHealth::default(),
            running: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Variables service.
    pub fn service(&self) -> &Arc<VariablesService> {
        &self.service
    }

    /// State store.
    pub fn store(&self) -> &Arc<VariableStateStore> {
        &self.store
    }

    /// Replicated log.
    pub fn log(&self) -> &Arc<LocalLog> {
        &self.log
    }

    /// Root keyring.
    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    /// ACL token table.
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Server membership.
    pub fn membership(&self) -> &Arc<StaticMembership> {
        &self.membership
    }

    /// Lock timer slot.
    pub fn timers(&self) -> &Arc<LeaderTimers> {
        &self.timers
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Start serving: take leadership of the local log.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            node = %self.config.server.node_name,
            region = %self.config.server.region,
            version = %self.config.server.version,
            acl = self.tokens.is_enabled(),
            "starting variables server"
        );
        self.health.state = ComponentHealth::Healthy;

        self.establish_leadership()
            .context("failed to start lock timers")?;
        self.health.lock_timers = ComponentHealth::Healthy;

        self.running.store(true, Ordering::Release);
        tracing::info!("variables server started");
        Ok(())
    }

    /// Install lock timers for a new leadership term.
    ///
    /// Every variable still holding a lock gets a fresh full TTL.
    pub fn establish_leadership(&self) -> Result<usize> {
        let applier: Arc<dyn RaftApplier> = self.log.clone();
        let registry = LockTimerRegistry::new(
            applier,
            LockTimerConfig::from(&self.config.lock_defaults()),
            Arc::clone(&self.clock),
        )?;
        let restored = registry.restore(&self.store.locked_variables());
        self.timers.install(Arc::new(registry));
        tracing::info!(restored, "established leadership");
        Ok(restored)
    }

    /// Stop every lock timer; locks stay in the state until a new leader
    /// restores them.
    pub fn revoke_leadership(&self) {
        if self.timers.revoke().is_some() {
            tracing::info!("revoked leadership");
        }
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until SIGINT or [`Runtime::shutdown`].
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all runtime components.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping variables server");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.health.lock_timers = ComponentHealth::Stopping;
        self.revoke_leadership();
        self.health.lock_timers = ComponentHealth::Stopped;

        let stats = self.service.stats();
        let store = self.store.stats();
        tracing::info!(
            applied = stats.applied,
            conflicts = stats.conflicts,
            variables = store.variables,
            latest_index = store.latest_index,
            "variables server stopped"
        );
        self.health.state = ComponentHealth::Stopped;
        Ok(())
    }
}
