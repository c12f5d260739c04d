//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use varvault::acl::{Identity, TokenStore};
use varvault::cluster::{ServerMember, StaticMembership, Version};
use varvault::core::config::Config;
use varvault::core::time::{Clock, ManualClock};
use varvault::crypto::Keyring;
use varvault::locks::{LeaderTimers, LockTimerConfig, LockTimerRegistry};
use varvault::service::{ServiceDeps, ServiceSettings, VariablesService};
use varvault::state::{LocalLog, RaftApplier, VariableStateStore};
use varvault::vars::{VarApplyRequest, VariableDecrypted, VariableItems, VariableLock};

/// Secret of the management token registered by [`Harness::with_acl`].
pub const MANAGEMENT_TOKEN: &str = "root-secret";

/// Wall-clock start used by the harness clock (2024-01-01T00:00:00Z).
pub const START_NANOS: i64 = 1_704_067_200_000_000_000;

/// Wall clock that moves with the Tokio timer, plus manual offsets.
///
/// Lock-delay windows are checked against wall-clock stamps, so tests that
/// drive paused Tokio time need a wall clock that follows it.
pub struct TestClock {
    offset: ManualClock,
    start: tokio::time::Instant,
}

impl TestClock {
    /// Must be called inside a Tokio runtime.
    pub fn new(nanos: i64) -> Self {
        Self {
            offset: ManualClock::new(nanos),
            start: tokio::time::Instant::now(),
        }
    }

    /// Move the clock forward without touching Tokio time.
    pub fn advance(&self, by: Duration) {
        self.offset.advance(by);
    }
}

impl Clock for TestClock {
    fn now_unix_nanos(&self) -> i64 {
        let elapsed = i64::try_from(self.start.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.offset.now_unix_nanos().saturating_add(elapsed)
    }
}

/// A fully wired single-server variables service.
///
/// Must be built inside a Tokio runtime: lock timers are installed on it.
pub struct Harness {
    pub store: Arc<VariableStateStore>,
    pub log: Arc<LocalLog>,
    pub keyring: Arc<Keyring>,
    pub tokens: Arc<TokenStore>,
    pub membership: Arc<StaticMembership>,
    pub timers: Arc<LeaderTimers>,
    pub clock: Arc<TestClock>,
    pub service: Arc<VariablesService>,
}

impl Harness {
    /// ACLs disabled: every caller is management.
    pub fn new() -> Self {
        Self::build(false, ServiceSettings::default())
    }

    /// ACLs enabled with [`MANAGEMENT_TOKEN`] registered.
    pub fn with_acl() -> Self {
        Self::build(true, ServiceSettings::default())
    }

    /// ACLs disabled, custom settings.
    pub fn with_settings(settings: ServiceSettings) -> Self {
        Self::build(false, settings)
    }

    /// ACLs disabled, custom settings, every mutation submitted through
    /// `wrap(log)` instead of straight to the log.
    pub fn with_raft(
        settings: ServiceSettings,
        wrap: impl FnOnce(Arc<LocalLog>) -> Arc<dyn RaftApplier>,
    ) -> Self {
        let store = Arc::new(VariableStateStore::new());
        let log = Arc::new(LocalLog::new(Arc::clone(&store)));
        let raft = wrap(log.clone());
        Self::assemble(false, settings, store, log, raft)
    }

    fn build(acl: bool, settings: ServiceSettings) -> Self {
        let store = Arc::new(VariableStateStore::new());
        let log = Arc::new(LocalLog::new(Arc::clone(&store)));
        let raft: Arc<dyn RaftApplier> = log.clone();
        Self::assemble(acl, settings, store, log, raft)
    }

    fn assemble(
        acl: bool,
        settings: ServiceSettings,
        store: Arc<VariableStateStore>,
        log: Arc<LocalLog>,
        raft: Arc<dyn RaftApplier>,
    ) -> Self {
        let keyring = Arc::new(Keyring::new(0));
        let tokens = Arc::new(TokenStore::new(acl));
        tokens.insert_management(MANAGEMENT_TOKEN);
        let membership = Arc::new(StaticMembership::new(vec![ServerMember::new(
            "server-1",
            settings.region.clone(),
            Version::new(1, 8, 0),
        )]));
        let timers = Arc::new(LeaderTimers::new());
        let clock = Arc::new(TestClock::new(START_NANOS));
        let registry = LockTimerRegistry::new(
            Arc::clone(&raft),
            LockTimerConfig::from(&settings.lock_defaults),
            clock.clone(),
        )
        .expect("tokio runtime");
        timers.install(Arc::new(registry));

        let deps = ServiceDeps {
            store: Arc::clone(&store),
            raft,
            encrypter: keyring.clone(),
            authorizer: tokens.clone(),
            membership: membership.clone(),
            timers: timers.clone(),
            clock: clock.clone(),
        };
        let service = Arc::new(VariablesService::new(deps, settings));

        Self {
            store,
            log,
            keyring,
            tokens,
            membership,
            timers,
            clock,
            service,
        }
    }

    /// Write `items` to `path` in the default namespace as management.
    pub fn set(&self, path: &str, pairs: &[(&str, &str)]) -> u64 {
        let var = VariableDecrypted::new("default", path, items(pairs));
        let resp = self
            .service
            .apply(VarApplyRequest::set(var, management()))
            .expect("set");
        assert!(resp.is_ok(), "set {path} conflicted: {resp:?}");
        resp.index
    }

    /// Acquire a lock on `path` as management, returning the lock ID.
    pub fn acquire(&self, path: &str, ttl: Duration, delay: Duration) -> String {
        let var = VariableDecrypted::new("default", path, VariableItems::new())
            .with_lock(VariableLock::new(ttl, delay));
        let resp = self
            .service
            .apply(VarApplyRequest::lock_acquire(var, management()))
            .expect("lock acquire");
        assert!(resp.is_ok(), "acquire {path} conflicted: {resp:?}");
        resp.output
            .and_then(|o| o.metadata.lock)
            .map(|l| l.id)
            .expect("holder sees lock id")
    }
}

/// Build an item map from pairs.
pub fn items(pairs: &[(&str, &str)]) -> VariableItems {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Identity presenting the management token.
pub fn management() -> Identity {
    Identity::token(MANAGEMENT_TOKEN)
}

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    write_config(
        r#"
[server]
node_name = "server-1"
region = "global"
"#,
    )
}

/// Write `content` to a temporary config file.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load a config from a temp file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

/// Assert that a result is Ok and return the value.
#[track_caller]
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert that a result is Err.
#[track_caller]
pub fn assert_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
        Err(e) => e,
    }
}
