//! The variables service.
//!
//! [`VariablesService`] implements the client-facing operations on top of
//! its collaborators: the replicated log and state store, the encrypter, the
//! authorizer, cluster membership and the leader's lock timers.
//!
//! - [`apply`] - Set, CAS, Delete, DeleteCAS, LockAcquire, LockRelease
//! - [`read`] - Read, List, ListAll and RenewLock
//! - [`blocking`] - Blocking query loop and wait computation

pub mod apply;
pub mod blocking;
pub mod read;

use crate::acl::{Acl, Authorizer, Identity};
use crate::cluster::{servers_meet_minimum_version, Membership, Version};
use crate::core::error::{VarError, VarResult};
use crate::core::time::Clock;
use crate::crypto::Encrypter;
use crate::locks::VariableTimers;
use crate::state::log::RaftApplier;
use crate::state::store::VariableStateStore;
use crate::vars::model::{LockDefaults, DEFAULT_NAMESPACE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Blocking query and pagination settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySettings {
    /// Wait used when a query sets none.
    pub default_max_query_time: Duration,
    /// Upper bound on any wait.
    pub max_query_time: Duration,
    /// Jitter is at most `wait / jitter_fraction`.
    pub jitter_fraction: u32,
    /// Page size used when a list sets none (0 = unlimited).
    pub default_per_page: u32,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_max_query_time: Duration::from_secs(300),
            max_query_time: Duration::from_secs(600),
            jitter_fraction: 16,
            default_per_page: 0,
        }
    }
}

/// Service settings.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Region whose servers gate feature versions.
    pub region: String,
    /// Lock defaults and bounds.
    pub lock_defaults: LockDefaults,
    /// Blocking query settings.
    pub query: QuerySettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            region: "global".to_string(),
            lock_defaults: LockDefaults::default(),
            query: QuerySettings::default(),
        }
    }
}

/// Collaborators of the service.
#[derive(Clone)]
pub struct ServiceDeps {
    /// State projection read by queries.
    pub store: Arc<VariableStateStore>,
    /// Log that mutations are submitted to.
    pub raft: Arc<dyn RaftApplier>,
    /// Payload encryption.
    pub encrypter: Arc<dyn Encrypter>,
    /// Identity resolution.
    pub authorizer: Arc<dyn Authorizer>,
    /// Server list for version gates.
    pub membership: Arc<dyn Membership>,
    /// Lock timers of the current leader.
    pub timers: Arc<dyn VariableTimers>,
    /// Wall clock for create and modify times.
    pub clock: Arc<dyn Clock>,
}

/// Service statistics.
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    /// Apply calls that committed.
    pub applied: u64,
    /// Apply calls answered with a conflict.
    pub conflicts: u64,
    /// Conflicts returned redacted.
    pub redacted: u64,
    /// Read calls.
    pub reads: u64,
    /// List calls.
    pub lists: u64,
    /// Successful lock renewals.
    pub renewals: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    conflicts: AtomicU64,
    redacted: AtomicU64,
    reads: AtomicU64,
    lists: AtomicU64,
    renewals: AtomicU64,
}

/// Variables RPC service.
pub struct VariablesService {
    store: Arc<VariableStateStore>,
    raft: Arc<dyn RaftApplier>,
    encrypter: Arc<dyn Encrypter>,
    authorizer: Arc<dyn Authorizer>,
    membership: Arc<dyn Membership>,
    timers: Arc<dyn VariableTimers>,
    clock: Arc<dyn Clock>,
    settings: ServiceSettings,
    counters: Counters,
}

impl VariablesService {
    /// Create a service.
    pub fn new(deps: ServiceDeps, settings: ServiceSettings) -> Self {
        Self {
            store: deps.store,
            raft: deps.raft,
            encrypter: deps.encrypter,
            authorizer: deps.authorizer,
            membership: deps.membership,
            timers: deps.timers,
            clock: deps.clock,
            settings,
            counters: Counters::default(),
        }
    }

    /// Service settings.
    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Get statistics.
    pub fn stats(&self) -> ServiceStats {
        let c = &self.counters;
        ServiceStats {
            applied: c.applied.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            redacted: c.redacted.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            lists: c.lists.load(Ordering::Relaxed),
            renewals: c.renewals.load(Ordering::Relaxed),
        }
    }

    fn resolve(&self, identity: &Identity) -> VarResult<Arc<Acl>> {
        self.authorizer.resolve(identity)
    }

    /// Fail unless every server in the region runs at least `min`.
    fn require_version(&self, min: &Version, feature: &str) -> VarResult<()> {
        let members = self.membership.members();
        if servers_meet_minimum_version(&members, &self.settings.region, min, true) {
            Ok(())
        } else {
            Err(VarError::VersionMismatch {
                min_version: min.to_string(),
                feature: feature.to_string(),
            })
        }
    }
}

/// Namespace a request targets: the explicit one, else the default.
fn target_namespace(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}
