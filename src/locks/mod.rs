//! Variable lock timers.
//!
//! - [`registry`] - Leader-local TTL timers and lock-delay windows
//!
//! The service talks to timers through [`VariableTimers`]. [`LeaderTimers`]
//! implements it by delegating to the registry installed for the current
//! leadership term, and refuses with `NotLeader` between terms.

pub mod registry;

pub use registry::{LockTimerConfig, LockTimerRegistry, LockTimerStats};

use crate::core::error::{VarError, VarResult};
use crate::vars::model::{VarKey, VariableLock};
use parking_lot::RwLock;
use std::sync::Arc;

/// Timer operations needed by the variables service.
pub trait VariableTimers: Send + Sync {
    /// Start the TTL timer for a freshly acquired lock.
    fn create_timer(&self, key: &VarKey, lock: &VariableLock) -> VarResult<()>;

    /// Extend the timer guarding `lock_id`. `LockNotFound` if none does.
    fn renew_timer(&self, key: &VarKey, lock_id: &str) -> VarResult<()>;

    /// Stop the timer of a released lock and open its delay window.
    fn release_timer(&self, key: &VarKey, lock: &VariableLock) -> VarResult<()>;

    /// Check if new locks on `key` must wait for a delay window.
    fn in_lock_delay(&self, key: &VarKey) -> VarResult<bool>;

    /// Check if this node currently runs lock timers.
    fn is_leader(&self) -> bool;
}

/// Slot holding the registry of the current leadership term.
#[derive(Default)]
pub struct LeaderTimers {
    registry: RwLock<Option<Arc<LockTimerRegistry>>>,
}

impl LeaderTimers {
    /// Create an empty slot (not leader).
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the registry for a new term, shutting down any previous one.
    pub fn install(&self, registry: Arc<LockTimerRegistry>) {
        if let Some(previous) = self.registry.write().replace(registry) {
            previous.shutdown();
        }
    }

    /// Remove and shut down the current registry.
    pub fn revoke(&self) -> Option<Arc<LockTimerRegistry>> {
        let previous = self.registry.write().take();
        if let Some(ref registry) = previous {
            registry.shutdown();
        }
        previous
    }

    /// Registry of the current term.
    pub fn current(&self) -> Option<Arc<LockTimerRegistry>> {
        self.registry.read().clone()
    }

    fn leader(&self) -> VarResult<Arc<LockTimerRegistry>> {
        self.current().ok_or(VarError::NotLeader)
    }
}

impl VariableTimers for LeaderTimers {
    fn create_timer(&self, key: &VarKey, lock: &VariableLock) -> VarResult<()> {
        self.leader()?.create_timer(key, lock);
        Ok(())
    }

    fn renew_timer(&self, key: &VarKey, lock_id: &str) -> VarResult<()> {
        self.leader()?.renew_timer(key, lock_id)
    }

    fn release_timer(&self, key: &VarKey, lock: &VariableLock) -> VarResult<()> {
        self.leader()?.release_timer(key, lock);
        Ok(())
    }

    fn in_lock_delay(&self, key: &VarKey) -> VarResult<bool> {
        Ok(self.leader()?.in_lock_delay(key))
    }

    fn is_leader(&self) -> bool {
        self.registry.read().is_some()
    }
}
