//! Leader-local lock TTL timers.
//!
//! Each locked variable has one timer keyed by `(namespace, path)` and tagged
//! with the lock ID it guards. A timer that runs out without renewal submits a
//! `LockExpire` entry to the log and opens the lock-delay window for the path.
//!
//! All timer map changes happen under a single mutex. Every (re)schedule gets
//! a fresh generation number, and a firing timer only acts if its generation
//! is still current, so a renew racing an expiry has exactly one winner: the
//! loser sees the other's effect (a missing timer, or a stale generation).
//!
//! The delay windows kept here only spare the log acquires that would be
//! refused anyway: the state machine records every window from the entry's
//! wall-clock stamp and refuses acquires stamped inside it. Windows that
//! closed are swept
//! as the map grows and when statistics are read.

use crate::core::error::{VarError, VarResult};
use crate::core::time::{deadline_after, Clock};
use crate::state::log::RaftApplier;
use crate::state::store::{StateOutcome, VarApplyStateRequest};
use crate::vars::model::{short_lock_id, LockDefaults, VarKey, VariableEncrypted, VariableLock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Attempts made to commit an expiry before giving up.
pub const MAX_EXPIRE_ATTEMPTS: u32 = 6;

/// Delay-map size below which closed windows are left for later.
const MIN_DELAY_SWEEP: usize = 64;

/// Lock timer configuration.
#[derive(Debug, Clone)]
pub struct LockTimerConfig {
    /// TTL used when a lock carries none.
    pub default_ttl: Duration,
    /// Attempts to commit an expiry.
    pub max_expire_attempts: u32,
    /// Base back-off between expiry attempts, multiplied by the attempt number.
    pub retry_backoff: Duration,
}

impl Default for LockTimerConfig {
    fn default() -> Self {
        Self {
            default_ttl: LockDefaults::default().default_ttl,
            max_expire_attempts: MAX_EXPIRE_ATTEMPTS,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl From<&LockDefaults> for LockTimerConfig {
    fn from(defaults: &LockDefaults) -> Self {
        Self {
            default_ttl: defaults.default_ttl,
            ..Self::default()
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct LockTimerStats {
    /// Running timers.
    pub active_timers: usize,
    /// Paths inside a lock-delay window.
    pub delayed_paths: usize,
    /// Timers created.
    pub created: u64,
    /// Successful renewals.
    pub renewed: u64,
    /// Expiries committed.
    pub expired: u64,
    /// Expiries abandoned after every attempt failed.
    pub expire_failures: u64,
}

struct LockTimer {
    lock: VariableLock,
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

struct RegistryInner {
    timers: HashMap<VarKey, LockTimer>,
    /// Paths that may not be locked again before the instant.
    delays: HashMap<VarKey, Instant>,
    /// Map size at which closed windows are next swept.
    sweep_at: usize,
    next_generation: u64,
}

struct Shared {
    inner: Mutex<RegistryInner>,
    applier: Arc<dyn RaftApplier>,
    clock: Arc<dyn Clock>,
    config: LockTimerConfig,
    runtime: Handle,
    created: AtomicU64,
    renewed: AtomicU64,
    expired: AtomicU64,
    expire_failures: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for (_, timer) in self.inner.get_mut().timers.drain() {
            timer.handle.abort();
        }
    }
}

/// Timers for every lock held while this node leads.
pub struct LockTimerRegistry {
    shared: Arc<Shared>,
}

impl LockTimerRegistry {
    /// Create an empty registry on the current Tokio runtime.
    ///
    /// `clock` stamps expiry entries and must be the clock the service
    /// stamps writes with.
    pub fn new(
        applier: Arc<dyn RaftApplier>,
        config: LockTimerConfig,
        clock: Arc<dyn Clock>,
    ) -> VarResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| VarError::internal(format!("lock timers need a tokio runtime: {e}")))?;
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(RegistryInner {
                    timers: HashMap::new(),
                    delays: HashMap::new(),
                    sweep_at: MIN_DELAY_SWEEP,
                    next_generation: 0,
                }),
                applier,
                clock,
                config,
                runtime,
                created: AtomicU64::new(0),
                renewed: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                expire_failures: AtomicU64::new(0),
            }),
        })
    }

    /// Start, or replace, the timer for `lock` on `key`.
    ///
    /// A new lock on the path ends any lock-delay window still recorded.
    pub fn create_timer(&self, key: &VarKey, lock: &VariableLock) {
        let mut inner = self.shared.inner.lock();
        inner.delays.remove(key);
        let timer = self.schedule(&mut inner, key, lock.clone());
        if let Some(old) = inner.timers.insert(key.clone(), timer) {
            old.handle.abort();
        }
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            namespace = %key.namespace,
            path = %key.path,
            lock_id = %lock.short_id(),
            ttl_ms = self.ttl_of(lock).as_millis() as u64,
            "lock timer started"
        );
    }

    /// Push the deadline of the timer guarding `lock_id` a full TTL out.
    ///
    /// Fails with `LockNotFound` when no timer guards that lock, which means
    /// it expired or was never taken. A mismatched ID leaves the timer as is.
    pub fn renew_timer(&self, key: &VarKey, lock_id: &str) -> VarResult<()> {
        let mut inner = self.shared.inner.lock();
        let lock = match inner.timers.get(key) {
            Some(timer) if timer.lock.id == lock_id => timer.lock.clone(),
            _ => {
                tracing::debug!(
                    namespace = %key.namespace,
                    path = %key.path,
                    lock_id = %short_lock_id(lock_id),
                    "lock renewal rejected, no matching timer"
                );
                return Err(VarError::LockNotFound);
            }
        };
        let timer = self.schedule(&mut inner, key, lock);
        if let Some(old) = inner.timers.insert(key.clone(), timer) {
            old.handle.abort();
        }
        self.shared.renewed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop the timer for a lock that was released, and open its delay window.
    pub fn release_timer(&self, key: &VarKey, lock: &VariableLock) {
        let mut inner = self.shared.inner.lock();
        if let Some(timer) = inner.timers.remove(key) {
            timer.handle.abort();
        }
        inner.open_delay(key, lock.lock_delay);
        tracing::debug!(
            namespace = %key.namespace,
            path = %key.path,
            lock_id = %lock.short_id(),
            delay_ms = lock.lock_delay.as_millis() as u64,
            "lock timer released"
        );
    }

    /// Drop the timer for `key` without opening a delay window.
    pub fn remove_timer(&self, key: &VarKey) -> bool {
        let removed = self.shared.inner.lock().timers.remove(key);
        match removed {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Check if `key` is inside a lock-delay window.
    pub fn in_lock_delay(&self, key: &VarKey) -> bool {
        let mut inner = self.shared.inner.lock();
        match inner.delays.get(key) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                inner.delays.remove(key);
                false
            }
            None => false,
        }
    }

    /// Check if a timer guards `lock_id` on `key`.
    pub fn has_timer(&self, key: &VarKey, lock_id: &str) -> bool {
        self.shared
            .inner
            .lock()
            .timers
            .get(key)
            .is_some_and(|t| t.lock.id == lock_id)
    }

    /// Time left before the timer on `key` fires.
    pub fn remaining(&self, key: &VarKey) -> Option<Duration> {
        self.shared
            .inner
            .lock()
            .timers
            .get(key)
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    /// Rebuild timers from durable lock metadata, each with a full TTL.
    pub fn restore(&self, locked: &[VariableEncrypted]) -> usize {
        let mut restored = 0;
        for var in locked {
            if let Some(ref lock) = var.metadata.lock {
                self.create_timer(&var.key(), lock);
                restored += 1;
            }
        }
        restored
    }

    /// Cancel every timer and forget every delay window.
    pub fn shutdown(&self) {
        let mut inner = self.shared.inner.lock();
        for (_, timer) in inner.timers.drain() {
            timer.handle.abort();
        }
        inner.delays.clear();
    }

    /// Get statistics.
    pub fn stats(&self) -> LockTimerStats {
        let mut inner = self.shared.inner.lock();
        let now = Instant::now();
        inner.sweep_delays(now);
        LockTimerStats {
            active_timers: inner.timers.len(),
            delayed_paths: inner.delays.len(),
            created: self.shared.created.load(Ordering::Relaxed),
            renewed: self.shared.renewed.load(Ordering::Relaxed),
            expired: self.shared.expired.load(Ordering::Relaxed),
            expire_failures: self.shared.expire_failures.load(Ordering::Relaxed),
        }
    }

    fn ttl_of(&self, lock: &VariableLock) -> Duration {
        if lock.ttl.is_zero() {
            self.shared.config.default_ttl
        } else {
            lock.ttl
        }
    }

    /// Spawn a timer task for `lock`. The caller holds the registry lock.
    fn schedule(&self, inner: &mut RegistryInner, key: &VarKey, lock: VariableLock) -> LockTimer {
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let deadline = deadline_after(self.ttl_of(&lock));

        let shared = Arc::downgrade(&self.shared);
        let task_key = key.clone();
        let handle = self.shared.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire(shared, task_key, generation).await;
        });

        LockTimer {
            lock,
            generation,
            deadline,
            handle,
        }
    }
}

impl RegistryInner {
    /// Open a delay window on `key`. Closed windows are swept once the map
    /// doubles past its size after the previous sweep.
    fn open_delay(&mut self, key: &VarKey, delay: Duration) {
        if self.delays.len() >= self.sweep_at {
            self.sweep_delays(Instant::now());
        }
        if !delay.is_zero() {
            self.delays.insert(key.clone(), deadline_after(delay));
        }
    }

    fn sweep_delays(&mut self, now: Instant) {
        self.delays.retain(|_, until| now < *until);
        self.sweep_at = (self.delays.len() * 2).max(MIN_DELAY_SWEEP);
    }
}

/// Expire the lock guarded by a timer that ran out.
async fn fire(shared: Weak<Shared>, key: VarKey, generation: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let lock = {
        let mut inner = shared.inner.lock();
        match inner.timers.get(&key) {
            Some(timer) if timer.generation == generation => {}
            // Renewed, released or replaced since this timer was armed.
            _ => return,
        }
        let Some(timer) = inner.timers.remove(&key) else {
            return;
        };
        inner.open_delay(&key, timer.lock.lock_delay);
        timer.lock
    };

    tracing::info!(
        namespace = %key.namespace,
        path = %key.path,
        lock_id = %lock.short_id(),
        "lock TTL expired"
    );

    let now = shared.clock.now_unix_nanos();
    let attempts = shared.config.max_expire_attempts.max(1);
    for attempt in 1..=attempts {
        let req = VarApplyStateRequest::lock_expire(&key, lock.clone(), now);
        match shared.applier.apply(req) {
            Ok(entry) => {
                match entry.outcome {
                    StateOutcome::Ok { .. } => {
                        shared.expired.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            namespace = %key.namespace,
                            path = %key.path,
                            index = entry.index,
                            "lock expiry committed"
                        );
                    }
                    StateOutcome::Conflict { reason, .. } => {
                        tracing::debug!(
                            namespace = %key.namespace,
                            path = %key.path,
                            ?reason,
                            "lock already gone at expiry"
                        );
                    }
                }
                return;
            }
            Err(e) => {
                tracing::warn!(
                    namespace = %key.namespace,
                    path = %key.path,
                    attempt,
                    error = %e,
                    "failed to commit lock expiry"
                );
                if attempt < attempts {
                    tokio::time::sleep(shared.config.retry_backoff * attempt).await;
                }
            }
        }
    }

    shared.expire_failures.fetch_add(1, Ordering::Relaxed);
    tracing::error!(
        namespace = %key.namespace,
        path = %key.path,
        lock_id = %lock.short_id(),
        attempts,
        "giving up on lock expiry"
    );
}
