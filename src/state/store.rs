//! Variable state projection.
//!
//! The store is the apply target of the replicated log. Every entry is applied
//! at the index the log assigned, in order, and the store enforces existence,
//! lock ownership and index fencing atomically with the write. Refusals are
//! returned as [`StateOutcome::Conflict`] carrying the stored value.
//!
//! Two indexes are tracked: `latest_index` advances with every applied entry,
//! `table_index` only when a variable was written or deleted. Blocking queries
//! watch the table index.
//!
//! Releasing, expiring or deleting a lock with a lock delay records a
//! not-before time for the path, taken from the entry's modify time. A
//! LockAcquire stamped before that time is refused with `AlreadyLocked`, so
//! the window holds even for an acquire that was admitted by the leader just
//! before the lock expired.

use crate::vars::model::{VarKey, VariableEncrypted, VariableLock, VariableMetadata};
use crate::vars::ops::{ConflictReason, VarOp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::watch;

/// Operations understood by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateOp {
    /// Unconditional write.
    Set,
    /// Fenced write.
    Cas,
    /// Unconditional delete.
    Delete,
    /// Fenced delete.
    DeleteCas,
    /// Take the lock.
    LockAcquire,
    /// Give up the lock.
    LockRelease,
    /// Clear a lock whose TTL ran out. Submitted by the leader only.
    LockExpire,
}

impl From<VarOp> for StateOp {
    fn from(op: VarOp) -> Self {
        match op {
            VarOp::Set => Self::Set,
            VarOp::Cas => Self::Cas,
            VarOp::Delete => Self::Delete,
            VarOp::DeleteCas => Self::DeleteCas,
            VarOp::LockAcquire => Self::LockAcquire,
            VarOp::LockRelease => Self::LockRelease,
        }
    }
}

/// A mutation submitted to the log.
///
/// Fenced operations read the expected index from `var.metadata.modify_index`.
/// Lock operations identify the lock through `var.metadata.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarApplyStateRequest {
    /// Operation.
    pub op: StateOp,
    /// Encrypted record; payload is empty for deletes and releases.
    pub var: VariableEncrypted,
    /// On LockAcquire, keep the stored payload instead of the submitted one.
    pub keep_payload: bool,
}

impl VarApplyStateRequest {
    /// Create a request.
    pub fn new(op: StateOp, var: VariableEncrypted) -> Self {
        Self {
            op,
            var,
            keep_payload: false,
        }
    }

    /// Expire `lock` on `key` at `now` (Unix nanoseconds).
    pub fn lock_expire(key: &VarKey, lock: VariableLock, now: i64) -> Self {
        let mut meta = VariableMetadata::new(key.namespace.clone(), key.path.clone());
        meta.lock = Some(lock);
        meta.modify_time = now;
        Self::new(StateOp::LockExpire, VariableEncrypted::metadata_only(meta))
    }
}

/// Result of applying one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOutcome {
    /// The mutation took effect (or was a no-op delete).
    Ok {
        /// Metadata after the write. `None` after a delete.
        written: Option<VariableMetadata>,
        /// Lock that this mutation removed, if any.
        released_lock: Option<VariableLock>,
    },
    /// The mutation was refused.
    Conflict {
        /// Stored value, or a zero value naming only namespace and path.
        current: VariableEncrypted,
        /// Why it was refused.
        reason: ConflictReason,
    },
}

impl StateOutcome {
    /// Check if the mutation took effect.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    fn ok(written: Option<VariableMetadata>, released_lock: Option<VariableLock>) -> Self {
        Self::Ok {
            written,
            released_lock,
        }
    }

    fn conflict(current: VariableEncrypted, reason: ConflictReason) -> Self {
        Self::Conflict { current, reason }
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Live variables.
    pub variables: usize,
    /// Variables holding a lock.
    pub locked_variables: usize,
    /// Index of the last applied entry.
    pub latest_index: u64,
    /// Index of the last write or delete.
    pub table_index: u64,
    /// Entries refused with a conflict.
    pub conflicts: u64,
}

/// Serializable image of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Index of the last applied entry.
    pub latest_index: u64,
    /// Index of the last write or delete.
    pub table_index: u64,
    /// Every live variable, in key order.
    pub variables: Vec<VariableEncrypted>,
    /// Open lock-delay windows as `(key, not_before)`.
    pub lock_delays: Vec<(VarKey, i64)>,
}

struct StoreInner {
    variables: BTreeMap<VarKey, VariableEncrypted>,
    latest_index: u64,
    table_index: u64,
    conflicts: u64,
    /// Earliest acquire time per path, Unix nanoseconds.
    lock_delays: HashMap<VarKey, i64>,
    /// Window count at which closed windows are next swept.
    delay_sweep_at: usize,
    /// Set when the entry being applied changed the table.
    touched: bool,
}

/// Ordered variable table with change notification.
pub struct VariableStateStore {
    inner: RwLock<StoreInner>,
    table_tx: watch::Sender<u64>,
}

impl VariableStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (table_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StoreInner {
                variables: BTreeMap::new(),
                latest_index: 0,
                table_index: 0,
                conflicts: 0,
                lock_delays: HashMap::new(),
                delay_sweep_at: MIN_DELAY_SWEEP,
                touched: false,
            }),
            table_tx,
        }
    }

    /// Index of the last applied entry.
    pub fn latest_index(&self) -> u64 {
        self.inner.read().latest_index
    }

    /// Index of the last write or delete.
    pub fn table_index(&self) -> u64 {
        self.inner.read().table_index
    }

    /// Receiver that observes every table index change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.table_tx.subscribe()
    }

    /// Look up one variable.
    pub fn get(&self, key: &VarKey) -> Option<VariableEncrypted> {
        self.inner.read().variables.get(key).cloned()
    }

    /// Variables in `namespace` whose path starts with `prefix`, in path order.
    pub fn list_prefix(&self, namespace: &str, prefix: &str) -> Vec<VariableEncrypted> {
        let inner = self.inner.read();
        let start = VarKey::new(namespace, prefix);
        inner
            .variables
            .range(start..)
            .take_while(|(k, _)| k.namespace == namespace && k.path.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Every variable whose path starts with `prefix`, in (namespace, path) order.
    pub fn list_all(&self, prefix: &str) -> Vec<VariableEncrypted> {
        self.inner
            .read()
            .variables
            .values()
            .filter(|v| v.metadata.path.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Every variable currently holding a lock.
    pub fn locked_variables(&self) -> Vec<VariableEncrypted> {
        self.inner
            .read()
            .variables
            .values()
            .filter(|v| v.metadata.is_locked())
            .cloned()
            .collect()
    }

    /// Get statistics.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            variables: inner.variables.len(),
            locked_variables: inner
                .variables
                .values()
                .filter(|v| v.metadata.is_locked())
                .count(),
            latest_index: inner.latest_index,
            table_index: inner.table_index,
            conflicts: inner.conflicts,
        }
    }

    /// Apply one entry at `index`.
    ///
    /// Indexes must be strictly increasing; the log guarantees this.
    pub fn apply(&self, index: u64, req: &VarApplyStateRequest) -> StateOutcome {
        let (outcome, touched) = {
            let mut inner = self.inner.write();
            debug_assert!(index > inner.latest_index);
            inner.latest_index = index;
            inner.touched = false;

            let key = req.var.key();
            let outcome = match req.op {
                StateOp::Set => inner.apply_set(index, key, req),
                StateOp::Cas => inner.apply_cas(index, key, req),
                StateOp::Delete => inner.apply_delete(key, req),
                StateOp::DeleteCas => inner.apply_delete_cas(key, req),
                StateOp::LockAcquire => inner.apply_lock_acquire(index, key, req),
                StateOp::LockRelease | StateOp::LockExpire => {
                    inner.apply_lock_release(index, key, req)
                }
            };

            if !outcome.is_ok() {
                inner.conflicts += 1;
            }
            if inner.touched {
                inner.table_index = index;
            }
            (outcome, inner.touched)
        };

        if touched {
            self.table_tx.send_replace(index);
        }
        outcome
    }

    /// Capture the store contents.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read();
        StoreSnapshot {
            latest_index: inner.latest_index,
            table_index: inner.table_index,
            variables: inner.variables.values().cloned().collect(),
            lock_delays: inner
                .lock_delays
                .iter()
                .map(|(key, until)| (key.clone(), *until))
                .collect(),
        }
    }

    /// Replace the store contents with a snapshot.
    pub fn restore(&self, snapshot: StoreSnapshot) {
        {
            let mut inner = self.inner.write();
            inner.variables = snapshot
                .variables
                .into_iter()
                .map(|v| (v.key(), v))
                .collect();
            inner.lock_delays = snapshot.lock_delays.into_iter().collect();
            inner.delay_sweep_at = (inner.lock_delays.len() * 2).max(MIN_DELAY_SWEEP);
            inner.latest_index = snapshot.latest_index;
            inner.table_index = snapshot.table_index;
        }
        self.table_tx.send_replace(snapshot.table_index);
    }

    /// Serialize the store to bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(&self.snapshot())
    }

    /// Deserialize a store from bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        let snapshot: StoreSnapshot = bincode::deserialize(bytes)?;
        let store = Self::new();
        store.restore(snapshot);
        Ok(store)
    }
}

impl Default for VariableStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller holds the stored lock, or the variable is unlocked.
fn may_mutate(existing: &VariableEncrypted, req: &VarApplyStateRequest) -> bool {
    match existing.metadata.lock_id() {
        None => true,
        Some(held) => req.var.metadata.lock_id() == Some(held),
    }
}

/// Window count below which closed lock-delay windows are left for later.
const MIN_DELAY_SWEEP: usize = 64;

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

fn zero_value(key: &VarKey) -> VariableEncrypted {
    VariableEncrypted::metadata_only(VariableMetadata::new(
        key.namespace.clone(),
        key.path.clone(),
    ))
}

impl StoreInner {
    fn apply_set(&mut self, index: u64, key: VarKey, req: &VarApplyStateRequest) -> StateOutcome {
        if let Some(existing) = self.variables.get(&key) {
            if !may_mutate(existing, req) {
                return StateOutcome::conflict(existing.clone(), ConflictReason::NotLockHolder);
            }
        }
        self.write(index, key, req)
    }

    fn apply_cas(&mut self, index: u64, key: VarKey, req: &VarApplyStateRequest) -> StateOutcome {
        let expected = req.var.metadata.modify_index;
        match self.variables.get(&key) {
            None if expected == 0 => {}
            None => return StateOutcome::conflict(zero_value(&key), ConflictReason::IndexMismatch),
            Some(existing) => {
                if existing.metadata.modify_index != expected {
                    return StateOutcome::conflict(existing.clone(), ConflictReason::IndexMismatch);
                }
                if !may_mutate(existing, req) {
                    return StateOutcome::conflict(existing.clone(), ConflictReason::NotLockHolder);
                }
            }
        }
        self.write(index, key, req)
    }

    fn apply_delete(&mut self, key: VarKey, req: &VarApplyStateRequest) -> StateOutcome {
        let Some(existing) = self.variables.get(&key) else {
            return StateOutcome::ok(None, None);
        };
        if !may_mutate(existing, req) {
            return StateOutcome::conflict(existing.clone(), ConflictReason::NotLockHolder);
        }
        let released = self.variables.remove(&key).and_then(|v| v.metadata.lock);
        if let Some(ref lock) = released {
            self.open_lock_delay(&key, lock, req.var.metadata.modify_time);
        }
        self.touched = true;
        StateOutcome::ok(None, released)
    }

    fn apply_delete_cas(&mut self, key: VarKey, req: &VarApplyStateRequest) -> StateOutcome {
        let expected = req.var.metadata.modify_index;
        match self.variables.get(&key) {
            None if expected == 0 => StateOutcome::ok(None, None),
            None => StateOutcome::conflict(zero_value(&key), ConflictReason::IndexMismatch),
            Some(existing) if existing.metadata.modify_index != expected => {
                StateOutcome::conflict(existing.clone(), ConflictReason::IndexMismatch)
            }
            Some(_) => self.apply_delete(key, req),
        }
    }

    fn apply_lock_acquire(
        &mut self,
        index: u64,
        key: VarKey,
        req: &VarApplyStateRequest,
    ) -> StateOutcome {
        let expected = req.var.metadata.modify_index;
        if let Some(existing) = self.variables.get(&key) {
            if existing.metadata.is_locked() {
                return StateOutcome::conflict(existing.clone(), ConflictReason::AlreadyLocked);
            }
            if expected != 0 && existing.metadata.modify_index != expected {
                return StateOutcome::conflict(existing.clone(), ConflictReason::IndexMismatch);
            }
        }
        if self.in_lock_delay(&key, req.var.metadata.modify_time) {
            let current = self
                .variables
                .get(&key)
                .cloned()
                .unwrap_or_else(|| zero_value(&key));
            return StateOutcome::conflict(current, ConflictReason::AlreadyLocked);
        }

        let Some(lock) = req.var.metadata.lock.clone() else {
            return StateOutcome::conflict(zero_value(&key), ConflictReason::LockNotHeld);
        };

        let existing = self.variables.get(&key);
        let data = match existing {
            Some(existing) if req.keep_payload => existing.data.clone(),
            _ => req.var.data.clone(),
        };
        let mut meta = self.next_metadata(index, &key, req);
        meta.lock = Some(lock);
        self.lock_delays.remove(&key);

        self.variables.insert(
            key,
            VariableEncrypted {
                metadata: meta.clone(),
                data,
            },
        );
        self.touched = true;
        StateOutcome::ok(Some(meta), None)
    }

    fn apply_lock_release(
        &mut self,
        index: u64,
        key: VarKey,
        req: &VarApplyStateRequest,
    ) -> StateOutcome {
        let Some(existing) = self.variables.get_mut(&key) else {
            return StateOutcome::conflict(zero_value(&key), ConflictReason::LockNotHeld);
        };
        let Some(held) = existing.metadata.lock.clone() else {
            return StateOutcome::conflict(existing.clone(), ConflictReason::LockNotHeld);
        };
        if req.var.metadata.lock_id() != Some(held.id.as_str()) {
            return StateOutcome::conflict(existing.clone(), ConflictReason::NotLockHolder);
        }

        existing.metadata.lock = None;
        existing.metadata.modify_index = index;
        if req.var.metadata.modify_time != 0 {
            existing.metadata.modify_time = req.var.metadata.modify_time;
        }
        let written = existing.metadata.clone();
        self.open_lock_delay(&key, &held, req.var.metadata.modify_time);
        self.touched = true;
        StateOutcome::ok(Some(written), Some(held))
    }

    /// Record the window after `lock` was given up at `now`. Windows closed by
    /// `now` are swept once the map doubles past its size after the last sweep.
    fn open_lock_delay(&mut self, key: &VarKey, lock: &VariableLock, now: i64) {
        if self.lock_delays.len() >= self.delay_sweep_at {
            self.lock_delays.retain(|_, until| *until > now);
            self.delay_sweep_at = (self.lock_delays.len() * 2).max(MIN_DELAY_SWEEP);
        }
        if lock.lock_delay.is_zero() {
            return;
        }
        self.lock_delays
            .insert(key.clone(), now.saturating_add(duration_nanos(lock.lock_delay)));
    }

    fn in_lock_delay(&self, key: &VarKey, at: i64) -> bool {
        self.lock_delays.get(key).is_some_and(|until| at < *until)
    }

    /// Insert or update with the submitted payload, keeping any held lock.
    fn write(&mut self, index: u64, key: VarKey, req: &VarApplyStateRequest) -> StateOutcome {
        let mut meta = self.next_metadata(index, &key, req);
        meta.lock = self
            .variables
            .get(&key)
            .and_then(|existing| existing.metadata.lock.clone());

        self.variables.insert(
            key,
            VariableEncrypted {
                metadata: meta.clone(),
                data: req.var.data.clone(),
            },
        );
        self.touched = true;
        StateOutcome::ok(Some(meta), None)
    }

    /// Metadata for a write at `index`: creation fields survive updates.
    fn next_metadata(&self, index: u64, key: &VarKey, req: &VarApplyStateRequest) -> VariableMetadata {
        let submitted = &req.var.metadata;
        let (create_index, create_time) = match self.variables.get(key) {
            Some(existing) => (
                existing.metadata.create_index,
                existing.metadata.create_time,
            ),
            None => (index, submitted.create_time),
        };
        VariableMetadata {
            namespace: key.namespace.clone(),
            path: key.path.clone(),
            create_index,
            modify_index: index,
            create_time,
            modify_time: submitted.modify_time,
            lock: None,
        }
    }
}
