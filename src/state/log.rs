//! Single-node replicated log.
//!
//! [`LocalLog`] stands in for consensus: it assigns strictly increasing
//! indexes, stores each entry in its encoded form and applies it to the
//! [`VariableStateStore`] in order. Entries go through the same encode/decode
//! path a replicated log would use, so an entry that fails to decode surfaces
//! as a terminal [`VarError::StateApplyFailed`].

use crate::core::error::{VarError, VarResult};
use crate::state::store::{StateOutcome, VarApplyStateRequest, VariableStateStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Submits mutations to the replicated state machine.
///
/// `apply` blocks until the entry committed and was applied locally, then
/// returns the index it was assigned together with the state machine outcome.
pub trait RaftApplier: Send + Sync {
    /// Commit and apply one mutation.
    fn apply(&self, req: VarApplyStateRequest) -> VarResult<AppliedEntry>;
}

/// A committed entry and its effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry {
    /// Log index.
    pub index: u64,
    /// State machine outcome.
    pub outcome: StateOutcome,
}

/// Encoded log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log index.
    pub index: u64,
    /// Mutation.
    pub request: VarApplyStateRequest,
}

impl LogEntry {
    /// Serialize this entry to bytes.
    pub fn serialize(&self) -> VarResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| VarError::storage(format!("failed to encode log entry: {e}")))
    }

    /// Deserialize an entry from bytes.
    pub fn deserialize(bytes: &[u8]) -> VarResult<Self> {
        bincode::deserialize(bytes).map_err(|e| VarError::StateApplyFailed {
            message: format!("failed to decode log entry: {e}"),
        })
    }
}

/// Log statistics.
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    /// Entries in the log.
    pub entries: usize,
    /// Index of the last entry.
    pub last_index: u64,
    /// Submissions that failed before commit.
    pub failed_submissions: u64,
}

struct LogInner {
    entries: Vec<Vec<u8>>,
    last_index: u64,
}

/// In-process log applying to a local store.
pub struct LocalLog {
    store: Arc<VariableStateStore>,
    inner: Mutex<LogInner>,
    /// Number of upcoming submissions to reject.
    injected_failures: AtomicU32,
    failed_submissions: AtomicU64,
}

impl LocalLog {
    /// Create an empty log over `store`.
    pub fn new(store: Arc<VariableStateStore>) -> Self {
        let last_index = store.latest_index();
        Self {
            store,
            inner: Mutex::new(LogInner {
                entries: Vec::new(),
                last_index,
            }),
            injected_failures: AtomicU32::new(0),
            failed_submissions: AtomicU64::new(0),
        }
    }

    /// Store this log applies to.
    pub fn store(&self) -> &Arc<VariableStateStore> {
        &self.store
    }

    /// Index of the last committed entry.
    pub fn last_index(&self) -> u64 {
        self.inner.lock().last_index
    }

    /// Reject the next `count` submissions with a storage error.
    pub fn inject_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::Release);
    }

    /// Append an already encoded entry and apply it.
    pub fn apply_encoded(&self, bytes: Vec<u8>) -> VarResult<AppliedEntry> {
        let mut inner = self.inner.lock();
        let entry = LogEntry::deserialize(&bytes)?;
        if entry.index <= inner.last_index {
            return Err(VarError::StateApplyFailed {
                message: format!(
                    "log index {} does not follow {}",
                    entry.index, inner.last_index
                ),
            });
        }
        inner.entries.push(bytes);
        inner.last_index = entry.index;
        let outcome = self.store.apply(entry.index, &entry.request);
        Ok(AppliedEntry {
            index: entry.index,
            outcome,
        })
    }

    /// Re-apply every entry into `target`, returning the last index.
    pub fn replay_into(&self, target: &VariableStateStore) -> VarResult<u64> {
        let inner = self.inner.lock();
        let mut last = target.latest_index();
        for bytes in &inner.entries {
            let entry = LogEntry::deserialize(bytes)?;
            if entry.index <= last {
                continue;
            }
            target.apply(entry.index, &entry.request);
            last = entry.index;
        }
        Ok(last)
    }

    /// Get statistics.
    pub fn stats(&self) -> LogStats {
        let inner = self.inner.lock();
        LogStats {
            entries: inner.entries.len(),
            last_index: inner.last_index,
            failed_submissions: self.failed_submissions.load(Ordering::Relaxed),
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RaftApplier for LocalLog {
    fn apply(&self, req: VarApplyStateRequest) -> VarResult<AppliedEntry> {
        if self.take_injected_failure() {
            self.failed_submissions.fetch_add(1, Ordering::Relaxed);
            return Err(VarError::storage("leadership lost while committing"));
        }

        // Index assignment and apply happen under one lock to keep order.
        let mut inner = self.inner.lock();
        let index = inner.last_index + 1;
        let bytes = LogEntry {
            index,
            request: req,
        }
        .serialize()?;
        let entry = LogEntry::deserialize(&bytes)?;

        inner.entries.push(bytes);
        inner.last_index = index;
        let outcome = self.store.apply(index, &entry.request);
        Ok(AppliedEntry { index, outcome })
    }
}
