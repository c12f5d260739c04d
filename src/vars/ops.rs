//! Client-facing request and response types.
//!
//! Every mutation enters through a single [`VarApplyRequest`] tagged with a
//! closed [`VarOp`]. Apply responses carry a three-way [`ApplyOutcome`]:
//! terminal failures are returned as errors and never reach this type.

use crate::acl::Identity;
use crate::core::error::VarError;
use crate::vars::model::{VariableDecrypted, VariableLock, VariableMetadata, DEFAULT_NAMESPACE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Mutation kinds accepted by apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarOp {
    /// Unconditional write.
    Set,
    /// Write fenced on the expected modify index (0 = must not exist).
    Cas,
    /// Unconditional delete.
    Delete,
    /// Delete fenced on the expected modify index.
    DeleteCas,
    /// Take the variable's lock, creating the variable if needed.
    LockAcquire,
    /// Give up a held lock.
    LockRelease,
}

impl VarOp {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Cas => "cas",
            Self::Delete => "delete",
            Self::DeleteCas => "delete-cas",
            Self::LockAcquire => "lock-acquire",
            Self::LockRelease => "lock-release",
        }
    }

    /// Check if the operation carries a payload to encrypt.
    pub fn writes_payload(&self) -> bool {
        matches!(self, Self::Set | Self::Cas | Self::LockAcquire)
    }

    /// Check if the operation removes the variable.
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete | Self::DeleteCas)
    }

    /// Check if the operation belongs to the lock protocol.
    pub fn is_lock(&self) -> bool {
        matches!(self, Self::LockAcquire | Self::LockRelease)
    }
}

impl fmt::Display for VarOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply request.
///
/// CAS operations read the expected index from `var.metadata.modify_index`.
/// A variable with an empty namespace targets `namespace`.
#[derive(Debug, Clone)]
pub struct VarApplyRequest {
    /// Operation.
    pub op: VarOp,
    /// Target variable, with items for payload writes.
    pub var: VariableDecrypted,
    /// Caller identity.
    pub identity: Identity,
    /// Request namespace, used when the variable names none.
    pub namespace: String,
}

impl VarApplyRequest {
    /// Build a request in the default namespace.
    pub fn new(op: VarOp, var: VariableDecrypted, identity: Identity) -> Self {
        Self {
            op,
            var,
            identity,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    /// Unconditional write.
    pub fn set(var: VariableDecrypted, identity: Identity) -> Self {
        Self::new(VarOp::Set, var, identity)
    }

    /// Write fenced on `expected_index`.
    pub fn cas(var: VariableDecrypted, expected_index: u64, identity: Identity) -> Self {
        Self::new(VarOp::Cas, var.with_modify_index(expected_index), identity)
    }

    /// Unconditional delete.
    pub fn delete(namespace: &str, path: &str, identity: Identity) -> Self {
        let var = VariableDecrypted::new(namespace, path, Default::default());
        Self::new(VarOp::Delete, var, identity)
    }

    /// Delete fenced on `expected_index`.
    pub fn delete_cas(namespace: &str, path: &str, expected_index: u64, identity: Identity) -> Self {
        let var = VariableDecrypted::new(namespace, path, Default::default())
            .with_modify_index(expected_index);
        Self::new(VarOp::DeleteCas, var, identity)
    }

    /// Acquire the lock on `var`, with its lock block or server defaults.
    pub fn lock_acquire(var: VariableDecrypted, identity: Identity) -> Self {
        Self::new(VarOp::LockAcquire, var, identity)
    }

    /// Release the lock identified by `lock_id`.
    pub fn lock_release(namespace: &str, path: &str, lock_id: &str, identity: Identity) -> Self {
        let var = VariableDecrypted::new(namespace, path, Default::default())
            .with_lock(VariableLock::with_id(lock_id));
        Self::new(VarOp::LockRelease, var, identity)
    }

    /// Override the request namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

/// Result classification of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// The mutation committed.
    Ok,
    /// The mutation was rejected; `conflict` holds the stored value.
    Conflict,
    /// Rejected, and the caller may not read the stored value.
    Redacted,
}

/// Why the state machine refused a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictReason {
    /// Expected index did not match the stored modify index.
    IndexMismatch,
    /// LockAcquire on a variable that already holds a lock.
    AlreadyLocked,
    /// Release or expiry on a variable without a lock.
    LockNotHeld,
    /// The request did not carry the holder's lock ID.
    NotLockHolder,
}

/// Apply response.
#[derive(Debug, Clone)]
pub struct VarApplyResponse {
    /// Operation that was applied.
    pub op: VarOp,
    /// Canonicalized request variable.
    pub input: VariableDecrypted,
    /// Outcome.
    pub result: ApplyOutcome,
    /// Written variable with the caller's own items, on success.
    pub output: Option<VariableDecrypted>,
    /// Stored variable that caused a conflict. Items are empty when redacted.
    pub conflict: Option<VariableDecrypted>,
    /// Reason for a conflict.
    pub conflict_reason: Option<ConflictReason>,
    /// Log index of the apply.
    pub index: u64,
}

impl VarApplyResponse {
    /// Check if the mutation committed.
    pub fn is_ok(&self) -> bool {
        self.result == ApplyOutcome::Ok
    }

    /// Check if the mutation was refused.
    pub fn is_conflict(&self) -> bool {
        matches!(self.result, ApplyOutcome::Conflict | ApplyOutcome::Redacted)
    }

    /// Check if the conflicting value was withheld.
    pub fn is_redacted(&self) -> bool {
        self.result == ApplyOutcome::Redacted
    }

    /// Express a conflict as the matching error, for callers that want one.
    pub fn conflict_error(&self) -> Option<VarError> {
        if !self.is_conflict() {
            return None;
        }
        let err = match self.conflict_reason? {
            ConflictReason::AlreadyLocked => VarError::AlreadyLocked,
            ConflictReason::LockNotHeld => VarError::LockNotFound,
            ConflictReason::NotLockHolder => VarError::NotLockHolder,
            ConflictReason::IndexMismatch => {
                let meta = self
                    .conflict
                    .as_ref()
                    .map(|c| c.metadata.clone())
                    .unwrap_or_else(|| self.input.metadata.clone());
                VarError::ConflictCas {
                    namespace: meta.namespace,
                    path: meta.path,
                    modify_index: meta.modify_index,
                }
            }
        };
        Some(err)
    }
}

/// Blocking query and pagination options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Block until the result index exceeds this. 0 never blocks.
    pub min_index: u64,
    /// Longest wait. `None` uses the server default.
    pub max_query_time: Option<Duration>,
    /// Page size. 0 uses the server default.
    pub per_page: u32,
    /// Continuation token from a previous page.
    pub next_token: String,
    /// Iterate in descending order.
    pub reverse: bool,
}

impl QueryOptions {
    /// Block until the index passes `min_index`, for at most `wait`.
    pub fn blocking(min_index: u64, wait: Duration) -> Self {
        Self {
            min_index,
            max_query_time: Some(wait),
            ..Self::default()
        }
    }

    /// One page of `per_page` items starting at `next_token`.
    pub fn page(per_page: u32, next_token: impl Into<String>) -> Self {
        Self {
            per_page,
            next_token: next_token.into(),
            ..Self::default()
        }
    }
}

/// Metadata attached to query responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// Index the result reflects.
    pub index: u64,
    /// Time since the serving node last heard from the leader.
    pub last_contact: Duration,
    /// Whether the serving node knows a leader.
    pub known_leader: bool,
}

/// Read one variable.
#[derive(Debug, Clone)]
pub struct VarReadRequest {
    /// Namespace.
    pub namespace: String,
    /// Path.
    pub path: String,
    /// Caller identity.
    pub identity: Identity,
    /// Blocking options.
    pub query: QueryOptions,
}

impl VarReadRequest {
    /// Non-blocking read.
    pub fn new(namespace: &str, path: &str, identity: Identity) -> Self {
        Self {
            namespace: namespace.to_string(),
            path: path.to_string(),
            identity,
            query: QueryOptions::default(),
        }
    }

    /// Attach query options.
    pub fn with_query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }
}

/// Read result.
#[derive(Debug, Clone)]
pub struct VarReadResponse {
    /// Variable, if it exists.
    pub data: Option<VariableDecrypted>,
    /// Query metadata.
    pub meta: QueryMeta,
}

/// List variables under a prefix.
#[derive(Debug, Clone)]
pub struct VarListRequest {
    /// Namespace, or `*` for every namespace.
    pub namespace: String,
    /// Path prefix.
    pub prefix: String,
    /// Caller identity.
    pub identity: Identity,
    /// Blocking and pagination options.
    pub query: QueryOptions,
}

impl VarListRequest {
    /// List `prefix` in `namespace`.
    pub fn new(namespace: &str, prefix: &str, identity: Identity) -> Self {
        Self {
            namespace: namespace.to_string(),
            prefix: prefix.to_string(),
            identity,
            query: QueryOptions::default(),
        }
    }

    /// Attach query options.
    pub fn with_query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }
}

/// List result.
#[derive(Debug, Clone)]
pub struct VarListResponse {
    /// Metadata stubs, without payload.
    pub data: Vec<VariableMetadata>,
    /// Token for the next page, empty when done.
    pub next_token: String,
    /// Query metadata.
    pub meta: QueryMeta,
}

/// Extend a held lock.
#[derive(Debug, Clone)]
pub struct VarRenewLockRequest {
    /// Namespace.
    pub namespace: String,
    /// Path.
    pub path: String,
    /// ID of the held lock.
    pub lock_id: String,
    /// Caller identity.
    pub identity: Identity,
}

impl VarRenewLockRequest {
    /// Renew `lock_id` on `namespace/path`.
    pub fn new(namespace: &str, path: &str, lock_id: &str, identity: Identity) -> Self {
        Self {
            namespace: namespace.to_string(),
            path: path.to_string(),
            lock_id: lock_id.to_string(),
            identity,
        }
    }
}

/// Renew result.
#[derive(Debug, Clone)]
pub struct VarRenewLockResponse {
    /// Stored metadata, lock included.
    pub metadata: VariableMetadata,
    /// Modify index of the variable.
    pub index: u64,
}
