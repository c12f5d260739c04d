//! Error types and RPC status mapping.
//!
//! Every failure the variables service can surface is a [`VarError`]. CAS and
//! lock-ownership conflicts are not errors: they travel as structured data in
//! the apply response (see [`crate::vars::ops::ApplyOutcome`]) and can be
//! converted into the matching variant on demand.

use thiserror::Error;

/// Common variable store error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VarError {
    /// Authentication or authorization failed.
    #[error("Permission denied")]
    PermissionDenied,

    /// Caller input is malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Not every server meets the minimum version for the requested feature.
    #[error("all servers must be running version {min_version} or later to {feature}")]
    VersionMismatch {
        min_version: String,
        feature: String,
    },

    /// CAS fencing mismatch, surfaced only when a caller converts a conflict.
    #[error("cas conflict on {namespace}/{path}: current modify index is {modify_index}")]
    ConflictCas {
        namespace: String,
        path: String,
        modify_index: u64,
    },

    /// The crypto provider refused to encrypt.
    #[error("variable error: encrypt: {message}")]
    EncryptionFailed { message: String },

    /// The crypto provider refused to decrypt, or the plaintext was unreadable.
    #[error("variable error: decrypt: {message}")]
    DecryptionFailed { message: String },

    /// Submitting the mutation to the replicated log failed.
    #[error("raft apply failed: {message}")]
    StorageApplyFailed { message: String },

    /// The state machine rejected an entry it could not interpret.
    #[error("state apply failed: {message}")]
    StateApplyFailed { message: String },

    /// The variable already holds a lock, or its lock delay has not elapsed.
    #[error("variable already holds a lock")]
    AlreadyLocked,

    /// The variable does not exist.
    #[error("variable doesn't exist")]
    VariableNotFound,

    /// The variable exists but holds no lock.
    #[error("variable doesn't hold a lock")]
    LockNotFound,

    /// The caller is not the lock holder, or the lock already expired.
    #[error("attempting to modify locked variable")]
    NotLockHolder,

    /// A lock operation was submitted without a lock ID.
    #[error("missing lock information")]
    MissingLockInfo,

    /// This node does not currently lead and cannot run lock timers.
    #[error("no cluster leader")]
    NotLeader,

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl VarError {
    /// Create an InvalidArgument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an EncryptionFailed error.
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Create a DecryptionFailed error.
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Create a StorageApplyFailed error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageApplyFailed {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the caller may retry the same request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::StorageApplyFailed { .. } | Self::NotLeader | Self::EncryptionFailed { .. }
        )
    }

    /// Check if this error belongs to the lock protocol.
    pub fn is_lock_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyLocked | Self::LockNotFound | Self::NotLockHolder | Self::MissingLockInfo
        )
    }

    /// HTTP-style status code carried by the RPC layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PermissionDenied => 403,
            Self::InvalidArgument { .. } => 400,
            Self::AlreadyLocked => 400,
            Self::MissingLockInfo => 400,
            Self::VariableNotFound => 404,
            Self::LockNotFound => 409,
            Self::NotLockHolder => 409,
            Self::ConflictCas { .. } => 409,
            Self::NotLeader => 503,
            Self::StorageApplyFailed { .. } => 503,
            Self::VersionMismatch { .. }
            | Self::EncryptionFailed { .. }
            | Self::DecryptionFailed { .. }
            | Self::StateApplyFailed { .. }
            | Self::Internal { .. } => 500,
        }
    }
}

/// Result type using VarError.
pub type VarResult<T> = Result<T, VarError>;

/// Messages for argument errors that callers match on.
pub mod messages {
    /// Set/CAS carried lock timing fields.
    pub const LOCK_ON_CREATION: &str = "variable should not contain lock definition";
    /// LockRelease carried items.
    pub const ITEMS_ON_RELEASE: &str = "lock release operation doesn't take variable items";
    /// Delete without a path.
    pub const DELETE_REQUIRES_PATH: &str = "delete requires a Path";
    /// Write targeted the wildcard namespace.
    pub const WILDCARD_NAMESPACE: &str = "can not target wildcard (\"*\") namespace";
}
