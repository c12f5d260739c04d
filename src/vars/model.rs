//! Variable data model.
//!
//! A variable is identified by `(namespace, path)`. Its metadata is stored in
//! the clear; its items only ever leave the service encrypted, as
//! [`VariableEncrypted`]. Clients see [`VariableDecrypted`].

use crate::core::error::{messages, VarError, VarResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Namespace used when a request does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace wildcard accepted by list requests only.
pub const ALL_NAMESPACES: &str = "*";

/// Largest accepted payload, counted as key plus value bytes.
pub const MAX_VARIABLE_SIZE: usize = 64 * 1024;

/// Longest accepted variable path.
pub const MAX_PATH_LEN: usize = 128;

/// Longest accepted namespace name.
pub const MAX_NAMESPACE_LEN: usize = 128;

/// User payload: string keys to string values, kept sorted.
pub type VariableItems = BTreeMap<String, String>;

/// Primary key of a variable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarKey {
    /// Namespace.
    pub namespace: String,
    /// Path within the namespace.
    pub path: String,
}

impl VarKey {
    /// Create a key.
    pub fn new(namespace: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.path)
    }
}

/// A lock held on a variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableLock {
    /// Lock token. Generated on acquire, proof of ownership afterwards.
    pub id: String,
    /// Time the lock lives without a renewal. Zero means the server default.
    pub ttl: Duration,
    /// Cool-down after release or expiry before the path can be locked again.
    pub lock_delay: Duration,
}

impl VariableLock {
    /// Create a lock request with explicit timing.
    pub fn new(ttl: Duration, lock_delay: Duration) -> Self {
        Self {
            id: String::new(),
            ttl,
            lock_delay,
        }
    }

    /// Lock reference used to release or renew.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Prefix of the lock ID, safe to log.
    pub fn short_id(&self) -> &str {
        short_lock_id(&self.id)
    }
}

/// Prefix of a lock ID, safe to log.
pub fn short_lock_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Unencrypted bookkeeping of a variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableMetadata {
    /// Namespace.
    pub namespace: String,
    /// Path within the namespace.
    pub path: String,
    /// Log index that created the variable.
    pub create_index: u64,
    /// Log index of the last accepted mutation. CAS fencing token.
    pub modify_index: u64,
    /// Creation wall-clock time, Unix nanoseconds.
    pub create_time: i64,
    /// Last modification wall-clock time, Unix nanoseconds.
    pub modify_time: i64,
    /// Present only while a lock is held.
    pub lock: Option<VariableLock>,
}

impl VariableMetadata {
    /// Metadata carrying only an identity.
    pub fn new(namespace: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Primary key.
    pub fn key(&self) -> VarKey {
        VarKey::new(self.namespace.clone(), self.path.clone())
    }

    /// Check if a lock is held.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// ID of the held lock, if any.
    pub fn lock_id(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.id.as_str())
    }

    /// Drop lock details.
    pub fn strip_lock(&mut self) {
        self.lock = None;
    }
}

/// Ciphertext and the key that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableData {
    /// Nonce-prefixed ciphertext.
    pub data: Vec<u8>,
    /// Key identifier. Empty on delete records and zero-value conflicts.
    pub key_id: String,
}

/// Stored form of a variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableEncrypted {
    /// Metadata.
    pub metadata: VariableMetadata,
    /// Encrypted payload.
    pub data: VariableData,
}

impl VariableEncrypted {
    /// Record with metadata only.
    pub fn metadata_only(metadata: VariableMetadata) -> Self {
        Self {
            metadata,
            data: VariableData::default(),
        }
    }

    /// Primary key.
    pub fn key(&self) -> VarKey {
        self.metadata.key()
    }

    /// Check if the record carries a payload.
    pub fn has_payload(&self) -> bool {
        !self.data.key_id.is_empty()
    }
}

/// Client form of a variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDecrypted {
    /// Metadata.
    pub metadata: VariableMetadata,
    /// Plaintext payload.
    pub items: VariableItems,
}

impl VariableDecrypted {
    /// Variable with items and no lock.
    pub fn new(namespace: impl Into<String>, path: impl Into<String>, items: VariableItems) -> Self {
        Self {
            metadata: VariableMetadata::new(namespace, path),
            items,
        }
    }

    /// Attach a lock block.
    pub fn with_lock(mut self, lock: VariableLock) -> Self {
        self.metadata.lock = Some(lock);
        self
    }

    /// Set the expected modify index carried by CAS requests.
    pub fn with_modify_index(mut self, index: u64) -> Self {
        self.metadata.modify_index = index;
        self
    }

    /// Primary key.
    pub fn key(&self) -> VarKey {
        self.metadata.key()
    }

    /// Payload size in bytes, keys plus values.
    pub fn size(&self) -> usize {
        self.items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Fill lock timing left at zero from the server defaults.
    pub fn canonicalize_lock(&mut self, defaults: &LockDefaults) {
        let lock = self.metadata.lock.get_or_insert_with(VariableLock::default);
        if lock.ttl.is_zero() {
            lock.ttl = defaults.default_ttl;
        }
        if lock.lock_delay.is_zero() {
            lock.lock_delay = defaults.default_lock_delay;
        }
    }

    /// Validate a Set or CAS payload.
    pub fn validate(&self) -> VarResult<()> {
        validate_namespace_for_write(&self.metadata.namespace)?;
        validate_path(&self.metadata.path)?;
        if self.items.is_empty() {
            return Err(VarError::invalid("variable missing required Items object"));
        }
        self.validate_size()
    }

    /// Validate a LockAcquire request after canonicalization.
    pub fn validate_for_lock(&self, defaults: &LockDefaults) -> VarResult<()> {
        validate_namespace_for_write(&self.metadata.namespace)?;
        validate_path(&self.metadata.path)?;
        self.validate_size()?;

        let lock = self
            .metadata
            .lock
            .as_ref()
            .ok_or(VarError::MissingLockInfo)?;
        if lock.ttl < defaults.min_ttl || lock.ttl > defaults.max_ttl {
            return Err(VarError::invalid(format!(
                "lock TTL {:?} must be between {:?} and {:?}",
                lock.ttl, defaults.min_ttl, defaults.max_ttl
            )));
        }
        if lock.lock_delay > defaults.max_ttl {
            return Err(VarError::invalid(format!(
                "lock delay {:?} cannot exceed {:?}",
                lock.lock_delay, defaults.max_ttl
            )));
        }
        Ok(())
    }

    fn validate_size(&self) -> VarResult<()> {
        let size = self.size();
        if size > MAX_VARIABLE_SIZE {
            return Err(VarError::invalid(format!(
                "variables are limited to {MAX_VARIABLE_SIZE} bytes total, got {size}"
            )));
        }
        Ok(())
    }
}

/// Reject writes that target the namespace wildcard or a malformed name.
pub fn validate_namespace_for_write(namespace: &str) -> VarResult<()> {
    if namespace == ALL_NAMESPACES {
        return Err(VarError::invalid(messages::WILDCARD_NAMESPACE));
    }
    if namespace.is_empty() {
        return Err(VarError::invalid("variable requires a namespace"));
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(VarError::invalid(format!(
            "namespace is limited to {MAX_NAMESPACE_LEN} characters"
        )));
    }
    let valid = namespace
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_'));
    if !valid {
        return Err(VarError::invalid(format!(
            "invalid namespace {namespace:?}: only alphanumerics and -_ are allowed"
        )));
    }
    Ok(())
}

/// Check that a path is 1..=128 characters of `[A-Za-z0-9-_~/]`.
pub fn validate_path(path: &str) -> VarResult<()> {
    if path.is_empty() {
        return Err(VarError::invalid("variable requires path"));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(VarError::invalid(format!(
            "variable path is limited to {MAX_PATH_LEN} characters"
        )));
    }
    let valid = path
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'~' | b'/'));
    if !valid {
        return Err(VarError::invalid(format!(
            "invalid path {path:?}: only alphanumerics and -_~/ are allowed"
        )));
    }
    Ok(())
}

/// Lock timing defaults and bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockDefaults {
    /// TTL applied when a request leaves it at zero.
    pub default_ttl: Duration,
    /// Lock delay applied when a request leaves it at zero.
    pub default_lock_delay: Duration,
    /// Smallest TTL accepted.
    pub min_ttl: Duration,
    /// Largest TTL and lock delay accepted.
    pub max_ttl: Duration,
}

impl Default for LockDefaults {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(15),
            default_lock_delay: Duration::from_secs(15),
            min_ttl: Duration::from_secs(1),
            max_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}
