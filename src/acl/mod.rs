//! Identity resolution and authorization.
//!
//! Callers present an [`Identity`]; an [`Authorizer`] resolves it to an
//! [`Acl`] that answers capability questions per namespace and path. With
//! ACLs disabled every caller resolves to the management ACL.

pub mod policy;

pub use policy::{Capabilities, Policy};

use crate::core::error::{VarError, VarResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Credentials attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Secret token, if the caller presented one.
    pub secret_id: Option<String>,
}

impl Identity {
    /// Caller without a token.
    pub fn anonymous() -> Self {
        Self { secret_id: None }
    }

    /// Caller presenting `secret_id`.
    pub fn token(secret_id: impl Into<String>) -> Self {
        Self {
            secret_id: Some(secret_id.into()),
        }
    }
}

/// Resolved access rights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    management: bool,
    policies: Vec<Policy>,
}

impl Acl {
    /// Unrestricted access.
    pub fn management() -> Self {
        Self {
            management: true,
            policies: Vec::new(),
        }
    }

    /// Access granted by `policies`.
    pub fn from_policies(policies: Vec<Policy>) -> Self {
        Self {
            management: false,
            policies,
        }
    }

    /// No access at all.
    pub fn deny_all() -> Self {
        Self::from_policies(Vec::new())
    }

    /// Check for management rights.
    pub fn is_management(&self) -> bool {
        self.management
    }

    /// Effective capabilities on `namespace/path`.
    ///
    /// Grants from all policies are merged; a deny from any policy wins.
    pub fn capabilities(&self, namespace: &str, path: &str) -> Capabilities {
        if self.management {
            return Capabilities::all_access();
        }
        let merged = self
            .policies
            .iter()
            .filter_map(|p| p.capabilities(namespace, path))
            .fold(Capabilities::empty(), |acc, caps| acc | caps);
        merged.effective()
    }

    /// Check one capability on `namespace/path`.
    pub fn allow(&self, namespace: &str, path: &str, capability: Capabilities) -> bool {
        self.capabilities(namespace, path).contains(capability)
    }
}

/// Resolves identities to ACLs.
pub trait Authorizer: Send + Sync {
    /// Resolve `identity`. Unknown credentials fail with `PermissionDenied`.
    fn resolve(&self, identity: &Identity) -> VarResult<Arc<Acl>>;
}

/// Token store statistics.
#[derive(Debug, Clone, Default)]
pub struct TokenStoreStats {
    /// Whether ACLs are enforced.
    pub enabled: bool,
    /// Registered tokens.
    pub tokens: usize,
    /// Successful resolutions.
    pub resolved: u64,
    /// Rejected credentials.
    pub rejected: u64,
}

/// In-memory token table.
pub struct TokenStore {
    enabled: bool,
    tokens: RwLock<HashMap<String, Arc<Acl>>>,
    anonymous: RwLock<Arc<Acl>>,
    management: Arc<Acl>,
    resolved: AtomicU64,
    rejected: AtomicU64,
}

impl TokenStore {
    /// Create a store. When `enabled` is false every caller is management.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            tokens: RwLock::new(HashMap::new()),
            anonymous: RwLock::new(Arc::new(Acl::deny_all())),
            management: Arc::new(Acl::management()),
            resolved: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Check if ACLs are enforced.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Register a management token.
    pub fn insert_management(&self, secret_id: impl Into<String>) {
        self.tokens
            .write()
            .insert(secret_id.into(), Arc::clone(&self.management));
    }

    /// Register a client token bound to `policies`.
    pub fn insert_client(&self, secret_id: impl Into<String>, policies: Vec<Policy>) {
        self.tokens
            .write()
            .insert(secret_id.into(), Arc::new(Acl::from_policies(policies)));
    }

    /// Remove a token.
    pub fn revoke(&self, secret_id: &str) -> bool {
        self.tokens.write().remove(secret_id).is_some()
    }

    /// Set the policies applied to callers without a token.
    pub fn set_anonymous_policies(&self, policies: Vec<Policy>) {
        *self.anonymous.write() = Arc::new(Acl::from_policies(policies));
    }

    /// Get statistics.
    pub fn stats(&self) -> TokenStoreStats {
        TokenStoreStats {
            enabled: self.enabled,
            tokens: self.tokens.read().len(),
            resolved: self.resolved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Authorizer for TokenStore {
    fn resolve(&self, identity: &Identity) -> VarResult<Arc<Acl>> {
        if !self.enabled {
            return Ok(Arc::clone(&self.management));
        }
        let acl = match identity.secret_id.as_deref() {
            None | Some("") => Some(Arc::clone(&self.anonymous.read())),
            Some(secret) => self.tokens.read().get(secret).cloned(),
        };
        match acl {
            Some(acl) => {
                self.resolved.fetch_add(1, Ordering::Relaxed);
                Ok(acl)
            }
            None => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(VarError::PermissionDenied)
            }
        }
    }
}
