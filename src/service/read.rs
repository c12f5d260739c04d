//! Query path: Read, List, ListAll and RenewLock.
//!
//! Lock details never leave these operations unless the caller holds a
//! management token; RenewLock is the exception, since the caller proved
//! ownership by presenting the lock ID.

use super::{target_namespace, VariablesService};
use crate::acl::{Acl, Capabilities};
use crate::cluster::MIN_VERSION_VARIABLE_LOCKS;
use crate::core::error::{VarError, VarResult};
use crate::crypto::open_items;
use crate::state::paginator::Paginator;
use crate::vars::model::{
    validate_path, VarKey, VariableDecrypted, VariableEncrypted, VariableMetadata, ALL_NAMESPACES,
};
use crate::vars::ops::{
    VarListRequest, VarListResponse, VarReadRequest, VarReadResponse, VarRenewLockRequest,
    VarRenewLockResponse,
};
use std::sync::atomic::Ordering;
use tracing::debug;

impl VariablesService {
    /// Read one variable, decrypted.
    ///
    /// The response index is the variable's modify index, or the table index
    /// when it does not exist.
    pub async fn read(&self, req: VarReadRequest) -> VarResult<VarReadResponse> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let acl = self.resolve(&req.identity)?;
        let namespace = target_namespace(&req.namespace);
        if !acl.allow(namespace, &req.path, Capabilities::READ) {
            return Err(VarError::PermissionDenied);
        }
        let key = VarKey::new(namespace, req.path.as_str());

        let (data, meta) = self
            .blocking_query(&req.query, |store| match store.get(&key) {
                Some(stored) => {
                    let index = stored.metadata.modify_index;
                    Ok((Some(self.decrypt_for(stored, &acl)?), index))
                }
                None => Ok((None, store.table_index())),
            })
            .await?;
        Ok(VarReadResponse { data, meta })
    }

    /// List metadata under a prefix in one namespace, or in all of them when
    /// the namespace is `*`.
    pub async fn list(&self, req: VarListRequest) -> VarResult<VarListResponse> {
        if req.namespace == ALL_NAMESPACES {
            return self.list_all(req).await;
        }
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        let acl = self.resolve(&req.identity)?;
        let namespace = target_namespace(&req.namespace).to_string();
        let paginator = self.paginator(&req)?;

        let ((data, next_token), meta) = self
            .blocking_query(&req.query, |store| {
                let items = store.list_prefix(&namespace, &req.prefix);
                Ok((list_page(&paginator, items, &acl), store.table_index()))
            })
            .await?;
        Ok(VarListResponse {
            data,
            next_token,
            meta,
        })
    }

    /// List metadata under a prefix across every namespace the caller can
    /// list. The request namespace is ignored.
    pub async fn list_all(&self, req: VarListRequest) -> VarResult<VarListResponse> {
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        let acl = self.resolve(&req.identity)?;
        let paginator = self.paginator(&req)?;

        let ((data, next_token), meta) = self
            .blocking_query(&req.query, |store| {
                let items = store.list_all(&req.prefix);
                Ok((list_page(&paginator, items, &acl), store.table_index()))
            })
            .await?;
        Ok(VarListResponse {
            data,
            next_token,
            meta,
        })
    }

    /// Extend the TTL of a held lock.
    pub fn renew_lock(&self, req: VarRenewLockRequest) -> VarResult<VarRenewLockResponse> {
        let acl = self.resolve(&req.identity)?;
        self.require_version(&MIN_VERSION_VARIABLE_LOCKS, "use variable locks")?;

        let namespace = target_namespace(&req.namespace);
        if !acl.allow(namespace, &req.path, Capabilities::WRITE) {
            return Err(VarError::PermissionDenied);
        }
        validate_path(&req.path)?;
        if req.lock_id.is_empty() {
            return Err(VarError::MissingLockInfo);
        }

        let key = VarKey::new(namespace, req.path.as_str());
        let stored = self.store.get(&key).ok_or(VarError::VariableNotFound)?;
        let held = stored.metadata.lock_id().ok_or(VarError::LockNotFound)?;
        if held != req.lock_id {
            return Err(VarError::NotLockHolder);
        }

        // A held lock without a live timer has already expired.
        self.timers
            .renew_timer(&key, &req.lock_id)
            .map_err(|e| match e {
                VarError::NotLeader => VarError::NotLeader,
                _ => VarError::NotLockHolder,
            })?;

        self.counters.renewals.fetch_add(1, Ordering::Relaxed);
        debug!(variable = %key, "lock renewed");
        let index = stored.metadata.modify_index;
        Ok(VarRenewLockResponse {
            metadata: stored.metadata,
            index,
        })
    }

    fn paginator(&self, req: &VarListRequest) -> VarResult<Paginator> {
        let per_page = if req.query.per_page == 0 {
            self.settings.query.default_per_page
        } else {
            req.query.per_page
        };
        Paginator::new(per_page, &req.query.next_token, req.query.reverse)
    }

    fn decrypt_for(&self, stored: VariableEncrypted, acl: &Acl) -> VarResult<VariableDecrypted> {
        let items = open_items(self.encrypter.as_ref(), &stored.data)?;
        let mut metadata = stored.metadata;
        if !acl.is_management() {
            metadata.strip_lock();
        }
        Ok(VariableDecrypted { metadata, items })
    }
}

/// Page of listable metadata, lock details stripped for non-management.
fn list_page(
    paginator: &Paginator,
    items: Vec<VariableEncrypted>,
    acl: &Acl,
) -> (Vec<VariableMetadata>, String) {
    paginator.page(
        items,
        VariableEncrypted::key,
        |v| {
            acl.allow(
                &v.metadata.namespace,
                &v.metadata.path,
                Capabilities::LIST,
            )
        },
        |v| {
            let mut metadata = v.metadata;
            if !acl.is_management() {
                metadata.strip_lock();
            }
            metadata
        },
    )
}
