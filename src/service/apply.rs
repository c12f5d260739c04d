//! Apply path: Set, CAS, Delete, DeleteCAS, LockAcquire and LockRelease.
//!
//! A request moves through fixed stages: authenticate, version gate,
//! authorize, canonicalize and validate, encrypt, commit to the log, build
//! the response, then start or stop lock timers. Any stage may fail the
//! request; nothing after a failed stage runs. Timer work happens after the
//! commit and only logs on failure, since the committed state already
//! reflects the mutation.

use super::{target_namespace, VariablesService};
use crate::acl::{Acl, Capabilities};
use crate::cluster::{MIN_VERSION_KEYRING, MIN_VERSION_VARIABLE_LOCKS};
use crate::core::error::{messages, VarError, VarResult};
use crate::crypto::{open_items, seal_items};
use crate::state::log::AppliedEntry;
use crate::state::store::{StateOutcome, VarApplyStateRequest};
use crate::vars::model::{
    short_lock_id, validate_namespace_for_write, validate_path, VariableDecrypted,
    VariableEncrypted, VariableLock, VariableMetadata,
};
use crate::vars::ops::{ApplyOutcome, ConflictReason, VarApplyRequest, VarApplyResponse, VarOp};
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

impl VariablesService {
    /// Apply one mutation.
    ///
    /// Refusals by the state machine (index mismatch, lock held by someone
    /// else) are returned as `Ok` with a conflict outcome. Everything else
    /// that stops the request is an error.
    pub fn apply(&self, req: VarApplyRequest) -> VarResult<VarApplyResponse> {
        let VarApplyRequest {
            op,
            mut var,
            identity,
            namespace,
        } = req;

        let acl = self.resolve(&identity)?;

        self.require_version(&MIN_VERSION_KEYRING, "apply variables")?;
        if op.is_lock() {
            self.require_version(&MIN_VERSION_VARIABLE_LOCKS, "use variable locks")?;
        }

        if var.metadata.namespace.is_empty() {
            var.metadata.namespace = target_namespace(&namespace).to_string();
        }
        authorize_apply(&acl, op, &var)?;
        self.canonicalize_and_validate(op, &mut var)?;

        let key = var.key();
        // Early refusal only; the state machine checks the window again at
        // commit against the admission stamp.
        if op == VarOp::LockAcquire && self.timers.in_lock_delay(&key)? {
            debug!(variable = %key, "lock acquire refused during lock delay");
            return Err(VarError::AlreadyLocked);
        }

        let state_req = self.encrypt_request(op, &var)?;
        let entry = self.raft.apply(state_req)?;
        let response = self.build_response(op, var, &acl, &entry)?;

        if let StateOutcome::Ok { released_lock, .. } = &entry.outcome {
            self.counters.applied.fetch_add(1, Ordering::Relaxed);
            self.update_timers(op, &response, released_lock.as_ref());
        } else {
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            if response.is_redacted() {
                self.counters.redacted.fetch_add(1, Ordering::Relaxed);
            }
        }

        debug!(
            op = %op,
            variable = %key,
            index = entry.index,
            result = ?response.result,
            "variable apply"
        );
        Ok(response)
    }

    /// Fill defaults and reject malformed requests, per operation.
    fn canonicalize_and_validate(&self, op: VarOp, var: &mut VariableDecrypted) -> VarResult<()> {
        match op {
            VarOp::Set | VarOp::Cas => {
                if let Some(ref lock) = var.metadata.lock {
                    if !lock.ttl.is_zero() || !lock.lock_delay.is_zero() {
                        return Err(VarError::invalid(messages::LOCK_ON_CREATION));
                    }
                }
                var.validate()
            }
            VarOp::Delete | VarOp::DeleteCas => {
                if var.metadata.path.is_empty() {
                    return Err(VarError::invalid(messages::DELETE_REQUIRES_PATH));
                }
                validate_namespace_for_write(&var.metadata.namespace)
            }
            VarOp::LockAcquire => {
                let defaults = &self.settings.lock_defaults;
                var.canonicalize_lock(defaults);
                var.validate_for_lock(defaults)?;
                if let Some(ref mut lock) = var.metadata.lock {
                    lock.id = uuid::Uuid::new_v4().to_string();
                }
                Ok(())
            }
            VarOp::LockRelease => {
                match var.metadata.lock {
                    Some(ref lock) if !lock.id.is_empty() => {}
                    _ => return Err(VarError::MissingLockInfo),
                }
                if !var.items.is_empty() {
                    return Err(VarError::invalid(messages::ITEMS_ON_RELEASE));
                }
                validate_namespace_for_write(&var.metadata.namespace)?;
                validate_path(&var.metadata.path)
            }
        }
    }

    /// Build the log entry, encrypting the payload of writes.
    fn encrypt_request(&self, op: VarOp, var: &VariableDecrypted) -> VarResult<VarApplyStateRequest> {
        let now = self.clock.now_unix_nanos();
        let mut metadata = var.metadata.clone();
        metadata.create_time = now;
        metadata.modify_time = now;

        let mut encrypted = VariableEncrypted::metadata_only(metadata);
        if op.writes_payload() {
            encrypted.data = seal_items(self.encrypter.as_ref(), &var.items)?;
        }

        let mut state_req = VarApplyStateRequest::new(op.into(), encrypted);
        // Locking an existing variable without items keeps its payload.
        state_req.keep_payload = op == VarOp::LockAcquire && var.items.is_empty();
        Ok(state_req)
    }

    fn build_response(
        &self,
        op: VarOp,
        input: VariableDecrypted,
        acl: &Acl,
        entry: &AppliedEntry,
    ) -> VarResult<VarApplyResponse> {
        let mut response = VarApplyResponse {
            op,
            input,
            result: ApplyOutcome::Ok,
            output: None,
            conflict: None,
            conflict_reason: None,
            index: entry.index,
        };

        match &entry.outcome {
            StateOutcome::Ok { written, .. } => {
                response.output = written
                    .clone()
                    .map(|metadata| self.output_for(metadata, &response.input, acl));
            }
            StateOutcome::Conflict { current, reason } => {
                let (result, conflict) = self.conflict_for(current, acl)?;
                response.result = result;
                response.conflict = Some(conflict);
                response.conflict_reason = Some(*reason);
            }
        }
        Ok(response)
    }

    /// Written metadata paired with the caller's own items.
    ///
    /// Lock details are returned to the holder and to management tokens only.
    fn output_for(
        &self,
        mut metadata: VariableMetadata,
        input: &VariableDecrypted,
        acl: &Acl,
    ) -> VariableDecrypted {
        let is_owner = match (input.metadata.lock_id(), metadata.lock_id()) {
            (Some(requested), Some(held)) => requested == held,
            _ => false,
        };
        if !is_owner && !acl.is_management() {
            metadata.strip_lock();
        }
        VariableDecrypted {
            metadata,
            items: input.items.clone(),
        }
    }

    /// Stored value that caused a conflict, as far as the caller may see it.
    fn conflict_for(
        &self,
        current: &VariableEncrypted,
        acl: &Acl,
    ) -> VarResult<(ApplyOutcome, VariableDecrypted)> {
        let meta = &current.metadata;
        let mut metadata = meta.clone();
        if !acl.is_management() {
            metadata.strip_lock();
        }

        if !acl.allow(&meta.namespace, &meta.path, Capabilities::READ) {
            let conflict = VariableDecrypted {
                metadata,
                items: Default::default(),
            };
            return Ok((ApplyOutcome::Redacted, conflict));
        }

        if !current.has_payload() {
            let zero = VariableDecrypted::new(
                meta.namespace.clone(),
                meta.path.clone(),
                Default::default(),
            );
            return Ok((ApplyOutcome::Conflict, zero));
        }

        let items = open_items(self.encrypter.as_ref(), &current.data)?;
        Ok((ApplyOutcome::Conflict, VariableDecrypted { metadata, items }))
    }

    fn update_timers(
        &self,
        op: VarOp,
        response: &VarApplyResponse,
        released: Option<&VariableLock>,
    ) {
        let key = response.input.key();

        if op == VarOp::LockAcquire {
            if let Some(ref lock) = response.input.metadata.lock {
                if let Err(e) = self.timers.create_timer(&key, lock) {
                    warn!(
                        variable = %key,
                        lock = short_lock_id(&lock.id),
                        error = %e,
                        "failed to start lock timer"
                    );
                }
            }
        }

        if let Some(lock) = released {
            if let Err(e) = self.timers.release_timer(&key, lock) {
                warn!(
                    variable = %key,
                    lock = lock.short_id(),
                    error = %e,
                    "failed to stop lock timer"
                );
            }
        }
    }
}

/// Capability check per operation: deletes need destroy, all else write.
fn authorize_apply(acl: &Acl, op: VarOp, var: &VariableDecrypted) -> VarResult<()> {
    let needed = if op.is_delete() {
        Capabilities::DESTROY
    } else {
        Capabilities::WRITE
    };
    if acl.allow(&var.metadata.namespace, &var.metadata.path, needed) {
        Ok(())
    } else {
        Err(VarError::PermissionDenied)
    }
}
