//! Variables service tests: apply, read, list, locks, ACLs and blocking.

mod common;

use common::{items, management, Harness, START_NANOS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use varvault::acl::{Capabilities, Identity, Policy};
use varvault::cluster::{MemberStatus, ServerMember, Version};
use varvault::core::error::{messages, VarError, VarResult};
use varvault::crypto::Encrypter;
use varvault::locks::VariableTimers;
use varvault::service::ServiceSettings;
use varvault::state::{AppliedEntry, LocalLog, RaftApplier, StateOp, VarApplyStateRequest};
use varvault::vars::ops::{
    QueryOptions, VarListRequest, VarReadRequest, VarRenewLockRequest,
};
use varvault::vars::{
    ApplyOutcome, ConflictReason, VarApplyRequest, VariableDecrypted, VariableItems, VariableLock,
};

fn var(path: &str, pairs: &[(&str, &str)]) -> VariableDecrypted {
    VariableDecrypted::new("default", path, items(pairs))
}

async fn read(h: &Harness, path: &str, identity: Identity) -> Option<VariableDecrypted> {
    h.service
        .read(VarReadRequest::new("default", path, identity))
        .await
        .unwrap()
        .data
}

// ============================================================================
// Set / CAS / Delete
// ============================================================================

#[tokio::test]
async fn set_then_cas_then_stale_cas() {
    let h = Harness::new();

    let resp = h
        .service
        .apply(VarApplyRequest::set(var("a/b", &[("k", "v")]), management()))
        .unwrap();
    assert!(resp.is_ok());
    assert_eq!(resp.index, 1);
    let output = resp.output.unwrap();
    assert_eq!(output.metadata.create_index, 1);
    assert_eq!(output.metadata.modify_index, 1);
    assert_eq!(output.items, items(&[("k", "v")]));

    let resp = h
        .service
        .apply(VarApplyRequest::cas(var("a/b", &[("k", "v2")]), 1, management()))
        .unwrap();
    assert!(resp.is_ok());
    assert_eq!(resp.index, 2);
    assert_eq!(resp.output.unwrap().metadata.create_index, 1);

    let resp = h
        .service
        .apply(VarApplyRequest::cas(var("a/b", &[("k", "v3")]), 1, management()))
        .unwrap();
    assert_eq!(resp.result, ApplyOutcome::Conflict);
    assert_eq!(resp.conflict_reason, Some(ConflictReason::IndexMismatch));
    let conflict = resp.conflict.clone().unwrap();
    assert_eq!(conflict.metadata.modify_index, 2);
    assert_eq!(conflict.items, items(&[("k", "v2")]));
    assert_eq!(
        resp.conflict_error(),
        Some(VarError::ConflictCas {
            namespace: "default".into(),
            path: "a/b".into(),
            modify_index: 2,
        })
    );

    let stored = read(&h, "a/b", management()).await.unwrap();
    assert_eq!(stored.items, items(&[("k", "v2")]));
}

#[tokio::test]
async fn cas_zero_creates_only_once() {
    let h = Harness::new();
    let first = h
        .service
        .apply(VarApplyRequest::cas(var("once", &[("k", "1")]), 0, management()))
        .unwrap();
    assert!(first.is_ok());

    let second = h
        .service
        .apply(VarApplyRequest::cas(var("once", &[("k", "2")]), 0, management()))
        .unwrap();
    assert!(second.is_conflict());
    assert_eq!(second.conflict.unwrap().metadata.modify_index, first.index);
}

#[tokio::test]
async fn cas_on_missing_variable_returns_zero_value() {
    let h = Harness::new();
    let resp = h
        .service
        .apply(VarApplyRequest::cas(var("ghost", &[("k", "v")]), 7, management()))
        .unwrap();
    assert_eq!(resp.result, ApplyOutcome::Conflict);
    let conflict = resp.conflict.unwrap();
    assert_eq!(conflict.metadata.namespace, "default");
    assert_eq!(conflict.metadata.path, "ghost");
    assert_eq!(conflict.metadata.modify_index, 0);
    assert!(conflict.items.is_empty());
}

#[tokio::test]
async fn delete_and_delete_cas() {
    let h = Harness::new();

    let resp = h
        .service
        .apply(VarApplyRequest::delete("default", "missing", management()))
        .unwrap();
    assert!(resp.is_ok());
    assert!(resp.output.is_none());

    let index = h.set("doomed", &[("k", "v")]);
    let resp = h
        .service
        .apply(VarApplyRequest::delete_cas("default", "doomed", index + 10, management()))
        .unwrap();
    assert_eq!(resp.conflict_reason, Some(ConflictReason::IndexMismatch));

    let resp = h
        .service
        .apply(VarApplyRequest::delete_cas("default", "doomed", index, management()))
        .unwrap();
    assert!(resp.is_ok());
    assert!(read(&h, "doomed", management()).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn writes_stamp_times_from_clock() {
    let h = Harness::new();
    h.set("timed", &[("k", "v")]);
    h.clock.advance(Duration::from_secs(5));

    let resp = h
        .service
        .apply(VarApplyRequest::set(var("timed", &[("k", "v2")]), management()))
        .unwrap();
    let meta = resp.output.unwrap().metadata;
    assert_eq!(meta.create_time, START_NANOS);
    assert_eq!(meta.modify_time, START_NANOS + 5_000_000_000);
}

#[tokio::test]
async fn empty_namespace_falls_back_to_request_namespace() {
    let h = Harness::new();
    let var = VariableDecrypted::new("", "scoped", items(&[("k", "v")]));
    let resp = h
        .service
        .apply(VarApplyRequest::set(var, management()).in_namespace("prod"))
        .unwrap();
    assert_eq!(resp.output.unwrap().metadata.namespace, "prod");

    let resp = h
        .service
        .read(VarReadRequest::new("prod", "scoped", management()))
        .await
        .unwrap();
    assert!(resp.data.is_some());
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let h = Harness::new();

    let err = h
        .service
        .apply(VarApplyRequest::set(var("empty", &[]), management()))
        .unwrap_err();
    assert!(matches!(err, VarError::InvalidArgument { .. }));

    let locked = var("lockset", &[("k", "v")])
        .with_lock(VariableLock::new(Duration::from_secs(5), Duration::ZERO));
    let err = h
        .service
        .apply(VarApplyRequest::set(locked, management()))
        .unwrap_err();
    assert_eq!(err, VarError::invalid(messages::LOCK_ON_CREATION));

    let wildcard = VariableDecrypted::new("*", "x", items(&[("k", "v")]));
    let err = h
        .service
        .apply(VarApplyRequest::set(wildcard, management()))
        .unwrap_err();
    assert_eq!(err, VarError::invalid(messages::WILDCARD_NAMESPACE));

    let nul = VariableDecrypted::new("bad\0ns", "x", items(&[("k", "v")]));
    let err = h
        .service
        .apply(VarApplyRequest::set(nul, management()))
        .unwrap_err();
    assert!(matches!(err, VarError::InvalidArgument { .. }));

    let err = h
        .service
        .apply(VarApplyRequest::lock_release("bad\0ns", "x", "some-id", management()))
        .unwrap_err();
    assert!(matches!(err, VarError::InvalidArgument { .. }));

    let err = h
        .service
        .apply(VarApplyRequest::delete("default", "", management()))
        .unwrap_err();
    assert_eq!(err, VarError::invalid(messages::DELETE_REQUIRES_PATH));

    let err = h
        .service
        .apply(VarApplyRequest::set(var("bad path!", &[("k", "v")]), management()))
        .unwrap_err();
    assert!(matches!(err, VarError::InvalidArgument { .. }));

    let err = h
        .service
        .apply(VarApplyRequest::lock_release("default", "x", "", management()))
        .unwrap_err();
    assert_eq!(err, VarError::MissingLockInfo);

    let mut release = VarApplyRequest::lock_release("default", "x", "some-id", management());
    release.var.items = items(&[("k", "v")]);
    let err = h.service.apply(release).unwrap_err();
    assert_eq!(err, VarError::invalid(messages::ITEMS_ON_RELEASE));

    let short = VariableDecrypted::new("default", "short", VariableItems::new())
        .with_lock(VariableLock::new(Duration::from_millis(10), Duration::ZERO));
    let err = h
        .service
        .apply(VarApplyRequest::lock_acquire(short, management()))
        .unwrap_err();
    assert!(matches!(err, VarError::InvalidArgument { .. }));

    assert_eq!(h.store.latest_index(), 0);
}

// ============================================================================
// Locks
// ============================================================================

#[tokio::test(start_paused = true)]
async fn lock_lifecycle_with_expiry_and_delay() {
    let h = Harness::new();
    let lock_id = h.acquire("locks/a", Duration::from_secs(2), Duration::from_secs(1));
    assert!(!lock_id.is_empty());

    // Writes without the lock ID conflict.
    let resp = h
        .service
        .apply(VarApplyRequest::set(var("locks/a", &[("k", "v")]), management()))
        .unwrap();
    assert_eq!(resp.conflict_reason, Some(ConflictReason::NotLockHolder));
    assert_eq!(resp.conflict_error(), Some(VarError::NotLockHolder));

    // The holder may write and keeps the lock.
    let holder_write = var("locks/a", &[("k", "v")]).with_lock(VariableLock::with_id(&lock_id));
    let resp = h
        .service
        .apply(VarApplyRequest::set(holder_write, management()))
        .unwrap();
    assert!(resp.is_ok());
    let written_index = resp.index;
    let output = resp.output.unwrap();
    assert_eq!(output.metadata.lock_id(), Some(lock_id.as_str()));

    let err = h
        .service
        .renew_lock(VarRenewLockRequest::new("default", "locks/a", "wrong", management()))
        .unwrap_err();
    assert_eq!(err, VarError::NotLockHolder);

    let renewed = h
        .service
        .renew_lock(VarRenewLockRequest::new("default", "locks/a", &lock_id, management()))
        .unwrap();
    assert_eq!(renewed.index, written_index);
    assert_eq!(renewed.metadata.lock_id(), Some(lock_id.as_str()));

    // TTL runs out at 2s; the delay window lasts until 3s.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let stored = read(&h, "locks/a", management()).await.unwrap();
    assert!(stored.metadata.lock.is_none());
    assert_eq!(stored.items, items(&[("k", "v")]));

    let again = VariableDecrypted::new("default", "locks/a", VariableItems::new())
        .with_lock(VariableLock::new(Duration::from_secs(2), Duration::from_secs(1)));
    let err = h
        .service
        .apply(VarApplyRequest::lock_acquire(again.clone(), management()))
        .unwrap_err();
    assert_eq!(err, VarError::AlreadyLocked);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let resp = h
        .service
        .apply(VarApplyRequest::lock_acquire(again, management()))
        .unwrap();
    assert!(resp.is_ok());
    assert_ne!(resp.output.unwrap().metadata.lock_id(), Some(lock_id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn release_opens_lock_delay() {
    let h = Harness::new();
    let lock_id = h.acquire("locks/r", Duration::from_secs(10), Duration::from_secs(1));
    let registry = h.timers.current().unwrap();
    assert_eq!(registry.stats().active_timers, 1);

    let resp = h
        .service
        .apply(VarApplyRequest::lock_release("default", "locks/r", "not-mine", management()))
        .unwrap();
    assert_eq!(resp.conflict_reason, Some(ConflictReason::NotLockHolder));

    let resp = h
        .service
        .apply(VarApplyRequest::lock_release("default", "locks/r", &lock_id, management()))
        .unwrap();
    assert!(resp.is_ok());
    let output = resp.output.unwrap();
    assert!(output.metadata.lock.is_none());
    assert_eq!(registry.stats().active_timers, 0);

    let acquire = VariableDecrypted::new("default", "locks/r", VariableItems::new())
        .with_lock(VariableLock::new(Duration::from_secs(10), Duration::ZERO));
    let err = h
        .service
        .apply(VarApplyRequest::lock_acquire(acquire.clone(), management()))
        .unwrap_err();
    assert_eq!(err, VarError::AlreadyLocked);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(h
        .service
        .apply(VarApplyRequest::lock_acquire(acquire, management()))
        .unwrap()
        .is_ok());
}

#[tokio::test]
async fn release_without_lock_conflicts() {
    let h = Harness::new();

    let resp = h
        .service
        .apply(VarApplyRequest::lock_release("default", "nothing", "id", management()))
        .unwrap();
    assert_eq!(resp.conflict_reason, Some(ConflictReason::LockNotHeld));
    assert!(resp.conflict.unwrap().items.is_empty());

    h.set("plain", &[("k", "v")]);
    let resp = h
        .service
        .apply(VarApplyRequest::lock_release("default", "plain", "id", management()))
        .unwrap();
    assert_eq!(resp.conflict_reason, Some(ConflictReason::LockNotHeld));
    assert_eq!(resp.conflict_error(), Some(VarError::LockNotFound));
}

#[tokio::test]
async fn acquire_on_locked_variable_conflicts() {
    let h = Harness::new();
    h.acquire("busy", Duration::from_secs(30), Duration::ZERO);

    let again = VariableDecrypted::new("default", "busy", VariableItems::new())
        .with_lock(VariableLock::new(Duration::from_secs(30), Duration::ZERO));
    let resp = h
        .service
        .apply(VarApplyRequest::lock_acquire(again, management()))
        .unwrap();
    assert_eq!(resp.conflict_reason, Some(ConflictReason::AlreadyLocked));
}

#[tokio::test]
async fn acquire_keeps_existing_payload() {
    let h = Harness::new();
    h.set("cfg", &[("user", "admin")]);
    h.acquire("cfg", Duration::from_secs(30), Duration::ZERO);

    let stored = read(&h, "cfg", management()).await.unwrap();
    assert_eq!(stored.items, items(&[("user", "admin")]));
    assert!(stored.metadata.lock.is_some());
}

#[tokio::test]
async fn acquire_on_new_variable_stores_empty_items() {
    let h = Harness::new();
    h.acquire("fresh", Duration::from_secs(30), Duration::ZERO);
    let stored = read(&h, "fresh", management()).await.unwrap();
    assert!(stored.items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn holder_can_delete_locked_variable() {
    let h = Harness::new();
    h.set("held", &[("k", "v")]);
    let lock_id = h.acquire("held", Duration::from_secs(30), Duration::from_secs(1));

    let resp = h
        .service
        .apply(VarApplyRequest::delete("default", "held", management()))
        .unwrap();
    assert_eq!(resp.conflict_reason, Some(ConflictReason::NotLockHolder));

    let mut delete = VarApplyRequest::delete("default", "held", management());
    delete.var.metadata.lock = Some(VariableLock::with_id(&lock_id));
    assert!(h.service.apply(delete).unwrap().is_ok());
    assert!(read(&h, "held", management()).await.is_none());

    let registry = h.timers.current().unwrap();
    assert_eq!(registry.stats().active_timers, 0);
    assert_eq!(registry.stats().delayed_paths, 1);
}

#[tokio::test]
async fn renew_lock_errors() {
    let h = Harness::new();

    let renew = |path: &str, id: &str| {
        h.service
            .renew_lock(VarRenewLockRequest::new("default", path, id, management()))
    };

    assert_eq!(renew("missing", "id").unwrap_err(), VarError::VariableNotFound);

    h.set("plain", &[("k", "v")]);
    assert_eq!(renew("plain", "id").unwrap_err(), VarError::LockNotFound);

    let lock_id = h.acquire("held", Duration::from_secs(30), Duration::ZERO);
    assert_eq!(renew("held", "wrong").unwrap_err(), VarError::NotLockHolder);
    assert_eq!(renew("held", "").unwrap_err(), VarError::MissingLockInfo);
    assert!(renew("held", &lock_id).is_ok());
    assert_eq!(h.service.stats().renewals, 1);
}

#[tokio::test(start_paused = true)]
async fn expired_lock_cannot_be_renewed() {
    let h = Harness::new();
    let lock_id = h.acquire("short", Duration::from_secs(1), Duration::ZERO);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let err = h
        .service
        .renew_lock(VarRenewLockRequest::new("default", "short", &lock_id, management()))
        .unwrap_err();
    assert_eq!(err, VarError::LockNotFound);
}

#[tokio::test]
async fn lock_operations_need_a_leader() {
    let h = Harness::new();
    h.timers.revoke();
    assert!(!h.timers.is_leader());

    let var = VariableDecrypted::new("default", "l", VariableItems::new())
        .with_lock(VariableLock::new(Duration::from_secs(5), Duration::ZERO));
    let err = h
        .service
        .apply(VarApplyRequest::lock_acquire(var, management()))
        .unwrap_err();
    assert_eq!(err, VarError::NotLeader);

    // Plain writes do not touch timers.
    h.set("plain", &[("k", "v")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_have_one_winner() {
    let h = Harness::new();
    h.set("contended", &[("k", "v")]);

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&h.service);
            tokio::task::spawn_blocking(move || {
                let var = VariableDecrypted::new("default", "contended", VariableItems::new())
                    .with_lock(VariableLock::new(Duration::from_secs(30), Duration::ZERO));
                service.apply(VarApplyRequest::lock_acquire(var, management()))
            })
        })
        .collect();

    let mut winners = Vec::new();
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(resp) if resp.is_ok() => winners.push(resp),
            Ok(resp) => assert_eq!(resp.conflict_reason, Some(ConflictReason::AlreadyLocked)),
            Err(e) => assert_eq!(e, VarError::AlreadyLocked),
        }
    }
    assert_eq!(winners.len(), 1);

    let held = winners[0].output.as_ref().unwrap().metadata.lock_id().unwrap();
    let stored = read(&h, "contended", management()).await.unwrap();
    assert_eq!(stored.metadata.lock_id(), Some(held));
    assert_eq!(stored.items, items(&[("k", "v")]));
    assert_eq!(h.timers.current().unwrap().stats().active_timers, 1);
}

/// Holds the next LockAcquire before it reaches the log.
struct SlowAcquire {
    log: Arc<LocalLog>,
    armed: Arc<AtomicBool>,
    hold: Duration,
}

impl RaftApplier for SlowAcquire {
    fn apply(&self, req: VarApplyStateRequest) -> VarResult<AppliedEntry> {
        if req.op == StateOp::LockAcquire && self.armed.swap(false, Ordering::SeqCst) {
            std::thread::sleep(self.hold);
        }
        self.log.apply(req)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acquire_stalled_across_expiry_is_refused() {
    let mut settings = ServiceSettings::default();
    settings.lock_defaults.min_ttl = Duration::from_millis(50);
    let armed = Arc::new(AtomicBool::new(false));
    let h = Harness::with_raft(settings, |log| {
        Arc::new(SlowAcquire {
            log,
            armed: Arc::clone(&armed),
            hold: Duration::from_millis(600),
        })
    });

    let first = h.acquire("stalled", Duration::from_millis(200), Duration::from_secs(5));

    // Admitted while the first lock is held, so the delay check passes; the
    // commit lands after the TTL fires and the delay window has opened.
    armed.store(true, Ordering::SeqCst);
    let service = Arc::clone(&h.service);
    let resp = tokio::task::spawn_blocking(move || {
        let var = VariableDecrypted::new("default", "stalled", VariableItems::new())
            .with_lock(VariableLock::new(Duration::from_secs(30), Duration::ZERO));
        service.apply(VarApplyRequest::lock_acquire(var, management()))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(resp.conflict_reason, Some(ConflictReason::AlreadyLocked));

    let stored = read(&h, "stalled", management()).await.unwrap();
    assert!(stored.metadata.lock.is_none(), "lock {:?} replaced {first}", stored.metadata.lock);
    let registry = h.timers.current().unwrap();
    assert_eq!(registry.stats().expired, 1);
    assert_eq!(registry.stats().active_timers, 0);
}

// ============================================================================
// ACLs and redaction
// ============================================================================

fn acl_harness() -> Harness {
    let h = Harness::with_acl();
    h.tokens.insert_client(
        "writer",
        vec![Policy::new("write-only").with_rule("default", "secret/*", Capabilities::WRITE)],
    );
    let rw = Capabilities::READ | Capabilities::WRITE | Capabilities::LIST;
    h.tokens.insert_client(
        "rw",
        vec![Policy::new("rw").with_rule("default", "secret/*", rw)],
    );
    h.tokens.insert_client(
        "rw-2",
        vec![Policy::new("rw").with_rule("default", "secret/*", rw)],
    );
    h
}

#[tokio::test]
async fn conflict_is_redacted_without_read() {
    let h = acl_harness();
    h.set("secret/db", &[("pass", "hunter2")]);

    let resp = h
        .service
        .apply(VarApplyRequest::cas(
            var("secret/db", &[("pass", "x")]),
            0,
            Identity::token("writer"),
        ))
        .unwrap();
    assert_eq!(resp.result, ApplyOutcome::Redacted);
    let conflict = resp.conflict.unwrap();
    assert!(conflict.items.is_empty());
    assert_eq!(conflict.metadata.path, "secret/db");
    assert_eq!(conflict.metadata.modify_index, 1);

    let resp = h
        .service
        .apply(VarApplyRequest::cas(
            var("secret/db", &[("pass", "x")]),
            0,
            Identity::token("rw"),
        ))
        .unwrap();
    assert_eq!(resp.result, ApplyOutcome::Conflict);
    assert_eq!(resp.conflict.unwrap().items, items(&[("pass", "hunter2")]));

    let stats = h.service.stats();
    assert_eq!(stats.conflicts, 2);
    assert_eq!(stats.redacted, 1);
}

#[tokio::test]
async fn capabilities_gate_operations() {
    let h = acl_harness();
    h.set("secret/db", &[("pass", "hunter2")]);

    let err = h
        .service
        .apply(VarApplyRequest::set(var("secret/db", &[("k", "v")]), Identity::anonymous()))
        .unwrap_err();
    assert_eq!(err, VarError::PermissionDenied);

    let err = h
        .service
        .apply(VarApplyRequest::set(var("secret/db", &[("k", "v")]), Identity::token("nope")))
        .unwrap_err();
    assert_eq!(err, VarError::PermissionDenied);

    let err = h
        .service
        .apply(VarApplyRequest::set(var("public/x", &[("k", "v")]), Identity::token("rw")))
        .unwrap_err();
    assert_eq!(err, VarError::PermissionDenied);

    let err = h
        .service
        .apply(VarApplyRequest::delete("default", "secret/db", Identity::token("rw")))
        .unwrap_err();
    assert_eq!(err, VarError::PermissionDenied);

    let err = h
        .service
        .read(VarReadRequest::new("default", "secret/db", Identity::token("writer")))
        .await
        .unwrap_err();
    assert_eq!(err, VarError::PermissionDenied);

    let listed = h
        .service
        .list(VarListRequest::new("default", "", Identity::token("writer")))
        .await
        .unwrap();
    assert!(listed.data.is_empty());
}

#[tokio::test]
async fn lock_details_only_for_holder_and_management() {
    let h = acl_harness();

    let acquire = VariableDecrypted::new("default", "secret/lock", VariableItems::new())
        .with_lock(VariableLock::new(Duration::from_secs(30), Duration::ZERO));
    let resp = h
        .service
        .apply(VarApplyRequest::lock_acquire(acquire.clone(), Identity::token("rw")))
        .unwrap();
    let lock_id = resp.output.unwrap().metadata.lock.unwrap().id;

    let seen = read(&h, "secret/lock", Identity::token("rw-2")).await.unwrap();
    assert!(seen.metadata.lock.is_none());
    let seen = read(&h, "secret/lock", management()).await.unwrap();
    assert_eq!(seen.metadata.lock_id(), Some(lock_id.as_str()));

    let listed = h
        .service
        .list(VarListRequest::new("default", "secret/", Identity::token("rw-2")))
        .await
        .unwrap();
    assert_eq!(listed.data.len(), 1);
    assert!(listed.data[0].lock.is_none());

    // A competing acquire learns the path is locked, not the lock ID.
    let resp = h
        .service
        .apply(VarApplyRequest::lock_acquire(acquire, Identity::token("rw-2")))
        .unwrap();
    assert_eq!(resp.conflict_reason, Some(ConflictReason::AlreadyLocked));
    assert!(resp.conflict.unwrap().metadata.lock.is_none());

    // Non-holder writes succeed only with the ID, and then see the lock.
    let write = var("secret/lock", &[("k", "v")]).with_lock(VariableLock::with_id(&lock_id));
    let resp = h
        .service
        .apply(VarApplyRequest::set(write, Identity::token("rw-2")))
        .unwrap();
    assert_eq!(resp.output.unwrap().metadata.lock_id(), Some(lock_id.as_str()));
}

// ============================================================================
// Version gates
// ============================================================================

#[tokio::test]
async fn version_gates_block_old_clusters() {
    let h = Harness::new();
    h.membership
        .upsert(ServerMember::new("server-2", "global", Version::new(1, 6, 0)));

    let lock = VariableDecrypted::new("default", "gated", VariableItems::new())
        .with_lock(VariableLock::new(Duration::from_secs(5), Duration::ZERO));
    let err = h
        .service
        .apply(VarApplyRequest::lock_acquire(lock.clone(), management()))
        .unwrap_err();
    assert_eq!(
        err,
        VarError::VersionMismatch {
            min_version: "1.7.0".into(),
            feature: "use variable locks".into(),
        }
    );
    let err = h
        .service
        .renew_lock(VarRenewLockRequest::new("default", "gated", "id", management()))
        .unwrap_err();
    assert!(matches!(err, VarError::VersionMismatch { .. }));

    // Plain writes only need the keyring minimum.
    h.set("gated", &[("k", "v")]);

    // Other regions do not count, servers that left do not count.
    h.membership
        .upsert(ServerMember::new("server-3", "eu", Version::new(1, 0, 0)));
    assert!(h.membership.set_status("server-2", MemberStatus::Left));
    assert!(h
        .service
        .apply(VarApplyRequest::lock_acquire(lock, management()))
        .unwrap()
        .is_ok());

    // Failed servers still count.
    h.membership.upsert(ServerMember {
        status: MemberStatus::Failed,
        ..ServerMember::new("server-2", "global", Version::new(1, 3, 0))
    });
    let err = h
        .service
        .apply(VarApplyRequest::set(var("gated-2", &[("k", "v")]), management()))
        .unwrap_err();
    assert_eq!(
        err,
        VarError::VersionMismatch {
            min_version: "1.4.0".into(),
            feature: "apply variables".into(),
        }
    );
}

// ============================================================================
// Storage and encryption failures
// ============================================================================

#[tokio::test]
async fn storage_failure_is_surfaced_and_nothing_commits() {
    let h = Harness::new();
    h.log.inject_failures(2);

    let err = h
        .service
        .apply(VarApplyRequest::set(var("x", &[("k", "v")]), management()))
        .unwrap_err();
    assert!(matches!(err, VarError::StorageApplyFailed { .. }));
    assert!(err.is_retriable());

    let lock = VariableDecrypted::new("default", "l", VariableItems::new())
        .with_lock(VariableLock::new(Duration::from_secs(5), Duration::ZERO));
    let err = h
        .service
        .apply(VarApplyRequest::lock_acquire(lock, management()))
        .unwrap_err();
    assert!(matches!(err, VarError::StorageApplyFailed { .. }));
    assert_eq!(h.timers.current().unwrap().stats().active_timers, 0);

    assert_eq!(h.store.stats().variables, 0);
    h.set("x", &[("k", "v")]);
}

#[tokio::test]
async fn payloads_are_encrypted_at_rest_and_survive_rotation() {
    let h = Harness::new();
    h.set("enc/a", &[("password", "correct-horse")]);

    let stored = h
        .store
        .get(&varvault::vars::VarKey::new("default", "enc/a"))
        .unwrap();
    assert!(!stored
        .data
        .data
        .windows(13)
        .any(|w| w == b"correct-horse"));
    let old_key = stored.data.key_id.clone();
    assert_eq!(old_key, h.keyring.active_key_id());

    let new_key = h.keyring.rotate();
    h.set("enc/b", &[("k", "v")]);
    let b = h
        .store
        .get(&varvault::vars::VarKey::new("default", "enc/b"))
        .unwrap();
    assert_eq!(b.data.key_id, new_key);

    let a = read(&h, "enc/a", management()).await.unwrap();
    assert_eq!(a.items, items(&[("password", "correct-horse")]));

    h.keyring.retire(&old_key).unwrap();
    let err = h
        .service
        .read(VarReadRequest::new("default", "enc/a", management()))
        .await
        .unwrap_err();
    assert!(matches!(err, VarError::DecryptionFailed { .. }));
    assert!(h.keyring.decrypt(&stored.data.data, &old_key).is_err());
}

// ============================================================================
// Listing and pagination
// ============================================================================

#[tokio::test]
async fn list_paginates_in_both_directions() {
    let h = Harness::new();
    for path in ["jobs/a", "jobs/b", "jobs/c", "jobs/d", "jobs/e", "other"] {
        h.set(path, &[("k", "v")]);
    }

    let page = |token: &str, reverse: bool| {
        let mut query = QueryOptions::page(2, token);
        query.reverse = reverse;
        VarListRequest::new("default", "jobs/", management()).with_query(query)
    };
    let paths = |data: &[varvault::vars::VariableMetadata]| {
        data.iter().map(|m| m.path.clone()).collect::<Vec<_>>()
    };

    let first = h.service.list(page("", false)).await.unwrap();
    assert_eq!(paths(&first.data), vec!["jobs/a", "jobs/b"]);
    let second = h.service.list(page(&first.next_token, false)).await.unwrap();
    assert_eq!(paths(&second.data), vec!["jobs/c", "jobs/d"]);
    let third = h.service.list(page(&second.next_token, false)).await.unwrap();
    assert_eq!(paths(&third.data), vec!["jobs/e"]);
    assert!(third.next_token.is_empty());
    assert_eq!(third.meta.index, h.store.table_index());

    let back = h.service.list(page("", true)).await.unwrap();
    assert_eq!(paths(&back.data), vec!["jobs/e", "jobs/d"]);
    let back = h.service.list(page(&back.next_token, true)).await.unwrap();
    assert_eq!(paths(&back.data), vec!["jobs/c", "jobs/b"]);

    let err = h.service.list(page("%%%", false)).await.unwrap_err();
    assert!(matches!(err, VarError::InvalidArgument { .. }));
}

#[tokio::test]
async fn list_all_spans_namespaces() {
    let h = Harness::new();
    h.set("app/one", &[("k", "v")]);
    let prod = VariableDecrypted::new("prod", "app/two", items(&[("k", "v")]));
    h.service
        .apply(VarApplyRequest::set(prod, management()))
        .unwrap();

    let all = h
        .service
        .list(VarListRequest::new("*", "app/", management()))
        .await
        .unwrap();
    let keys: Vec<_> = all
        .data
        .iter()
        .map(|m| (m.namespace.as_str(), m.path.as_str()))
        .collect();
    assert_eq!(keys, vec![("default", "app/one"), ("prod", "app/two")]);

    let direct = h
        .service
        .list_all(VarListRequest::new("ignored", "app/", management()))
        .await
        .unwrap();
    assert_eq!(direct.data.len(), 2);

    let scoped = h
        .service
        .list(VarListRequest::new("prod", "", management()))
        .await
        .unwrap();
    assert_eq!(scoped.data.len(), 1);
}

// ============================================================================
// Blocking queries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn blocking_read_wakes_on_write() {
    let h = Harness::new();
    let index = h.set("app/config", &[("v", "1")]);

    let svc = h.service.clone();
    let req = VarReadRequest::new("default", "app/config", management())
        .with_query(QueryOptions::blocking(index, Duration::from_secs(30)));
    let handle = tokio::spawn(async move { svc.read(req).await });
    tokio::task::yield_now().await;

    // Writes elsewhere wake the query but do not answer it.
    h.set("unrelated", &[("k", "v")]);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!handle.is_finished());

    let next = h.set("app/config", &[("v", "2")]);
    let resp = handle.await.unwrap().unwrap();
    assert_eq!(resp.meta.index, next);
    assert_eq!(resp.data.unwrap().items, items(&[("v", "2")]));
}

#[tokio::test(start_paused = true)]
async fn blocking_read_times_out_with_current_value() {
    let h = Harness::new();
    let index = h.set("app/config", &[("v", "1")]);

    let start = tokio::time::Instant::now();
    let resp = h
        .service
        .read(
            VarReadRequest::new("default", "app/config", management())
                .with_query(QueryOptions::blocking(index, Duration::from_secs(1))),
        )
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(resp.meta.index, index);
    assert_eq!(resp.data.unwrap().items, items(&[("v", "1")]));
}

#[tokio::test(start_paused = true)]
async fn blocking_read_of_missing_variable_wakes_on_create() {
    let h = Harness::new();
    h.set("other", &[("k", "v")]);

    let resp = h
        .service
        .read(VarReadRequest::new("default", "later", management()))
        .await
        .unwrap();
    assert!(resp.data.is_none());
    assert_eq!(resp.meta.index, h.store.table_index());

    let svc = h.service.clone();
    let req = VarReadRequest::new("default", "later", management())
        .with_query(QueryOptions::blocking(resp.meta.index, Duration::from_secs(30)));
    let handle = tokio::spawn(async move { svc.read(req).await });
    tokio::task::yield_now().await;

    h.set("later", &[("k", "v")]);
    let resp = handle.await.unwrap().unwrap();
    assert!(resp.data.is_some());
}

#[tokio::test(start_paused = true)]
async fn blocking_list_wakes_on_new_variable() {
    let h = Harness::new();
    let index = h.set("svc/a", &[("k", "v")]);

    let svc = h.service.clone();
    let req = VarListRequest::new("default", "svc/", management())
        .with_query(QueryOptions::blocking(index, Duration::from_secs(30)));
    let handle = tokio::spawn(async move { svc.list(req).await });
    tokio::task::yield_now().await;

    let next = h.set("svc/b", &[("k", "v")]);
    let resp = handle.await.unwrap().unwrap();
    assert_eq!(resp.meta.index, next);
    assert_eq!(resp.data.len(), 2);
    assert!(resp.meta.known_leader);
}
