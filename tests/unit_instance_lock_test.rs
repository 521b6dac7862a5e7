use mewld::core::MewldError;
use mewld::core::proc::Instance;
use mewld::core::proc::instance::LOCK_EXPIRY;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn instance() -> Instance {
    Instance::new(0, vec![0, 1], "abcdef0123456789".to_string())
}

#[test]
fn test_lock_then_unlock() {
    let inst = instance();
    assert!(!inst.locked());

    inst.try_lock("Start", false).unwrap();
    assert!(inst.locked());

    inst.unlock();
    assert!(!inst.locked());
}

#[test]
fn test_unlock_is_idempotent() {
    let inst = instance();
    inst.unlock();
    inst.unlock();
    assert!(!inst.locked());
}

#[test]
fn test_non_critical_lock_is_rejected_while_held() {
    let inst = instance();
    inst.try_lock("Stop", false).unwrap();

    let err = inst.try_lock("PingCheck", false).unwrap_err();
    match err {
        MewldError::LockedInstance { cluster_id, reason } => {
            assert_eq!(cluster_id, 0);
            assert_eq!(reason, "Stop");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(inst.locked());
}

#[test]
fn test_critical_lock_overrides_a_held_lease() {
    let inst = instance();
    inst.try_lock("Stop", false).unwrap();

    inst.try_lock("Observe", true).unwrap();
    assert!(inst.locked());

    // The critical holder's reason is now on the lease.
    let err = inst.try_lock("Start", false).unwrap_err();
    match err {
        MewldError::LockedInstance { reason, .. } => assert_eq!(reason, "Observe"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_lease_expires_without_an_explicit_unlock() {
    let inst = instance();
    inst.try_lock("Stop", false).unwrap();
    assert!(inst.locked());

    let after_expiry = Instant::now() + LOCK_EXPIRY + Duration::from_secs(1);
    assert!(!inst.locked_at(after_expiry));

    // Once the lease has lapsed, a fresh non-critical lock goes through.
    inst.try_lock_at("PingCheck", false, after_expiry).unwrap();
    assert!(inst.locked_at(after_expiry));
}

#[test]
fn test_lease_is_still_held_just_before_expiry() {
    let inst = instance();
    inst.try_lock("Stop", false).unwrap();

    let just_before = Instant::now() + LOCK_EXPIRY - Duration::from_secs(1);
    assert!(inst.locked_at(just_before));

    let err = inst.try_lock_at("PingCheck", false, just_before).unwrap_err();
    assert!(matches!(err, MewldError::LockedInstance { .. }));
}

#[tokio::test]
async fn test_acquire_lock_waits_for_the_holder() {
    let inst = Arc::new(instance());
    inst.try_lock("Stop", false).unwrap();

    let holder = Arc::clone(&inst);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        holder.unlock();
    });

    let started = std::time::Instant::now();
    inst.acquire_lock().await;
    assert!(started.elapsed() >= Duration::from_millis(200));
    // acquire_lock does not take the lease itself.
    assert!(!inst.locked());
}

#[tokio::test]
async fn test_acquire_and_lock_takes_the_lease() {
    let inst = Arc::new(instance());
    inst.try_lock("Stop", false).unwrap();

    let holder = Arc::clone(&inst);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        holder.unlock();
    });

    inst.acquire_and_lock("RollingRestart").await;
    assert!(inst.locked());

    let err = inst.try_lock("Start", false).unwrap_err();
    match err {
        MewldError::LockedInstance { reason, .. } => assert_eq!(reason, "RollingRestart"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_clearing_the_session_retires_the_token() {
    let inst = instance();
    assert_eq!(inst.session_id(), "abcdef0123456789");

    inst.set_session_id("ffffffffffffffff");
    assert_eq!(inst.session_id(), "ffffffffffffffff");

    inst.clear_session();
    assert!(inst.session_id().is_empty());
}

#[test]
fn test_reshard_updates_slot_identity() {
    let inst = instance();
    inst.set_cluster_id(3);
    inst.set_shards(vec![6, 7]);

    assert_eq!(inst.cluster_id(), 3);
    assert_eq!(inst.shards(), vec![6, 7]);
}
