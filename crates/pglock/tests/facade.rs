//! The facade's public surface, driven end to end against the simulator.

use pglock::prelude::*;
use pglock::{AcquireOutcome, LockKey, advisory_id};
use pglock_harness::{SimServer, init_test_logging};

#[test]
fn contention_reads_as_none_through_lock_status() {
    init_test_logging();
    let server = SimServer::new();
    let mut holder = server.connect();
    let mut conn = server.connect();
    let lock = AdvisoryLock::new("facade").timeout(TimeoutValue::Immediate);
    assert_eq!(lock.acquire(&mut holder).unwrap(), AcquireOutcome::Acquired);

    let ran = LockedFn::new("facade")
        .timeout(TimeoutValue::Immediate)
        .call(&mut conn, |_| Ok("ran"))
        .lock_status()
        .unwrap();
    assert_eq!(ran, None);

    lock.release(&mut holder).unwrap();
    let ran = LockedFn::new("facade")
        .timeout(TimeoutValue::Immediate)
        .call(&mut conn, |_| Ok("ran"))
        .lock_status()
        .unwrap();
    assert_eq!(ran, Some(Some("ran")));
}

#[test]
fn lock_ids_are_exposed_for_catalog_correlation() {
    let (class_id, object_id) = advisory_id("facade");
    let id = LockKey::from("facade").id();
    assert_eq!(class_id, id >> 32);
    assert_eq!(object_id, id & 0xFFFF_FFFF);
}
