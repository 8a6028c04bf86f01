//! Black-box tests against the public API with a single node acting as
//! its own manager — the degenerate case of every distributed
//! algorithm here (lock/barrier resolve locally, no peer to migrate
//! pages to or from).

use dsm::page::MAX_ALLOCATIONS;
use dsm::Config;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

static INIT: Once = Once::new();

fn setup() {
    INIT.call_once(|| {
        let cfg = Config { port: 19900, ..Config::default() };
        dsm::init(cfg).expect("dsm_init");
    });
}

#[test]
fn malloc_write_read_and_free_roundtrip() {
    setup();
    let addr = dsm::malloc(dsm::PAGE_SIZE * 2).unwrap();
    unsafe {
        let p = addr as *mut u8;
        *p = 42;
        *p.add(dsm::PAGE_SIZE) = 7;
        assert_eq!(*p, 42);
        assert_eq!(*p.add(dsm::PAGE_SIZE), 7);
    }
    let slot = (0..MAX_ALLOCATIONS)
        .find(|&i| dsm::get_allocation(i).ok() == Some(addr))
        .expect("malloc's address is discoverable by slot index");
    assert_eq!(dsm::get_allocation(slot).ok(), Some(addr));
    dsm::free(addr).unwrap();
    assert!(
        (0..MAX_ALLOCATIONS).all(|i| dsm::get_allocation(i).ok() != Some(addr)),
        "a freed allocation is no longer discoverable at any slot"
    );
}

#[test]
fn four_threads_serialize_through_the_lock() {
    setup();
    let lock_id = dsm::lock_create(900).unwrap();
    let busy = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let busy = Arc::clone(&busy);
            let violations = Arc::clone(&violations);
            thread::spawn(move || {
                dsm::lock_acquire(lock_id, 2000).unwrap();
                if busy.swap(true, Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(5));
                busy.store(false, Ordering::SeqCst);
                dsm::lock_release(lock_id).unwrap();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0, "the lock must never be held by two threads at once");
}

#[test]
fn single_participant_barrier_releases_immediately() {
    setup();
    let barrier_id = dsm::barrier_create();
    dsm::barrier(barrier_id, 1, 2000).unwrap();
}

#[test]
fn stats_reset_and_snapshot() {
    setup();
    dsm::reset_stats().unwrap();
    let addr = dsm::malloc(dsm::PAGE_SIZE).unwrap();
    let snap = dsm::get_stats().unwrap();
    assert!(snap.alloc_count >= 1);
    dsm::free(addr).unwrap();
}
