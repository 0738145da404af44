//! Large object caching behavior observable from the outside: exact-fit
//! reuse, shrink-in-place rules, and cache release on command.

use scmalloc::api::{self, CleanupCommand, CommandStatus};
use std::sync::Mutex;

/// These tests reason about pool-wide reserved bytes, so they must not
/// interleave with each other.
static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn exact_fit_reuse_returns_same_pointer() {
    let _serial = SERIAL.lock().unwrap();
    unsafe {
        let size = 100 * 1024;
        let p1 = api::malloc(size);
        assert!(!p1.is_null());
        api::free(p1);

        let before = api::reserved_bytes();
        let p2 = api::malloc(size);
        assert_eq!(p2, p1, "exact-fit cache must resurrect the block");
        // The hit came from cache; nothing new was mapped.
        assert_eq!(api::reserved_bytes(), before);
        api::free(p2);
    }
}

#[test]
fn different_sizes_get_different_bins() {
    let _serial = SERIAL.lock().unwrap();
    unsafe {
        let a = api::malloc(64 * 1024);
        let b = api::malloc(128 * 1024);
        assert!(!a.is_null() && !b.is_null());
        api::free(a);
        api::free(b);
        // Freeing b must not satisfy a request for a's size class with
        // the wrong block.
        let a2 = api::malloc(64 * 1024);
        assert_eq!(api::msize(a2), 64 * 1024);
        api::free(a2);
    }
}

#[test]
fn msize_reports_requested_size_for_large() {
    let _serial = SERIAL.lock().unwrap();
    unsafe {
        for size in [9000usize, 50_000, 1_000_000, 5_000_000] {
            let p = api::malloc(size);
            assert!(!p.is_null());
            assert_eq!(api::msize(p), size);
            api::free(p);
        }
    }
}

#[test]
fn shrink_in_place_and_grow_rules() {
    let _serial = SERIAL.lock().unwrap();
    unsafe {
        let p = api::malloc(500_000);
        assert!(!p.is_null());
        // A shrink that still fits the block keeps the pointer...
        let q = api::realloc(p, 400_000);
        assert_eq!(q, p);
        assert_eq!(api::msize(q), 400_000);
        // ...and realloc to the reported size is a no-op.
        let r = api::realloc(q, api::msize(q));
        assert_eq!(r, q);
        api::free(r);
    }
}

#[test]
fn clean_all_buffers_releases_cached_memory() {
    let _serial = SERIAL.lock().unwrap();
    unsafe {
        // Park a pile of large blocks in the caches.
        let mut ptrs = Vec::new();
        for i in 0..24 {
            let p = api::malloc(256 * 1024 + i * 8192);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        let with_live = api::reserved_bytes();
        for p in ptrs {
            api::free(p);
        }

        // Everything is cached now; reserved memory has not dropped by
        // the full amount yet.
        let status = api::allocation_command(CleanupCommand::CleanAllBuffers);
        assert_eq!(status, CommandStatus::Ok);
        let after_clean = api::reserved_bytes();
        assert!(
            after_clean < with_live,
            "cleanup did not return memory: {after_clean} >= {with_live}"
        );

        // A second cleanup has nothing left to do (modulo other tests'
        // threads touching the pool).
        let _ = api::allocation_command(CleanupCommand::CleanAllBuffers);
    }
}

#[test]
fn repeated_roundtrips_do_not_grow_the_heap() {
    let _serial = SERIAL.lock().unwrap();
    unsafe {
        // Warm up: the first round maps regions and seeds the caches.
        for _ in 0..4 {
            let p = api::malloc(2 * 1024 * 1024);
            assert!(!p.is_null());
            api::free(p);
        }
        let baseline = api::reserved_bytes();
        // Steady state: every further round is served from cache.
        for _ in 0..64 {
            let p = api::malloc(2 * 1024 * 1024);
            assert!(!p.is_null());
            api::free(p);
        }
        assert_eq!(api::reserved_bytes(), baseline);
    }
}

#[test]
fn thread_buffers_cleanup_reports_status() {
    let _serial = SERIAL.lock().unwrap();
    unsafe {
        // Populate this thread's local large cache.
        let p = api::malloc(300 * 1024);
        assert!(!p.is_null());
        api::free(p);
    }
    let status = api::allocation_command(CleanupCommand::CleanThreadBuffers);
    assert!(
        status == CommandStatus::Ok || status == CommandStatus::NoEffect,
        "unexpected status {status:?}"
    );
}
