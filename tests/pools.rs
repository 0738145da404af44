//! Named memory pools over user-supplied raw allocators.

use scmalloc::{PoolError, PoolPolicy, pool_create, pool_destroy, pool_identify};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Tests sharing the region counter must not interleave.
static SERIAL: Mutex<()> = Mutex::new(());

/// Raw source backed by mmap, counting outstanding regions.
static MMAP_REGIONS: AtomicUsize = AtomicUsize::new(0);

unsafe fn mmap_raw_alloc(_pool_id: isize, bytes: &mut usize) -> *mut u8 {
    let len = (*bytes + 4095) & !4095;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return std::ptr::null_mut();
    }
    *bytes = len;
    MMAP_REGIONS.fetch_add(1, Ordering::Relaxed);
    ptr as *mut u8
}

unsafe fn mmap_raw_free(_pool_id: isize, raw_ptr: *mut u8, raw_bytes: usize) -> bool {
    MMAP_REGIONS.fetch_sub(1, Ordering::Relaxed);
    unsafe { libc::munmap(raw_ptr as *mut libc::c_void, raw_bytes) == 0 }
}

#[test]
fn policy_validation() {
    // raw_free is mandatory for non-fixed pools.
    let mut policy = PoolPolicy::new(mmap_raw_alloc, None, 4096);
    assert_eq!(pool_create(1, &policy).unwrap_err(), PoolError::InvalidPolicy);

    // Future versions are not silently accepted.
    policy.raw_free = Some(mmap_raw_free);
    policy.version = 2;
    assert_eq!(
        pool_create(1, &policy).unwrap_err(),
        PoolError::UnsupportedPolicy
    );

    policy.version = scmalloc::POOL_POLICY_VERSION;
    policy.reserved = 1;
    assert_eq!(
        pool_create(1, &policy).unwrap_err(),
        PoolError::UnsupportedPolicy
    );
}

#[test]
fn pool_roundtrip_and_identify() {
    let _serial = SERIAL.lock().unwrap();
    let policy = PoolPolicy::new(mmap_raw_alloc, Some(mmap_raw_free), 4096);
    let pool = pool_create(7, &policy).unwrap();

    unsafe {
        let mut ptrs = Vec::new();
        for size in [8usize, 100, 2048, 9000, 200_000] {
            let p = pool.malloc(size);
            assert!(!p.is_null(), "pool malloc failed for {size}");
            std::ptr::write_bytes(p, 0x42, size);
            assert!(pool.msize(p) >= size);
            // Every pointer names its owning pool.
            assert_eq!(pool_identify(p), Some(pool));
            ptrs.push(p);
        }
        for p in ptrs {
            assert!(pool.free(p));
        }
        assert!(pool_destroy(pool));
    }
    assert_eq!(MMAP_REGIONS.load(Ordering::Relaxed), 0, "pool leaked regions");
}

#[test]
fn pool_realloc_moves_content() {
    let _serial = SERIAL.lock().unwrap();
    let policy = PoolPolicy::new(mmap_raw_alloc, Some(mmap_raw_free), 4096);
    let pool = pool_create(8, &policy).unwrap();

    unsafe {
        let p = pool.malloc(100);
        assert!(!p.is_null());
        std::ptr::write_bytes(p, 0x77, 100);

        let q = pool.realloc(p, 100_000);
        assert!(!q.is_null());
        for i in 0..100 {
            assert_eq!(*q.add(i), 0x77);
        }
        // Shrink stays in place.
        let r = pool.realloc(q, 50);
        assert_eq!(r, q);
        // Zero size frees.
        assert!(pool.realloc(r, 0).is_null());

        assert!(pool_destroy(pool));
    }
}

#[test]
fn pool_reset_recycles_everything() {
    let _serial = SERIAL.lock().unwrap();
    let policy = PoolPolicy::new(mmap_raw_alloc, Some(mmap_raw_free), 4096);
    let pool = pool_create(9, &policy).unwrap();

    unsafe {
        for round in 0..3 {
            let mut ptrs = Vec::new();
            for i in 0..200 {
                let p = pool.malloc(64 + (i % 7) * 512);
                assert!(!p.is_null(), "round {round}");
                ptrs.push(p);
            }
            // Reset drops everything at once; no frees needed.
            assert!(pool.reset());
        }
        assert!(pool_destroy(pool));
    }
    assert_eq!(MMAP_REGIONS.load(Ordering::Relaxed), 0);
}

/*----------------------------- fixed pools ------------------------------*/

/// Hands out one fixed buffer exactly once.
static FIXED_BASE: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());

const FIXED_LEN: usize = 1024 * 1024;

unsafe fn fixed_raw_alloc(_pool_id: isize, bytes: &mut usize) -> *mut u8 {
    // First request gets the whole buffer; the pool must live with it.
    let base = FIXED_BASE.swap(std::ptr::null_mut(), Ordering::Relaxed);
    if base.is_null() {
        return std::ptr::null_mut();
    }
    *bytes = FIXED_LEN;
    base
}

#[test]
fn fixed_pool_exhausts_and_recovers() {
    // Back the fixed pool with one mmap'd megabyte.
    let buf = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            FIXED_LEN,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(buf, libc::MAP_FAILED);
    FIXED_BASE.store(buf as *mut u8, Ordering::Relaxed);

    let mut policy = PoolPolicy::new(fixed_raw_alloc, None, 4096);
    policy.fixed_pool = true;
    let pool = pool_create(77, &policy).unwrap();

    unsafe {
        // Allocate 32 KiB chunks until the buffer is exhausted.
        let mut ptrs = Vec::new();
        loop {
            let p = pool.malloc(32 * 1024);
            if p.is_null() {
                break;
            }
            std::ptr::write_bytes(p, 0x5F, 32 * 1024);
            ptrs.push(p);
        }
        let watermark = ptrs.len();
        assert!(watermark >= 8, "only {watermark} chunks fit a megabyte");

        // Free all, then the same watermark must be reachable again.
        for p in ptrs.drain(..) {
            assert!(pool.free(p));
        }
        for i in 0..watermark {
            let p = pool.malloc(32 * 1024);
            assert!(!p.is_null(), "chunk {i} of {watermark} failed after free");
            ptrs.push(p);
        }
        for p in ptrs {
            assert!(pool.free(p));
        }
        assert!(pool_destroy(pool));
        libc::munmap(buf, FIXED_LEN);
    }
}
