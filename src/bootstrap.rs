//! Early-initialization allocation.
//!
//! Two pieces live here. `BootstrapBlocks` hands out the per-thread
//! `TlsData` records from dedicated slab blocks, with a free list for
//! records of threads that exited. `startup_alloc` serves allocations
//! that arrive while the calling thread is already inside allocator
//! initialization (guarded by `RecursionGuard`); those objects carry a
//! leading size word so `msize` and `free` work on them without any TLS.

use crate::platform;
use crate::pool::Pool;
use crate::slab::{FreeObject, Slab};
use crate::sync::SpinLock;
use crate::{align_up, config::SLAB_SIZE};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/*--------------------------- BootstrapBlocks ----------------------------*/

/// Per-pool allocator for `TlsData` records.
pub struct BootstrapBlocks {
    lock: SpinLock,
    /// Block with bump space left.
    block: UnsafeCell<*mut Slab>,
    /// Blocks already bump-exhausted.
    used: UnsafeCell<*mut Slab>,
    /// Recycled records.
    objects: UnsafeCell<*mut FreeObject>,
}

// SAFETY: all three cells are only touched under `lock`.
unsafe impl Send for BootstrapBlocks {}
unsafe impl Sync for BootstrapBlocks {}

impl BootstrapBlocks {
    pub unsafe fn allocate(&self, pool: &Pool, size: usize) -> *mut u8 {
        debug_assert_eq!(size, core::mem::size_of::<crate::tls::TlsData>());
        self.lock.lock();
        let result;
        unsafe {
            if !(*self.objects.get()).is_null() {
                result = *self.objects.get() as *mut u8;
                *self.objects.get() = (*(*self.objects.get())).next;
            } else {
                if (*self.block.get()).is_null() {
                    let fresh = pool.get_empty_slab(size);
                    if fresh.is_null() {
                        self.lock.unlock();
                        return ptr::null_mut();
                    }
                    *self.block.get() = fresh;
                }
                let block = *self.block.get();
                result = Slab::bump_one(block) as *mut u8;
                if (*block).bump_ptr.is_null() {
                    // Exhausted; park it until the pool resets.
                    (*block).next = *self.used.get();
                    *self.used.get() = block;
                    *self.block.get() = ptr::null_mut();
                }
            }
        }
        self.lock.unlock();
        unsafe { ptr::write_bytes(result, 0, size) };
        result
    }

    pub unsafe fn free(&self, record: *mut u8) {
        debug_assert!(!record.is_null());
        self.lock.lock();
        unsafe {
            let obj = record as *mut FreeObject;
            (*obj).next = *self.objects.get();
            *self.objects.get() = obj;
        }
        self.lock.unlock();
    }

    pub fn reset(&self) {
        unsafe {
            *self.block.get() = ptr::null_mut();
            *self.used.get() = ptr::null_mut();
            *self.objects.get() = ptr::null_mut();
        }
    }
}

/*---------------------------- RecursionGuard ----------------------------*/

static RECURSION_LOCK: SpinLock = SpinLock::new();
static RECURSION_OWNER: AtomicUsize = AtomicUsize::new(0);

/// Marks a section that may allocate transitively during allocator
/// initialization. A nested allocation from the same thread is detected
/// with [`RecursionGuard::same_thread_active`] and routed through the
/// startup allocator instead of the (not yet usable) TLS path.
pub struct RecursionGuard {
    _private: (),
}

impl RecursionGuard {
    pub fn enter() -> RecursionGuard {
        RECURSION_LOCK.lock();
        // Thread ids are never zero: pthread handles are addresses and
        // Windows thread ids start at one.
        RECURSION_OWNER.store(platform::thread_id(), Ordering::Relaxed);
        RecursionGuard { _private: () }
    }

    pub fn same_thread_active() -> bool {
        let owner = RECURSION_OWNER.load(Ordering::Relaxed);
        owner != 0 && owner == platform::thread_id()
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        RECURSION_OWNER.store(0, Ordering::Relaxed);
        RECURSION_LOCK.unlock();
    }
}

/*---------------------------- Startup slabs -----------------------------*/

static STARTUP_LOCK: SpinLock = SpinLock::new();
static FIRST_STARTUP_SLAB: UnsafeCellSlab = UnsafeCellSlab(UnsafeCell::new(ptr::null_mut()));

struct UnsafeCellSlab(UnsafeCell<*mut Slab>);
// SAFETY: only touched under STARTUP_LOCK.
unsafe impl Sync for UnsafeCellSlab {}

/// Allocate under the recursion guard: a bump allocation with a leading
/// size word, from slabs marked with the startup size.
pub unsafe fn startup_alloc(pool: &Pool, size: usize) -> *mut u8 {
    let size = align_up(size, core::mem::size_of::<usize>());
    let req_size = size + core::mem::size_of::<usize>();
    let result;

    STARTUP_LOCK.lock();
    unsafe {
        let first = *FIRST_STARTUP_SLAB.0.get();
        let usable = if first.is_null() {
            0
        } else {
            Slab::startup_available(first)
        };
        if usable < req_size {
            let fresh = pool.get_startup_slab();
            if fresh.is_null() {
                STARTUP_LOCK.unlock();
                return ptr::null_mut();
            }
            (*fresh).next = first;
            if !first.is_null() {
                (*first).previous = fresh;
            }
            *FIRST_STARTUP_SLAB.0.get() = fresh;
        }
        let slab = *FIRST_STARTUP_SLAB.0.get();
        result = Slab::startup_bump(slab, req_size);
    }
    STARTUP_LOCK.unlock();

    unsafe {
        // Keep the object size just before the object for msize.
        *(result as *mut usize) = size;
        (result as *mut usize).add(1) as *mut u8
    }
}

/// Usable size of a startup allocation.
pub unsafe fn startup_msize(object: *const u8) -> usize {
    unsafe { *(object as *const usize).sub(1) }
}

/// Free a startup allocation; drained slabs go back to the backend.
pub unsafe fn startup_free(slab: *mut Slab, object: *mut u8) {
    let mut slab_to_release: *mut Slab = ptr::null_mut();
    STARTUP_LOCK.lock();
    unsafe {
        debug_assert!(Slab::is_startup_slab(slab));
        debug_assert!(
            object as usize >= slab as usize + core::mem::size_of::<Slab>()
                && object as usize + startup_msize(object) <= slab as usize + SLAB_SIZE
        );
        if Slab::startup_release_one(slab) {
            let first = *FIRST_STARTUP_SLAB.0.get();
            if slab == first {
                *FIRST_STARTUP_SLAB.0.get() = (*slab).next;
                if !(*slab).next.is_null() {
                    (*(*slab).next).previous = ptr::null_mut();
                }
            } else {
                if !(*slab).previous.is_null() {
                    (*(*slab).previous).next = (*slab).next;
                }
                if !(*slab).next.is_null() {
                    (*(*slab).next).previous = (*slab).previous;
                }
            }
            (*slab).next = ptr::null_mut();
            (*slab).previous = ptr::null_mut();
            slab_to_release = slab;
        }
    }
    STARTUP_LOCK.unlock();

    if !slab_to_release.is_null() {
        unsafe {
            let pool = &*Slab::pool(slab_to_release);
            pool.return_empty_slab(slab_to_release, false);
        }
    }
}
