//! Per-thread allocator state and its process-wide registry.
//!
//! Each thread gets one `TlsData` per pool, reached through a pool's
//! platform TLS key. The key's destructor hands the thread's slabs to
//! the orphan lists on exit. All live `TlsData` records are linked into
//! the pool's `AllLocalCaches` so pool-wide cleanup can reach caches of
//! threads that went idle.

use crate::large_cache::LargeBlock;
use crate::pool::Pool;
use crate::size_class::{self, NUM_SLAB_BINS};
use crate::slab::{FreeSlabPool, SlabBin};
use crate::stat_inc;
use crate::sync::SpinLock;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::config::{LOCAL_CACHE_HIGH_MARK, LOCAL_CACHE_LOW_MARK, LOCAL_CACHE_MAX_TOTAL};

/*--------------------------- LocalLargeCache ----------------------------*/

/// Small per-thread cache of recently freed large blocks, consulted
/// before the shared cache. Kept short (LIFO) and bounded both by count
/// and by total bytes.
pub struct LocalLargeCache {
    head: AtomicPtr<LargeBlock>,
    /// Needed when trimming on overflow; owner-only, like the totals.
    tail: UnsafeCell<*mut LargeBlock>,
    total_size: UnsafeCell<usize>,
    num_blocks: UnsafeCell<usize>,
}

// SAFETY: foreign threads only steal the whole list via `head`; the
// byte/count bookkeeping is owner-thread-only and re-derived after a
// steal.
unsafe impl Sync for LocalLargeCache {}

impl LocalLargeCache {
    pub unsafe fn put(&self, object: *mut LargeBlock, pool: &Pool) -> bool {
        unsafe {
            let size = (*object).unaligned_size;
            // One oversize object would evict the whole cache; skip it.
            if size > LOCAL_CACHE_MAX_TOTAL {
                return false;
            }
            let local_head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);

            (*object).prev = ptr::null_mut();
            (*object).next = local_head;
            if !local_head.is_null() {
                (*local_head).prev = object;
            } else {
                // The list may have been stolen; the totals restart.
                *self.total_size.get() = 0;
                *self.num_blocks.get() = 0;
                *self.tail.get() = object;
            }
            *self.total_size.get() += size;
            *self.num_blocks.get() += 1;

            if *self.total_size.get() > LOCAL_CACHE_MAX_TOTAL
                || *self.num_blocks.get() >= LOCAL_CACHE_HIGH_MARK
            {
                // Trim cold blocks from the tail down to the low marks.
                while *self.total_size.get() > LOCAL_CACHE_MAX_TOTAL
                    || *self.num_blocks.get() > LOCAL_CACHE_LOW_MARK
                {
                    *self.total_size.get() -= (**self.tail.get()).unaligned_size;
                    *self.num_blocks.get() -= 1;
                    *self.tail.get() = (**self.tail.get()).prev;
                }
                let head_to_release = (**self.tail.get()).next;
                (**self.tail.get()).next = ptr::null_mut();
                pool.free_large_object_list(head_to_release);
            }

            self.head.store(object, Ordering::Release);
        }
        true
    }

    pub unsafe fn get(&self, size: usize) -> *mut LargeBlock {
        if size > LOCAL_CACHE_MAX_TOTAL {
            return ptr::null_mut();
        }
        if self.head.load(Ordering::Acquire).is_null() {
            return ptr::null_mut();
        }
        let local_head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        if local_head.is_null() {
            return ptr::null_mut();
        }
        let mut result: *mut LargeBlock = ptr::null_mut();
        let mut head = local_head;
        unsafe {
            let mut curr = head;
            while !curr.is_null() {
                if (*curr).unaligned_size == size {
                    result = curr;
                    if !(*curr).next.is_null() {
                        (*(*curr).next).prev = (*curr).prev;
                    } else {
                        *self.tail.get() = (*curr).prev;
                    }
                    if curr != head {
                        (*(*curr).prev).next = (*curr).next;
                    } else {
                        head = (*curr).next;
                    }
                    *self.total_size.get() -= size;
                    *self.num_blocks.get() -= 1;
                    break;
                }
                curr = (*curr).next;
            }
            self.head.store(head, Ordering::Release);
        }
        if !result.is_null() {
            stat_inc!(local_cache_hits);
        }
        result
    }

    /// Steal everything; callable from any thread.
    pub unsafe fn external_cleanup(&self, pool: &Pool) -> bool {
        let local_head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        if local_head.is_null() {
            return false;
        }
        unsafe { pool.free_large_object_list(local_head) };
        true
    }
}

/*-------------------------------- TlsData -------------------------------*/

/// Everything one thread keeps for one pool.
pub struct TlsData {
    /// Links in the pool-wide registry; guarded by its lock.
    reg_next: UnsafeCell<*mut TlsData>,
    reg_prev: UnsafeCell<*mut TlsData>,
    pool: *mut Pool,
    bins: [SlabBin; NUM_SLAB_BINS],
    pub free_slabs: FreeSlabPool,
    pub local_cache: LocalLargeCache,
    /// Rotates the cache-line offset of large object starts.
    curr_cache_idx: UnsafeCell<u32>,
    /// Cleared on every use; lets unused threads' caches be reclaimed.
    unused: AtomicBool,
}

unsafe impl Send for TlsData {}
unsafe impl Sync for TlsData {}

impl TlsData {
    pub unsafe fn init(this: *mut TlsData, pool: *mut Pool) {
        // The record comes zeroed from the bootstrap allocator, which is
        // a valid state for every field; only the backlink is needed.
        unsafe { (*this).pool = pool };
    }

    pub fn pool(&self) -> &Pool {
        unsafe { &*self.pool }
    }

    #[inline]
    pub fn mark_used(&self) {
        self.unused.store(false, Ordering::Relaxed);
    }

    /// Called by cleanup passes of any thread.
    pub fn mark_unused(&self) {
        self.unused.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn allocation_bin(&self, size: usize) -> &SlabBin {
        &self.bins[size_class::index(size)]
    }

    pub fn allocation_bin_tag(&self, index: usize) -> usize {
        self.bins[index].tag()
    }

    /// Advance and return the large-object colouring rotation index.
    pub unsafe fn next_cache_idx(&self) -> u32 {
        unsafe {
            let idx = (*self.curr_cache_idx.get()).wrapping_add(1);
            *self.curr_cache_idx.get() = idx;
            idx
        }
    }

    /// Current rotation index, unchanged. Cache hits reuse it so an
    /// exact-fit reuse lands on the same user address.
    pub unsafe fn cache_idx(&self) -> u32 {
        unsafe { *self.curr_cache_idx.get() }
    }

    /// Drain public free lists in all bins and return empty blocks.
    pub unsafe fn cleanup_slab_bins(&self) -> bool {
        let mut released = false;
        unsafe {
            for bin in &self.bins {
                released |= bin.clean_public_free_lists();
                // After privatizing, only the active block can be empty;
                // return it rather than let it idle with a bump pointer.
                let block = bin.active_block();
                if !block.is_null() && crate::slab::Slab::empty(block) {
                    bin.out_of_bin(block);
                    self.pool().return_empty_slab(block, false);
                    released = true;
                }
            }
        }
        released
    }

    /// Release this thread's caches. Bins are only drained when the
    /// owner itself asks (`clean_bins`); other threads may still steal
    /// the slab pool and the local large cache.
    pub unsafe fn external_cleanup(&self, clean_only_unused: bool, clean_bins: bool) -> bool {
        if clean_only_unused && !self.unused.load(Ordering::Relaxed) {
            return false;
        }
        let pool = self.pool();
        let bins_cleaned = if clean_bins {
            unsafe { self.cleanup_slab_bins() }
        } else {
            false
        };
        let lloc_cleaned = unsafe { self.local_cache.external_cleanup(pool) };
        let slabs_cleaned = unsafe { self.free_slabs.external_cleanup(pool) };
        bins_cleaned || lloc_cleaned || slabs_cleaned
    }

    /// Thread-exit path: empty the caches, then orphan every block
    /// still holding live objects.
    pub unsafe fn release(this: *mut TlsData) {
        unsafe {
            let pool = (*this).pool();
            pool.all_local_caches.unregister(this);
            (*this).external_cleanup(false, false);

            for index in 0..NUM_SLAB_BINS {
                let bin = &(*this).bins[index];
                let active = bin.active_block();
                if active.is_null() {
                    continue;
                }
                let mut sync_on_mailbox = false;
                // Blocks before the active one...
                let mut block = (*active).previous;
                while !block.is_null() {
                    let prev = (*block).previous;
                    if crate::slab::Slab::empty(block) {
                        // The thread is going away; do not pool it.
                        pool.return_empty_slab(block, false);
                    } else {
                        pool.orphaned.put(bin.tag(), block);
                        sync_on_mailbox = true;
                    }
                    block = prev;
                }
                // ...then the active one and those after it.
                let mut block = active;
                while !block.is_null() {
                    let next = (*block).next;
                    if crate::slab::Slab::empty(block) {
                        pool.return_empty_slab(block, false);
                    } else {
                        pool.orphaned.put(bin.tag(), block);
                        sync_on_mailbox = true;
                    }
                    block = next;
                }
                bin.reset_active();

                if sync_on_mailbox {
                    // A foreign thread that just pushed into the public
                    // free list may still be inside the mailbox; its
                    // lock bounds that access to the bin's lifetime.
                    bin.sync_mailbox();
                }
            }
        }
    }
}

/*----------------------------- AllLocalCaches ---------------------------*/

/// Registry of all live `TlsData` of one pool.
pub struct AllLocalCaches {
    head: UnsafeCell<*mut TlsData>,
    lock: SpinLock,
}

// SAFETY: `head` and the links are only touched under `lock`.
unsafe impl Send for AllLocalCaches {}
unsafe impl Sync for AllLocalCaches {}

impl AllLocalCaches {
    pub unsafe fn register(&self, tls: *mut TlsData) {
        self.lock.lock();
        unsafe {
            *(*tls).reg_next.get() = *self.head.get();
            *(*tls).reg_prev.get() = ptr::null_mut();
            if !(*self.head.get()).is_null() {
                *(**self.head.get()).reg_prev.get() = tls;
            }
            *self.head.get() = tls;
        }
        self.lock.unlock();
    }

    pub unsafe fn unregister(&self, tls: *mut TlsData) {
        self.lock.lock();
        unsafe {
            let next = *(*tls).reg_next.get();
            let prev = *(*tls).reg_prev.get();
            if !prev.is_null() {
                *(*prev).reg_next.get() = next;
            } else {
                *self.head.get() = next;
            }
            if !next.is_null() {
                *(*next).reg_prev.get() = prev;
            }
        }
        self.lock.unlock();
    }

    /// Steal stealable caches from every registered thread.
    pub fn cleanup(&self, clean_only_unused: bool) -> bool {
        let mut released = false;
        self.lock.lock();
        unsafe {
            let mut tls = *self.head.get();
            while !tls.is_null() {
                released |= (*tls).external_cleanup(clean_only_unused, false);
                tls = *(*tls).reg_next.get();
            }
        }
        self.lock.unlock();
        released
    }

    /// Flag every thread's cache; threads clear it on their next use,
    /// so caches still flagged at the next sweep belong to idle threads.
    pub fn mark_unused(&self) {
        // Skip if somebody else is already walking the list.
        if !self.lock.try_lock() {
            return;
        }
        unsafe {
            let mut tls = *self.head.get();
            while !tls.is_null() {
                (*tls).mark_unused();
                tls = *(*tls).reg_next.get();
            }
        }
        self.lock.unlock();
    }

    pub fn reset(&self) {
        unsafe { *self.head.get() = ptr::null_mut() };
    }
}

/*--------------------------------- TlsKey -------------------------------*/

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Per-pool pthread TLS key. The destructor runs at thread exit
        /// with the thread's `TlsData` and drives the orphaning path.
        pub struct TlsKey {
            key: UnsafeCell<libc::pthread_key_t>,
        }

        // SAFETY: the key value is written once at pool init (external
        // exclusion) and read-only afterwards.
        unsafe impl Send for TlsKey {}
        unsafe impl Sync for TlsKey {}

        unsafe extern "C" fn tls_destructor(arg: *mut libc::c_void) {
            if !arg.is_null() {
                unsafe { crate::pool::on_thread_shutdown(arg as *mut TlsData) };
            }
        }

        impl TlsKey {
            pub unsafe fn init(&self) -> bool {
                let mut key: libc::pthread_key_t = 0;
                let status = unsafe { libc::pthread_key_create(&mut key, Some(tls_destructor)) };
                if status != 0 {
                    return false;
                }
                unsafe { *self.key.get() = key };
                true
            }

            pub unsafe fn destroy(&self) -> bool {
                unsafe { libc::pthread_key_delete(*self.key.get()) == 0 }
            }

            pub fn get(&self) -> *mut TlsData {
                unsafe { libc::pthread_getspecific(*self.key.get()) as *mut TlsData }
            }

            pub fn set(&self, tls: *mut TlsData) {
                // Some pthread implementations allocate on the first
                // setspecific; the guard reroutes any nested malloc.
                let _guard = crate::bootstrap::RecursionGuard::enter();
                unsafe { libc::pthread_setspecific(*self.key.get(), tls as *const libc::c_void) };
            }
        }
    } else {
        /// Per-pool fiber-local storage key; the FLS callback runs at
        /// thread exit like the pthread destructor does.
        pub struct TlsKey {
            key: UnsafeCell<u32>,
        }

        unsafe impl Send for TlsKey {}
        unsafe impl Sync for TlsKey {}

        const FLS_OUT_OF_INDEXES: u32 = 0xFFFF_FFFF;

        unsafe extern "system" {
            fn FlsAlloc(callback: unsafe extern "system" fn(*mut core::ffi::c_void)) -> u32;
            fn FlsFree(index: u32) -> i32;
            fn FlsGetValue(index: u32) -> *mut core::ffi::c_void;
            fn FlsSetValue(index: u32, value: *const core::ffi::c_void) -> i32;
        }

        unsafe extern "system" fn tls_callback(arg: *mut core::ffi::c_void) {
            if !arg.is_null() {
                unsafe { crate::pool::on_thread_shutdown(arg as *mut TlsData) };
            }
        }

        impl TlsKey {
            pub unsafe fn init(&self) -> bool {
                let key = unsafe { FlsAlloc(tls_callback) };
                if key == FLS_OUT_OF_INDEXES {
                    return false;
                }
                unsafe { *self.key.get() = key };
                true
            }

            pub unsafe fn destroy(&self) -> bool {
                unsafe { FlsFree(*self.key.get()) != 0 }
            }

            pub fn get(&self) -> *mut TlsData {
                unsafe { FlsGetValue(*self.key.get()) as *mut TlsData }
            }

            pub fn set(&self, tls: *mut TlsData) {
                let _guard = crate::bootstrap::RecursionGuard::enter();
                unsafe { FlsSetValue(*self.key.get(), tls as *const core::ffi::c_void) };
            }
        }
    }
}
