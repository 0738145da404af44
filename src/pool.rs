//! Memory pools: the default process-wide pool and user-created pools
//! over raw-alloc callbacks.
//!
//! One `Pool` composes a backend, the shared large object cache, the
//! orphaned-slab lists, the registry of per-thread data, the pool-wide
//! list of live large blocks and the bootstrap allocator. The default
//! pool lives in zeroed static storage and is initialized on the first
//! allocation behind a two-phase flag; user pools are placed into
//! allocations from the default pool.

use crate::backend::{Backend, HUGE_PAGES};
use crate::backref::{self, BackRefIdx};
use crate::bootstrap::{self, BootstrapBlocks, RecursionGuard};
use crate::config::{LARGE_OBJECT_ALIGNMENT, SLAB_SIZE, SLABS_PER_MISS};
use crate::large_cache::{LargeBlock, LargeHeader, LargeObjectCache};
use crate::platform;
use crate::size_class::{
    FITTING_ALIGNMENT, MAX_SEGREGATED_OBJECT_SIZE, MIN_LARGE_OBJECT_SIZE,
};
use crate::slab::{FreeSlabResult, OrphanedSlabs, Slab};
use crate::sync::SpinLock;
use crate::tls::{AllLocalCaches, TlsData, TlsKey};
use crate::{align_down, align_up, is_aligned, stat_inc};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Raw region allocator of a user pool. Receives the pool id and the
/// requested byte count; may update the count to what it really mapped.
pub type RawAlloc = unsafe fn(pool_id: isize, bytes: &mut usize) -> *mut u8;
/// Raw region deallocator of a user pool.
pub type RawFree = unsafe fn(pool_id: isize, raw_ptr: *mut u8, raw_bytes: usize) -> bool;

pub const POOL_POLICY_VERSION: u32 = 1;

/// How a user pool acquires and returns raw memory.
#[derive(Clone, Copy)]
pub struct PoolPolicy {
    pub raw_alloc: Option<RawAlloc>,
    /// May be `None` only for fixed pools.
    pub raw_free: Option<RawFree>,
    /// Granularity of raw requests; 0 selects a cache-line-sized
    /// default, appropriate when `raw_alloc` is malloc-like.
    pub granularity: usize,
    /// The pool works on one buffer, mapped once.
    pub fixed_pool: bool,
    /// Never return regions to the raw source before destruction.
    pub keep_all_memory: bool,
    pub version: u32,
    /// Must be zero; room for future flags.
    pub reserved: u32,
}

impl PoolPolicy {
    pub fn new(raw_alloc: RawAlloc, raw_free: Option<RawFree>, granularity: usize) -> Self {
        Self {
            raw_alloc: Some(raw_alloc),
            raw_free,
            granularity,
            fixed_pool: false,
            keep_all_memory: false,
            version: POOL_POLICY_VERSION,
            reserved: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolError {
    /// Required callback missing, or an unusable field combination.
    InvalidPolicy,
    /// A future policy version or reserved flags were set.
    UnsupportedPolicy,
    NoMemory,
}

/// Granularity assumed for user pools that do not state one.
const DEFAULT_USER_GRANULARITY: usize = crate::config::CACHE_LINE;

/*---------------------------- AllLargeBlocks ----------------------------*/

/// Pool-wide list of live large blocks. Only needed to find backrefs
/// (which are global) when a user pool is reset or destroyed.
pub(crate) struct AllLargeBlocks {
    lock: SpinLock,
    head: UnsafeCell<*mut LargeBlock>,
}

unsafe impl Send for AllLargeBlocks {}
unsafe impl Sync for AllLargeBlocks {}

impl AllLargeBlocks {
    pub(crate) unsafe fn add(&self, lmb: *mut LargeBlock) {
        self.lock.lock();
        unsafe {
            (*lmb).g_prev = ptr::null_mut();
            (*lmb).g_next = *self.head.get();
            if !(*lmb).g_next.is_null() {
                (*(*lmb).g_next).g_prev = lmb;
            }
            *self.head.get() = lmb;
        }
        self.lock.unlock();
    }

    pub(crate) unsafe fn remove(&self, lmb: *mut LargeBlock) {
        self.lock.lock();
        unsafe {
            if *self.head.get() == lmb {
                *self.head.get() = (*lmb).g_next;
            }
            if !(*lmb).g_next.is_null() {
                (*(*lmb).g_next).g_prev = (*lmb).g_prev;
            }
            if !(*lmb).g_prev.is_null() {
                (*(*lmb).g_prev).g_next = (*lmb).g_next;
            }
        }
        self.lock.unlock();
    }

    /// On destroy only the global backrefs must go; the memory goes
    /// away with the regions. On reset the blocks return to the bins.
    unsafe fn release_all(&self, pool_destroy: bool, backend: &Backend) {
        self.lock.lock();
        let mut lmb = unsafe { *self.head.get() };
        unsafe { *self.head.get() = ptr::null_mut() };
        self.lock.unlock();
        unsafe {
            while !lmb.is_null() {
                let next = (*lmb).g_next;
                if pool_destroy {
                    backref::remove_backref((*lmb).backref);
                } else {
                    // Clear the links so return_large_object does not
                    // try to unlink the block a second time.
                    (*lmb).g_next = ptr::null_mut();
                    (*lmb).g_prev = ptr::null_mut();
                    backend.return_large_object(lmb);
                }
                lmb = next;
            }
        }
    }
}

/*---------------------------------- Pool --------------------------------*/

/// One logical memory pool.
pub struct Pool {
    /// Links in the process-wide pool list (guarded by `POOLS_LOCK`).
    next: UnsafeCell<*mut Pool>,
    prev: UnsafeCell<*mut Pool>,
    pub(crate) backend: Backend,
    pub(crate) loc: LargeObjectCache,
    pub(crate) all_local_caches: AllLocalCaches,
    pub(crate) orphaned: OrphanedSlabs,
    pub(crate) lmb_list: AllLargeBlocks,
    pub(crate) pool_id: isize,
    pub(crate) raw_alloc: Option<RawAlloc>,
    pub(crate) raw_free: Option<RawFree>,
    pub(crate) granularity: usize,
    pub(crate) keep_all_memory: bool,
    pub(crate) fixed_pool: bool,
    delay_regs_releasing: AtomicBool,
    tls_key: TlsKey,
    bootstrap: BootstrapBlocks,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Initialize a pool living in zeroed memory at a stable address.
    unsafe fn init_at(
        pool: *mut Pool,
        pool_id: isize,
        raw_alloc: Option<RawAlloc>,
        raw_free: Option<RawFree>,
        granularity: usize,
        keep_all_memory: bool,
        fixed_pool: bool,
    ) -> bool {
        unsafe {
            (*pool).pool_id = pool_id;
            (*pool).raw_alloc = raw_alloc;
            (*pool).raw_free = raw_free;
            (*pool).granularity = granularity;
            (*pool).keep_all_memory = keep_all_memory;
            (*pool).fixed_pool = fixed_pool;
            if !(*pool).tls_key.init() {
                return false;
            }
            (*pool).loc.init(pool);
            (*pool).backend.init(pool);
        }
        true
    }

    /// True for pools over user callbacks (not the default pool).
    #[inline]
    pub(crate) fn user_pool(&self) -> bool {
        self.raw_alloc.is_some()
    }

    pub(crate) fn regions_are_releaseable(&self) -> bool {
        !self.keep_all_memory && !self.delay_regs_releasing.load(Ordering::Relaxed)
    }

    fn delay_regions_releasing(&self, mode: bool) {
        self.delay_regs_releasing.store(mode, Ordering::Relaxed);
    }

    /// Bytes currently obtained from the raw source.
    pub fn total_mem_size(&self) -> usize {
        self.backend.total_mem_size()
    }

    /*---------------------------- cleanup ----------------------------*/

    pub(crate) fn soft_caches_cleanup(&self) -> bool {
        self.loc.regular_cleanup()
    }

    pub(crate) fn hard_caches_cleanup(&self) -> bool {
        // Thread-local caches feed the shared cache, so they go first.
        let mut released = self.release_all_local_caches();
        released |= unsafe { self.orphaned.cleanup(&self.backend) };
        released |= self.loc.clean_all();
        released |= self.backend.clean();
        released
    }

    pub(crate) fn release_all_local_caches(&self) -> bool {
        self.all_local_caches.cleanup(false)
    }

    /*------------------------------ TLS ------------------------------*/

    pub(crate) fn get_tls(&self, create: bool) -> *mut TlsData {
        let tls = self.tls_key.get();
        if tls.is_null() && create {
            self.create_tls()
        } else {
            tls
        }
    }

    #[cold]
    fn create_tls(&self) -> *mut TlsData {
        unsafe {
            let tls = self
                .bootstrap
                .allocate(self, core::mem::size_of::<TlsData>()) as *mut TlsData;
            if tls.is_null() {
                return ptr::null_mut();
            }
            // The record is zeroed, which initializes every bin.
            TlsData::init(tls, self as *const Pool as *mut Pool);
            self.tls_key.set(tls);
            self.all_local_caches.register(tls);
            tls
        }
    }

    pub(crate) fn clear_tls(&self) {
        self.tls_key.set(ptr::null_mut());
    }

    /*--------------------------- slab supply --------------------------*/

    /// A clean slab from the per-thread pool or the backend; misses
    /// fetch several slabs at once and pool the extras.
    unsafe fn fetch_clean_slab(&self) -> *mut Slab {
        unsafe {
            let tls = self.get_tls(false);
            let res = if !tls.is_null() {
                (*tls).free_slabs.get_block()
            } else {
                FreeSlabResult {
                    block: ptr::null_mut(),
                    last_access_miss: false,
                }
            };
            let mut result = res.block;
            if result.is_null() {
                let num = if res.last_access_miss { SLABS_PER_MISS } else { 1 };
                let mut backrefs = [BackRefIdx::invalid(); SLABS_PER_MISS];

                result = self.backend.get_slab_block(num) as *mut Slab;
                if result.is_null() {
                    return ptr::null_mut();
                }
                if !self.user_pool() {
                    for i in 0..num {
                        backrefs[i] = backref::new_backref(false);
                        if backrefs[i].is_invalid() {
                            // Roll the whole batch back.
                            for j in 0..i {
                                backref::remove_backref(backrefs[j]);
                            }
                            let mut b = result;
                            for _ in 0..num {
                                self.backend.put_slab_block(b as *mut u8);
                                b = (b as usize + SLAB_SIZE) as *mut Slab;
                            }
                            return ptr::null_mut();
                        }
                    }
                }
                let mut b = result;
                for i in 0..num {
                    if self.user_pool() {
                        // Slab blocks of user pools carry no backrefs.
                        (*b).backref = BackRefIdx::invalid();
                    } else {
                        backref::set_backref(backrefs[i], b as *mut u8);
                        (*b).backref = backrefs[i];
                    }
                    Slab::set_tls(b, tls);
                    Slab::set_pool(b, self as *const Pool as *mut Pool);
                    if i > 0 {
                        debug_assert!(!tls.is_null());
                        (*tls).free_slabs.return_block(self, b);
                    }
                    b = (b as usize + SLAB_SIZE) as *mut Slab;
                }
            }
            result
        }
    }

    pub(crate) unsafe fn get_empty_slab(&self, size: usize) -> *mut Slab {
        unsafe {
            let slab = self.fetch_clean_slab();
            if !slab.is_null() {
                Slab::init_empty(slab, self.get_tls(false), size);
            }
            slab
        }
    }

    pub(crate) unsafe fn get_startup_slab(&self) -> *mut Slab {
        unsafe {
            let slab = self.fetch_clean_slab();
            if !slab.is_null() {
                Slab::init_startup(slab);
            }
            slab
        }
    }

    pub(crate) unsafe fn return_empty_slab(&self, block: *mut Slab, pool_the_block: bool) {
        unsafe {
            Slab::reset(block);
            if pool_the_block {
                (*self.get_tls(false)).free_slabs.return_block(self, block);
            } else {
                if !self.user_pool() {
                    backref::remove_backref((*block).backref);
                }
                self.backend.put_slab_block(block as *mut u8);
            }
        }
    }

    /*-------------------------- large objects --------------------------*/

    /// Allocate through the cache tiers, placing the user area with
    /// rotating cache-line colouring inside the block.
    pub(crate) unsafe fn malloc_large(
        &self,
        tls: *mut TlsData,
        size: usize,
        alignment: usize,
    ) -> *mut u8 {
        stat_inc!(large_allocs);
        let headers_size =
            core::mem::size_of::<LargeBlock>() + core::mem::size_of::<LargeHeader>();
        let allocation_size = LargeObjectCache::align_to_bin(
            size.wrapping_add(headers_size).wrapping_add(alignment),
        );
        if allocation_size < size {
            return ptr::null_mut(); // wrapped around
        }
        debug_assert!(allocation_size >= alignment);

        unsafe {
            let mut lmb = ptr::null_mut();
            let mut from_backend = false;
            if !tls.is_null() {
                (*tls).mark_used();
                lmb = (*tls).local_cache.get(allocation_size);
            }
            if lmb.is_null() {
                lmb = self.malloc_large_object(allocation_size, &mut from_backend);
            }
            if lmb.is_null() {
                return ptr::null_mut();
            }

            debug_assert!(alignment >= LARGE_OBJECT_ALIGNMENT);
            let mut aligned_area = align_up(lmb as usize + headers_size, alignment);
            let aligned_right =
                align_down(lmb as usize + (*lmb).unaligned_size - size, alignment);
            // Room to shuffle the object between cache lines?
            let ptr_delta = aligned_right - aligned_area;
            if ptr_delta != 0 && !tls.is_null() {
                let num_offsets = ptr_delta / alignment;
                // Rotate only for blocks fresh from the backend: a start
                // offset different from the previous allocation spreads
                // large objects over the cache sets, while exact-fit
                // cache hits land back on their previous address.
                let idx = if from_backend {
                    (*tls).next_cache_idx()
                } else {
                    (*tls).cache_idx()
                };
                let offset = idx as usize % num_offsets;
                aligned_area += offset * alignment;
            }
            debug_assert!(lmb as usize + (*lmb).unaligned_size >= aligned_area + size);

            let header = (aligned_area as *mut LargeHeader).sub(1);
            (*header).block = lmb;
            (*header).backref = (*lmb).backref;
            backref::set_backref((*header).backref, header as *mut u8);

            (*lmb).object_size = size;
            debug_assert!(is_aligned(aligned_area, alignment));
            aligned_area as *mut u8
        }
    }

    pub(crate) unsafe fn free_large(&self, tls: *mut TlsData, object: *mut u8) {
        unsafe {
            let header = (object as *mut LargeHeader).sub(1);
            // Invalidate the used copy so a double free fails the
            // recognition check instead of corrupting the cache.
            (*header).backref = BackRefIdx::invalid();

            let lmb = (*header).block;
            if !tls.is_null() {
                (*tls).mark_used();
                if (*tls).local_cache.put(lmb, self) {
                    return;
                }
            }
            self.free_large_object(lmb);
        }
    }

    pub(crate) unsafe fn malloc_large_object(
        &self,
        allocation_size: usize,
        from_backend: &mut bool,
    ) -> *mut LargeBlock {
        unsafe {
            let cached = self.loc.get(allocation_size);
            if !cached.is_null() {
                return cached;
            }
            *from_backend = true;
            let backref = backref::new_backref(true);
            if backref.is_invalid() {
                return ptr::null_mut();
            }
            // unaligned_size is recorded by the backend.
            let lmb = self.backend.get_large_block(allocation_size);
            if lmb.is_null() {
                backref::remove_backref(backref);
                // The miss was already accounted as used size.
                self.loc
                    .update_cache_state(-(allocation_size as isize), allocation_size);
                return ptr::null_mut();
            }
            (*lmb).backref = backref;
            (*lmb).pool = self as *const Pool as *mut Pool;
            stat_inc!(large_cache_misses);
            lmb
        }
    }

    pub(crate) unsafe fn free_large_object(&self, lmb: *mut LargeBlock) {
        unsafe { self.loc.put(lmb) };
    }

    pub(crate) unsafe fn free_large_object_list(&self, head: *mut LargeBlock) {
        unsafe { self.loc.put_list(head) };
    }

    /// `mremap` a sole-occupant large object (Linux); null means the
    /// caller must allocate-and-copy.
    pub(crate) unsafe fn remap_object(
        &self,
        object: *mut u8,
        old_size: usize,
        new_size: usize,
        alignment: usize,
    ) -> *mut u8 {
        unsafe {
            let old_unaligned = (*(*(object as *mut LargeHeader).sub(1)).block).unaligned_size;
            let remapped = self.backend.remap(object, old_size, new_size, alignment);
            if !remapped.is_null() {
                let lmb = (*(remapped as *mut LargeHeader).sub(1)).block;
                self.loc.register_realloc(old_unaligned, (*lmb).unaligned_size);
            }
            remapped
        }
    }

    /*--------------------------- reset/destroy -------------------------*/

    /// Re-initialize a user pool to its post-create state.
    ///
    /// The caller must guarantee exclusion: no allocation, free or
    /// cleanup command may run against this pool concurrently.
    pub unsafe fn reset(&self) -> bool {
        debug_assert!(self.user_pool(), "the default pool cannot be reset");
        // Regions survive a reset; blocks inside them do not.
        self.delay_regions_releasing(true);

        self.bootstrap.reset();
        unsafe {
            self.lmb_list.release_all(false, &self.backend);
        }
        self.loc.reset();
        self.all_local_caches.reset();
        self.orphaned.reset();
        let mut ok = unsafe { self.tls_key.destroy() };
        unsafe { self.backend.reset() };
        ok &= unsafe { self.tls_key.init() };

        self.delay_regions_releasing(false);
        ok
    }

    /// Tear the pool down. Same exclusion requirements as [`reset`].
    pub(crate) unsafe fn destroy_in_place(&self) -> bool {
        unsafe {
            if self.user_pool() {
                // Slab blocks of user pools have no backrefs; only the
                // large blocks' global entries must go.
                self.lmb_list.release_all(true, &self.backend);
            } else {
                self.loc.reset();
                self.all_local_caches.reset();
                self.bootstrap.reset();
                self.orphaned.reset();
            }
            let mut ok = self.tls_key.destroy();
            if self.raw_free.is_some() || !self.user_pool() {
                ok &= self.backend.destroy();
            }
            ok
        }
    }
}

/// TLS destructor trampoline: hand the dying thread's state over.
pub(crate) unsafe fn on_thread_shutdown(tls: *mut TlsData) {
    unsafe {
        let pool = (*tls).pool() as *const Pool;
        TlsData::release(tls);
        (*pool).bootstrap.free(tls as *mut u8);
        (*pool).clear_tls();
    }
}

/*------------------------------ default pool ----------------------------*/

struct DefaultPoolSpace(UnsafeCell<MaybeUninit<Pool>>);

// SAFETY: interior state is published by the two-phase init flag.
unsafe impl Sync for DefaultPoolSpace {}

static DEFAULT_POOL_SPACE: DefaultPoolSpace =
    DefaultPoolSpace(UnsafeCell::new(MaybeUninit::zeroed()));

const INIT_NOT_DONE: usize = 0;
const INIT_IN_PROGRESS: usize = 1;
const INIT_DONE: usize = 2;

static INIT_STATE: AtomicUsize = AtomicUsize::new(INIT_NOT_DONE);
static INIT_LOCK: SpinLock = SpinLock::new();

/// The default pool's address, valid (but possibly uninitialized)
/// always. Needed by the startup path that runs mid-initialization.
pub(crate) fn default_pool_raw() -> *mut Pool {
    DEFAULT_POOL_SPACE.0.get() as *mut Pool
}

pub(crate) fn is_initialized() -> bool {
    INIT_STATE.load(Ordering::Acquire) == INIT_DONE
}

/// The default pool, initializing the allocator on first use.
pub(crate) fn default_pool() -> Option<&'static Pool> {
    if is_initialized() {
        return Some(unsafe { &*default_pool_raw() });
    }
    do_initialization()
}

#[cold]
fn do_initialization() -> Option<&'static Pool> {
    INIT_LOCK.lock();
    if INIT_STATE.load(Ordering::Relaxed) == INIT_DONE {
        INIT_LOCK.unlock();
        return Some(unsafe { &*default_pool_raw() });
    }
    INIT_STATE.store(INIT_IN_PROGRESS, Ordering::Relaxed);
    let ok = {
        // Nested allocations from this thread (e.g. inside pthread TLS
        // machinery) go through the startup allocator meanwhile.
        let _guard = RecursionGuard::enter();
        HUGE_PAGES.init();
        let pool = default_pool_raw();
        unsafe {
            Pool::init_at(
                pool,
                0,
                None,
                None,
                platform::allocation_granularity(),
                false,
                false,
            ) && backref::init_backref_main(&(*pool).backend)
        }
    };
    if ok {
        INIT_STATE.store(INIT_DONE, Ordering::Release);
    } else {
        INIT_STATE.store(INIT_NOT_DONE, Ordering::Relaxed);
    }
    INIT_LOCK.unlock();
    if ok { Some(unsafe { &*default_pool_raw() }) } else { None }
}

/*------------------------------- pool API -------------------------------*/

static POOLS_LOCK: SpinLock = SpinLock::new();

/// Opaque, copyable reference to a user pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PoolHandle(pub(crate) NonNull<Pool>);

/// Create a pool over the policy's raw allocator.
pub fn pool_create(pool_id: isize, policy: &PoolPolicy) -> Result<PoolHandle, PoolError> {
    if policy.raw_alloc.is_none()
        || policy.version < POOL_POLICY_VERSION
        // A missing raw_free is only meaningful for fixed pools.
        || (!policy.fixed_pool && policy.raw_free.is_none())
    {
        return Err(PoolError::InvalidPolicy);
    }
    // Future versions may add flags in `reserved`; their absence must
    // not silently degrade behavior.
    if policy.version > POOL_POLICY_VERSION || policy.reserved != 0 {
        return Err(PoolError::UnsupportedPolicy);
    }
    let default = default_pool().ok_or(PoolError::NoMemory)?;

    unsafe {
        let mem = internal_pool_malloc(default, core::mem::size_of::<Pool>());
        if mem.is_null() {
            return Err(PoolError::NoMemory);
        }
        ptr::write_bytes(mem, 0, core::mem::size_of::<Pool>());
        let pool = mem as *mut Pool;
        let granularity = if policy.granularity != 0 {
            policy.granularity
        } else {
            DEFAULT_USER_GRANULARITY
        };
        if !Pool::init_at(
            pool,
            pool_id,
            policy.raw_alloc,
            policy.raw_free,
            granularity,
            policy.keep_all_memory,
            policy.fixed_pool,
        ) {
            internal_pool_free(default, mem, 0);
            return Err(PoolError::NoMemory);
        }

        // Link after the default pool.
        POOLS_LOCK.lock();
        let head = default_pool_raw();
        *(*pool).next.get() = *(*head).next.get();
        *(*pool).prev.get() = head;
        if !(*(*head).next.get()).is_null() {
            *(*(*(*head).next.get())).prev.get() = pool;
        }
        *(*head).next.get() = pool;
        POOLS_LOCK.unlock();

        Ok(PoolHandle(NonNull::new_unchecked(pool)))
    }
}

/// Destroy a pool and release its memory.
///
/// # Safety
/// No allocation from this pool may be used afterwards, and nothing may
/// run against the pool concurrently.
pub unsafe fn pool_destroy(handle: PoolHandle) -> bool {
    let pool = handle.0.as_ptr();
    unsafe {
        POOLS_LOCK.lock();
        if !(*(*pool).prev.get()).is_null() {
            *(*(*(*pool).prev.get())).next.get() = *(*pool).next.get();
        }
        if !(*(*pool).next.get()).is_null() {
            *(*(*(*pool).next.get())).prev.get() = *(*pool).prev.get();
        }
        POOLS_LOCK.unlock();

        let ok = (*pool).destroy_in_place();
        if let Some(default) = default_pool() {
            internal_pool_free(default, pool as *mut u8, 0);
        }
        ok
    }
}

impl PoolHandle {
    #[inline]
    fn pool(&self) -> &Pool {
        unsafe { self.0.as_ref() }
    }

    pub fn malloc(&self, size: usize) -> *mut u8 {
        unsafe { internal_pool_malloc(self.pool(), size) }
    }

    /// # Safety
    /// `object` must come from this pool and not be freed already.
    pub unsafe fn free(&self, object: *mut u8) -> bool {
        unsafe { internal_pool_free(self.pool(), object, 0) }
    }

    /// # Safety
    /// `object` must come from this pool (or be null).
    pub unsafe fn realloc(&self, object: *mut u8, size: usize) -> *mut u8 {
        unsafe {
            if object.is_null() {
                return internal_pool_malloc(self.pool(), size);
            }
            if size == 0 {
                internal_pool_free(self.pool(), object, 0);
                return ptr::null_mut();
            }
            realloc_aligned(self.pool(), object, size, 0)
        }
    }

    pub fn aligned_malloc(&self, size: usize, alignment: usize) -> *mut u8 {
        if !alignment.is_power_of_two() || size == 0 {
            return ptr::null_mut();
        }
        unsafe { allocate_aligned(self.pool(), size, alignment) }
    }

    /// # Safety
    /// `object` must come from this pool (or be null).
    pub unsafe fn aligned_realloc(
        &self,
        object: *mut u8,
        size: usize,
        alignment: usize,
    ) -> *mut u8 {
        if !alignment.is_power_of_two() {
            return ptr::null_mut();
        }
        unsafe {
            if object.is_null() {
                return allocate_aligned(self.pool(), size, alignment);
            }
            if size == 0 {
                internal_pool_free(self.pool(), object, 0);
                return ptr::null_mut();
            }
            realloc_aligned(self.pool(), object, size, alignment)
        }
    }

    /// Usable size of an object of this pool; 0 (with `EINVAL`) for
    /// null.
    ///
    /// # Safety
    /// `object` must come from this pool or be null.
    pub unsafe fn msize(&self, object: *mut u8) -> usize {
        if object.is_null() {
            platform::set_errno(platform::EINVAL);
            return 0;
        }
        debug_assert!(
            unsafe { pool_identify(object) }.map(|h| h.0.as_ptr())
                == Some(self.0.as_ptr()),
            "object does not belong to this pool"
        );
        unsafe { internal_msize(object) }
    }

    /// Re-initialize the pool. See [`Pool::reset`] for the exclusion
    /// requirements.
    ///
    /// # Safety
    /// All outstanding allocations become invalid.
    pub unsafe fn reset(&self) -> bool {
        unsafe { self.pool().reset() }
    }
}

/// Find the pool that owns `object`.
///
/// # Safety
/// `object` must be a live allocation of some user pool; objects of the
/// default pool are rejected (by debug assert / by returning `None`).
pub unsafe fn pool_identify(object: *mut u8) -> Option<PoolHandle> {
    unsafe {
        let pool = if is_large_object(object) {
            (*(*(object as *mut LargeHeader).sub(1)).block).pool
        } else {
            Slab::pool(Slab::containing(object))
        };
        debug_assert!(
            pool != default_pool_raw(),
            "pool_identify used on a default-pool object"
        );
        if pool.is_null() || pool == default_pool_raw() {
            None
        } else {
            Some(PoolHandle(NonNull::new_unchecked(pool)))
        }
    }
}

/*--------------------------- allocation paths ---------------------------*/

/// Small allocations walk the thread's bin; large ones go through the
/// cache tiers.
pub(crate) unsafe fn internal_pool_malloc(pool: &Pool, size: usize) -> *mut u8 {
    unsafe {
        let size = if size == 0 { core::mem::size_of::<usize>() } else { size };

        let tls = pool.get_tls(true);
        if size >= MIN_LARGE_OBJECT_SIZE {
            return pool.malloc_large(tls, size, LARGE_OBJECT_ALIGNMENT);
        }
        if tls.is_null() {
            return ptr::null_mut();
        }
        (*tls).mark_used();
        stat_inc!(small_allocs);
        let bin = (*tls).allocation_bin(size);

        // The active block, then its predecessors (empty enough by the
        // bin discipline).
        let mut block = bin.active_block();
        while !block.is_null() {
            let result = Slab::allocate(block);
            if !result.is_null() {
                return result as *mut u8;
            }
            block = bin.set_previous_block_active();
        }

        // Objects other threads freed into our slabs.
        let block = bin.get_privatized_free_list_block();
        if !block.is_null() {
            let result = Slab::allocate_from_free_list(block);
            if !result.is_null() {
                return result as *mut u8;
            }
            // The privatized list vanished under us; retry from scratch.
            return internal_pool_malloc(pool, size);
        }

        // Partial blocks discarded by dead threads.
        let mut block = pool.orphaned.get(tls, size);
        while !block.is_null() {
            bin.push(block);
            bin.set_active_block(block);
            let result = Slab::allocate(block);
            if !result.is_null() {
                return result as *mut u8;
            }
            block = pool.orphaned.get(tls, size);
        }

        // A fresh slab.
        let block = pool.get_empty_slab(size);
        if !block.is_null() {
            bin.push(block);
            bin.set_active_block(block);
            let result = Slab::allocate(block);
            if !result.is_null() {
                return result as *mut u8;
            }
            return internal_pool_malloc(pool, size);
        }
        ptr::null_mut()
    }
}

/// Free `object` into its pool. With `size` 0 the kind of object is
/// detected; small sizes can still be large objects when they were
/// allocated aligned.
pub(crate) unsafe fn internal_pool_free(pool: &Pool, object: *mut u8, size: usize) -> bool {
    unsafe {
        if object.is_null() {
            return false;
        }
        debug_assert!(is_initialized(), "free of a foreign object");
        debug_assert!(pool.user_pool() || is_recognized(object));

        if size >= MIN_LARGE_OBJECT_SIZE || is_large_object(object) {
            pool.free_large(pool.get_tls(false), object);
        } else {
            free_small_object(object);
        }
        true
    }
}

pub(crate) unsafe fn internal_malloc(size: usize) -> *mut u8 {
    unsafe {
        if RecursionGuard::same_thread_active() {
            let size = if size == 0 { core::mem::size_of::<usize>() } else { size };
            let pool = &*default_pool_raw();
            return if size < MIN_LARGE_OBJECT_SIZE {
                bootstrap::startup_alloc(pool, size)
            } else {
                // Nested allocation: the TLS is not usable yet.
                pool.malloc_large(ptr::null_mut(), size, SLAB_SIZE)
            };
        }
        match default_pool() {
            Some(pool) => internal_pool_malloc(pool, size),
            None => ptr::null_mut(),
        }
    }
}

pub(crate) unsafe fn internal_free(object: *mut u8) {
    unsafe {
        if let Some(pool) = default_pool() {
            internal_pool_free(pool, object, 0);
        }
    }
}

pub(crate) unsafe fn internal_msize(object: *mut u8) -> usize {
    unsafe {
        debug_assert!(!object.is_null());
        if is_large_object(object) {
            (*(*(object as *mut LargeHeader).sub(1)).block).object_size
        } else {
            Slab::find_object_size(Slab::containing(object), object)
        }
    }
}

/*------------------------- pointer recognition --------------------------*/

/// Does `object` look like (and verify as) one of our large objects?
pub(crate) unsafe fn is_large_object(object: *mut u8) -> bool {
    if !is_aligned(object as usize, LARGE_OBJECT_ALIGNMENT) {
        return false;
    }
    unsafe {
        let header = (object as *mut LargeHeader).sub(1);
        let idx = ptr::read_volatile(&raw const (*header).backref);
        idx.is_large_object()
            && !(*header).block.is_null()
            && ((*header).block as usize) < header as usize
            && backref::get_backref(idx) == header as *mut u8
    }
}

unsafe fn is_small_object(object: *mut u8) -> bool {
    unsafe {
        let slab = Slab::containing(object);
        let idx = ptr::read_volatile(&raw const (*slab).backref);
        let is_small = backref::get_backref(idx) == slab as *mut u8;
        if is_small {
            Slab::check_free_precondition(slab, object);
        }
        is_small
    }
}

/// Was this pointer produced by the default pool?
pub(crate) unsafe fn is_recognized(object: *mut u8) -> bool {
    unsafe {
        is_initialized()
            && (*default_pool_raw()).backend.ptr_can_be_valid(object)
            && (is_large_object(object) || is_small_object(object))
    }
}

pub(crate) unsafe fn free_small_object(object: *mut u8) {
    unsafe {
        let slab = Slab::containing(object);
        Slab::check_free_precondition(slab, object);

        if Slab::is_startup_slab(slab) {
            bootstrap::startup_free(slab, object);
            return;
        }
        if Slab::is_owned_by_current_thread(slab) {
            Slab::free_own_object(slab, object);
        } else {
            // The owner settles the counter when it privatizes.
            let to_free = Slab::find_object_to_free(slab, object);
            Slab::free_public_object(slab, to_free);
        }
    }
}

/*------------------------- aligned allocation ---------------------------*/

/// Aligned allocation strategy:
/// 1. small size and alignment: round the size up — every power-of-two
///    size class is at least that aligned;
/// 2. small size, alignment within the fitting classes' natural one:
///    plain allocation is enough;
/// 3. small size + alignment still below the large threshold: allocate
///    the sum and align the result up inside the object (free finds the
///    real object by slot arithmetic);
/// 4. otherwise: an aligned large object.
pub(crate) unsafe fn allocate_aligned(pool: &Pool, size: usize, alignment: usize) -> *mut u8 {
    debug_assert!(alignment.is_power_of_two());
    unsafe {
        let result = if size <= MAX_SEGREGATED_OBJECT_SIZE && alignment <= MAX_SEGREGATED_OBJECT_SIZE
        {
            let size = if size == 0 { core::mem::size_of::<usize>() } else { size };
            internal_pool_malloc(pool, align_up(size, alignment))
        } else if size < MIN_LARGE_OBJECT_SIZE {
            if alignment <= FITTING_ALIGNMENT {
                internal_pool_malloc(pool, size)
            } else if size + alignment < MIN_LARGE_OBJECT_SIZE {
                let unaligned = internal_pool_malloc(pool, size + alignment);
                if unaligned.is_null() {
                    return ptr::null_mut();
                }
                align_up(unaligned as usize, alignment) as *mut u8
            } else {
                let tls = pool.get_tls(true);
                pool.malloc_large(tls, size, alignment.max(LARGE_OBJECT_ALIGNMENT))
            }
        } else {
            let tls = pool.get_tls(true);
            pool.malloc_large(tls, size, alignment.max(LARGE_OBJECT_ALIGNMENT))
        };
        debug_assert!(result.is_null() || is_aligned(result as usize, alignment));
        result
    }
}

/// Realloc preserving `alignment` (0 = none requested). Shrinks stay in
/// place except for huge blocks that would waste more than half.
pub(crate) unsafe fn realloc_aligned(
    pool: &Pool,
    object: *mut u8,
    new_size: usize,
    alignment: usize,
) -> *mut u8 {
    unsafe {
        let copy_size;
        if is_large_object(object) {
            let lmb = (*(object as *mut LargeHeader).sub(1)).block;
            let usable = (*lmb).unaligned_size - (object as usize - lmb as usize);

            if new_size <= usable && (alignment == 0 || is_aligned(object as usize, alignment)) {
                // Huge blocks bypass the caches, so keep their space
                // unless the new size is at least twice smaller.
                let is_huge = usable > pool.backend.max_binned_size();
                let threshold = if is_huge { usable / 2 } else { 0 };
                if new_size > threshold {
                    (*lmb).object_size = new_size;
                    return object;
                }
            }
            copy_size = (*lmb).object_size;
            let remapped = pool.remap_object(
                object,
                copy_size,
                new_size,
                alignment.max(LARGE_OBJECT_ALIGNMENT),
            );
            if !remapped.is_null() {
                return remapped;
            }
        } else {
            let slab = Slab::containing(object);
            copy_size = Slab::find_object_size(slab, object);
            // A shrink inside the same slot keeps the pointer.
            if new_size <= copy_size
                && (alignment == 0 || is_aligned(object as usize, alignment))
            {
                return object;
            }
        }

        let result = if alignment != 0 {
            allocate_aligned(pool, new_size, alignment)
        } else {
            internal_pool_malloc(pool, new_size)
        };
        if !result.is_null() {
            ptr::copy_nonoverlapping(object, result, copy_size.min(new_size));
            internal_pool_free(pool, object, 0);
        }
        result
    }
}

/*------------------------- process-wide cleanup -------------------------*/

/// Walk every pool and run its thread-shutdown handling for the calling
/// thread. Called from process teardown paths.
pub(crate) fn process_shutdown_notification() {
    if !is_initialized() {
        return;
    }
    unsafe {
        let default = default_pool_raw();
        let tls = (*default).get_tls(false);
        if !tls.is_null() {
            on_thread_shutdown(tls);
        }
        POOLS_LOCK.lock();
        let mut pool = *(*default).next.get();
        while !pool.is_null() {
            let tls = (*pool).get_tls(false);
            if !tls.is_null() {
                on_thread_shutdown(tls);
            }
            pool = *(*pool).next.get();
        }
        POOLS_LOCK.unlock();
    }
}
