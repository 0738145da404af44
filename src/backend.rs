//! Backend: region acquisition, size-indexed bins of free blocks, and
//! the non-blocking coalescing protocol.
//!
//! Responsibilities:
//! - Map regions from the OS (or the pool's raw-alloc callback), split
//!   them into free blocks held in two parallel bin arrays (slab-aligned
//!   and large).
//! - Merge freed blocks with their neighbors using guarded-size words;
//!   conflicted merges are parked in a delayed-coalesce queue.
//! - Release a region back to the OS once coalescing rebuilds the single
//!   block spanning it.

use crate::bitmask::BitMask;
use crate::config::*;
use crate::free_block::{
    FreeBlock, GuardedSize, LastRegionBlock, MIN_BLOCK_SIZE, NO_BIN, Region, RegionKind,
    RegionList,
};
use crate::large_cache::LargeBlock;
use crate::platform::{self, PageKind};
use crate::pool::Pool;
use crate::sync::{Backoff, SpinLock};
use crate::{align_down, align_up, is_aligned, stat_inc};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

type BinMask = BitMask<FREE_BINS_NUM, { bitmask_words(FREE_BINS_NUM) }>;

/// In-band sentinel: "a valid block was added to some bin, re-scan".
#[inline]
fn valid_block_in_bin() -> *mut FreeBlock {
    1 as *mut FreeBlock
}

#[inline]
fn is_valid_block_in_bin(block: *mut FreeBlock) -> bool {
    block as usize == 1
}

/// Map a block size to its bin index, `NO_BIN` for sub-minimum blocks.
pub(crate) fn size_to_bin(size: usize) -> i32 {
    if size >= MAX_BINNED_HUGE {
        HUGE_BIN as i32
    } else if size < MIN_BINNED_SIZE {
        NO_BIN
    } else {
        ((size - MIN_BINNED_SIZE) / FREE_BINS_STEP) as i32
    }
}

/// A block belongs in the slab-aligned bins when its right edge is
/// slab-aligned and at least one whole slab fits.
pub(crate) fn to_aligned_bin(block: *mut FreeBlock, size: usize) -> bool {
    is_aligned(block as usize + size, SLAB_SIZE) && size >= SLAB_SIZE
}

/// Global huge-page state: what the OS offers and what the user asked
/// for. Requested mode comes from the environment at init or from the
/// configuration API at any time.
pub(crate) struct HugePagesStatus {
    requested: AtomicIsize, // -1 until set
    set_mode_lock: SpinLock,
    page_size: AtomicUsize,
    hp_available: AtomicBool,
    thp_available: AtomicBool,
    enabled: AtomicBool,
}

pub(crate) static HUGE_PAGES: HugePagesStatus = HugePagesStatus {
    requested: AtomicIsize::new(-1),
    set_mode_lock: SpinLock::new(),
    page_size: AtomicUsize::new(0),
    hp_available: AtomicBool::new(false),
    thp_available: AtomicBool::new(false),
    enabled: AtomicBool::new(false),
};

impl HugePagesStatus {
    pub fn init(&self) {
        let info = platform::probe_huge_pages();
        self.page_size.store(info.page_size, Ordering::Relaxed);
        self.hp_available.store(info.preallocated, Ordering::Relaxed);
        self.thp_available.store(info.transparent, Ordering::Relaxed);
        self.set_mode_lock.lock();
        if self.requested.load(Ordering::Relaxed) < 0 {
            let from_env = platform::env_flag(c"SCMALLOC_USE_HUGE_PAGES").unwrap_or(false);
            self.requested.store(from_env as isize, Ordering::Relaxed);
        }
        let on = self.requested.load(Ordering::Relaxed) > 0
            && (info.preallocated || info.transparent);
        self.enabled.store(on, Ordering::Relaxed);
        self.set_mode_lock.unlock();
    }

    pub fn set_mode(&self, requested: bool) {
        self.set_mode_lock.lock();
        self.requested.store(requested as isize, Ordering::Relaxed);
        let available = self.hp_available.load(Ordering::Relaxed)
            || self.thp_available.load(Ordering::Relaxed);
        self.enabled.store(requested && available, Ordering::Relaxed);
        self.set_mode_lock.unlock();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn preallocated_available(&self) -> bool {
        self.hp_available.load(Ordering::Relaxed)
    }

    fn transparent_available(&self) -> bool {
        self.thp_available.load(Ordering::Relaxed)
    }

    fn page_size(&self) -> usize {
        let sz = self.page_size.load(Ordering::Relaxed);
        if sz != 0 { sz } else { HUGE_PAGE_SIZE }
    }
}

/// Shared processing state: the count of blocks removed from bins and
/// not yet returned, plus a counter bumped on every bin change. Waiters
/// use both to decide whether re-scanning the bins can make progress.
pub(crate) struct BackendSync {
    in_fly_blocks: AtomicIsize,
    bins_modifications: AtomicIsize,
}

impl BackendSync {
    pub fn block_consumed(&self) {
        self.in_fly_blocks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn bins_modified(&self) {
        self.bins_modifications.fetch_add(1, Ordering::Release);
    }

    pub fn block_released(&self) {
        self.bins_modifications.fetch_add(1, Ordering::Release);
        let prev = self.in_fly_blocks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn num_of_mods(&self) -> isize {
        self.bins_modifications.load(Ordering::Acquire)
    }

    fn in_fly(&self) -> isize {
        self.in_fly_blocks.load(Ordering::Acquire)
    }
}

/// Queue of free blocks whose coalescing was deferred because another
/// merge raced with them. A Treiber stack with an in-flight counter.
pub(crate) struct CoalesceQueue {
    blocks_to_free: AtomicPtr<FreeBlock>,
    in_fly_blocks: AtomicIsize,
}

impl CoalesceQueue {
    pub unsafe fn put_block(&self, block: *mut FreeBlock) {
        debug_assert!(unsafe { (*block).size_tmp } >= MIN_BLOCK_SIZE);
        unsafe { FreeBlock::mark_used(block) };
        stat_inc!(coalesce_deferred);
        self.in_fly_blocks.fetch_add(1, Ordering::AcqRel);

        let mut head = self.blocks_to_free.load(Ordering::Acquire);
        loop {
            unsafe { (*block).next_to_free = head };
            match self.blocks_to_free.compare_exchange(
                head,
                block,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    pub fn get_all(&self) -> *mut FreeBlock {
        loop {
            let head = self.blocks_to_free.load(Ordering::Acquire);
            if head.is_null() {
                return ptr::null_mut();
            }
            if self
                .blocks_to_free
                .compare_exchange(head, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return head;
            }
        }
    }

    fn block_was_processed(&self, sync: &BackendSync) {
        sync.bins_modified();
        let prev = self.in_fly_blocks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn blocks_in_fly(&self) -> isize {
        self.in_fly_blocks.load(Ordering::Acquire)
    }
}

/// Semaphore bounding concurrent OS mapping requests. A thread that had
/// to wait must re-scan the bins before mapping anything itself.
struct MemExtendSema {
    active: AtomicIsize,
}

impl MemExtendSema {
    /// Returns true when the caller waited and must re-scan instead of
    /// holding a slot.
    fn wait(&self) -> bool {
        let mut prev = self.active.load(Ordering::Acquire);
        loop {
            if prev < MEM_EXTEND_SLOTS {
                match self.active.compare_exchange(
                    prev,
                    prev + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return false,
                    Err(observed) => prev = observed,
                }
            } else {
                let mut backoff = Backoff::new();
                while self.active.load(Ordering::Acquire) == prev {
                    backoff.pause();
                }
                return true;
            }
        }
    }

    fn signal(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Min and max of all addresses obtained from the OS. Lets `free` and
/// `msize` cheaply reject pointers that cannot possibly be ours. Only
/// meaningful for the default pool.
struct UsedAddressRange {
    left: AtomicUsize,
    right: AtomicUsize,
}

impl UsedAddressRange {
    fn init(&self) {
        self.left.store(usize::MAX, Ordering::Relaxed);
    }

    fn register_alloc(&self, left: usize, right: usize) {
        let mut cur = self.left.load(Ordering::Relaxed);
        while left < cur {
            match self
                .left
                .compare_exchange(cur, left, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        let mut cur = self.right.load(Ordering::Relaxed);
        while right > cur {
            match self
                .right
                .compare_exchange(cur, right, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    // Only the bounds are kept, so interior frees cannot shrink the
    // range; a pointer check may report false positives, never false
    // negatives.
    fn register_free(&self, _left: usize, _right: usize) {}

    fn in_range(&self, ptr: *const u8) -> bool {
        let p = ptr as usize;
        self.left.load(Ordering::Relaxed) <= p && p <= self.right.load(Ordering::Relaxed)
    }
}

/// One bin: a doubly-linked list of free blocks under a try-lock.
struct Bin {
    head: AtomicPtr<FreeBlock>,
    tail: UnsafeCell<*mut FreeBlock>,
    lock: SpinLock,
}

// SAFETY: `tail` and list links are only touched while `lock` is held;
// `head` is atomic so the empty check can skip locking.
unsafe impl Send for Bin {}
unsafe impl Sync for Bin {}

impl Bin {
    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// Unlink a block. The bin lock must be held.
    unsafe fn remove_block(&self, block: *mut FreeBlock) {
        unsafe {
            debug_assert!(
                !(*block).next.is_null()
                    || !(*block).prev.is_null()
                    || self.head.load(Ordering::Relaxed) == block,
                "block is not in this bin"
            );
            if self.head.load(Ordering::Relaxed) == block {
                self.head.store((*block).next, Ordering::Relaxed);
            }
            if *self.tail.get() == block {
                *self.tail.get() = (*block).prev;
            }
            if !(*block).prev.is_null() {
                (*(*block).prev).next = (*block).next;
            }
            if !(*block).next.is_null() {
                (*(*block).next).prev = (*block).prev;
            }
        }
    }

    fn reset(&self) {
        self.head.store(ptr::null_mut(), Ordering::Relaxed);
        unsafe { *self.tail.get() = ptr::null_mut() };
    }
}

/// The bin array plus a bitmask for finding non-empty bins quickly.
pub(crate) struct IndexedBins {
    bitmask: BinMask,
    bins: [Bin; FREE_BINS_NUM],
}

impl IndexedBins {
    fn min_nonempty_bin(&self, start: usize) -> Option<usize> {
        self.bitmask.min_true(start)
    }

    /// Try to take a block of at least `size` bytes from one bin.
    /// A locked bin is skipped and counted instead of waited on.
    unsafe fn get_from_bin(
        &self,
        bin_idx: usize,
        sync: &BackendSync,
        size: usize,
        need_aligned_res: bool,
        aligned_bin: bool,
        wait: bool,
        num_locked: &mut i32,
    ) -> *mut FreeBlock {
        let bin = &self.bins[bin_idx];
        'retry: loop {
            if bin.is_empty() {
                return ptr::null_mut();
            }
            if wait {
                bin.lock.lock();
            } else if !bin.lock.try_lock() {
                *num_locked += 1;
                return ptr::null_mut();
            }

            let mut curr = bin.head.load(Ordering::Relaxed);
            while !curr.is_null() {
                let sz_block = unsafe { FreeBlock::try_lock_block(curr) };
                if sz_block == 0 {
                    // Block is being coalesced; there is nothing to spin
                    // on inside the bin, so restart from the bin lock.
                    bin.lock.unlock();
                    continue 'retry;
                }

                let mut found = ptr::null_mut();
                if aligned_bin || !need_aligned_res {
                    let split = sz_block.wrapping_sub(size);
                    if sz_block >= size && (split >= MIN_BLOCK_SIZE || split == 0) {
                        found = curr;
                    }
                } else {
                    // Aligned block out of an unaligned bin: the usable
                    // piece is cut from the middle, so both leftovers
                    // must be big enough or empty. Fixed pools only.
                    let new_b = align_up(curr as usize, SLAB_SIZE);
                    let right_new = new_b + size;
                    let right_curr = curr as usize + sz_block;
                    if right_new <= right_curr
                        && (new_b == curr as usize || new_b - curr as usize >= MIN_BLOCK_SIZE)
                        && (right_new == right_curr || right_curr - right_new >= MIN_BLOCK_SIZE)
                    {
                        found = curr;
                    }
                }

                if !found.is_null() {
                    // Consume before the removal becomes visible.
                    sync.block_consumed();
                    unsafe { bin.remove_block(found) };
                    if bin.is_empty() {
                        self.bitmask.set(bin_idx, false);
                    }
                    unsafe { (*found).size_tmp = sz_block };
                    bin.lock.unlock();
                    return found;
                }
                unsafe {
                    FreeBlock::set_me_free(curr, sz_block);
                    FreeBlock::set_left_free(FreeBlock::right_neighbor(curr, sz_block), sz_block);
                    curr = (*curr).next;
                }
            }
            bin.lock.unlock();
            return ptr::null_mut();
        }
    }

    unsafe fn find_block(
        &self,
        native_bin: usize,
        sync: &BackendSync,
        size: usize,
        need_aligned: bool,
        aligned_bin: bool,
        num_locked: &mut i32,
    ) -> *mut FreeBlock {
        let mut idx = self.min_nonempty_bin(native_bin);
        while let Some(i) = idx {
            let block = unsafe {
                self.get_from_bin(i, sync, size, need_aligned, aligned_bin, false, num_locked)
            };
            if !block.is_null() {
                return block;
            }
            idx = self.min_nonempty_bin(i + 1);
        }
        ptr::null_mut()
    }

    unsafe fn add_block(&self, bin_idx: usize, block: *mut FreeBlock, add_to_tail: bool) {
        let bin = &self.bins[bin_idx];
        unsafe {
            (*block).my_bin = bin_idx as i32;
            (*block).next = ptr::null_mut();
            (*block).prev = ptr::null_mut();
        }
        bin.lock.lock();
        unsafe { Self::link_block(bin, block, add_to_tail) };
        bin.lock.unlock();
        self.bitmask.set(bin_idx, true);
    }

    unsafe fn try_add_block(&self, bin_idx: usize, block: *mut FreeBlock, add_to_tail: bool) -> bool {
        let bin = &self.bins[bin_idx];
        unsafe {
            (*block).my_bin = bin_idx as i32;
            (*block).next = ptr::null_mut();
            (*block).prev = ptr::null_mut();
        }
        if !bin.lock.try_lock() {
            return false;
        }
        unsafe { Self::link_block(bin, block, add_to_tail) };
        bin.lock.unlock();
        self.bitmask.set(bin_idx, true);
        true
    }

    unsafe fn link_block(bin: &Bin, block: *mut FreeBlock, add_to_tail: bool) {
        unsafe {
            if add_to_tail {
                (*block).prev = *bin.tail.get();
                *bin.tail.get() = block;
                if !(*block).prev.is_null() {
                    (*(*block).prev).next = block;
                }
                if bin.head.load(Ordering::Relaxed).is_null() {
                    bin.head.store(block, Ordering::Relaxed);
                }
            } else {
                (*block).next = bin.head.load(Ordering::Relaxed);
                bin.head.store(block, Ordering::Relaxed);
                if !(*block).next.is_null() {
                    (*(*block).next).prev = block;
                }
                if (*bin.tail.get()).is_null() {
                    *bin.tail.get() = block;
                }
            }
        }
    }

    unsafe fn lock_remove_block(&self, bin_idx: usize, block: *mut FreeBlock) {
        let bin = &self.bins[bin_idx];
        bin.lock.lock();
        unsafe { bin.remove_block(block) };
        if bin.is_empty() {
            self.bitmask.set(bin_idx, false);
        }
        bin.lock.unlock();
    }

    /// Take every block out of a bin and re-coalesce it, so that regions
    /// wholly covered by never-used advance blocks can be released.
    unsafe fn try_release_regions(&self, bin_idx: usize, backend: &Backend) -> bool {
        let bin = &self.bins[bin_idx];
        let mut list: *mut FreeBlock = ptr::null_mut();
        'retry: loop {
            if bin.is_empty() {
                break;
            }
            bin.lock.lock();
            let mut curr = bin.head.load(Ordering::Relaxed);
            while !curr.is_null() {
                let sz_block = unsafe { FreeBlock::try_lock_block(curr) };
                if sz_block == 0 {
                    bin.lock.unlock();
                    continue 'retry;
                }
                unsafe {
                    let next = (*curr).next;
                    bin.remove_block(curr);
                    (*curr).size_tmp = sz_block;
                    (*curr).next_to_free = list;
                    list = curr;
                    curr = next;
                }
            }
            if bin.is_empty() {
                self.bitmask.set(bin_idx, false);
            }
            bin.lock.unlock();
            break;
        }
        unsafe { backend.coalesce_and_put_list(list, true, false) }
    }

    fn reset(&self) {
        for bin in &self.bins {
            bin.reset();
        }
        self.bitmask.reset();
    }

    #[cfg(debug_assertions)]
    fn verify(&self) {
        for bin in &self.bins {
            let mut fb = bin.head.load(Ordering::Relaxed);
            while !fb.is_null() {
                unsafe {
                    let my_sz = (*fb).my_size_raw();
                    debug_assert!(my_sz > GuardedSize::MAX_SPEC_VAL);
                    let right = FreeBlock::right_neighbor(fb, my_sz);
                    debug_assert!((*right).left_size_raw() == my_sz);
                    fb = (*fb).next;
                }
            }
        }
    }
}

/// The backend of one memory pool.
///
/// All state is interior-mutable; every public operation takes `&self`
/// and is safe to call from any number of threads at once (except
/// `reset`/`destroy`, which require external exclusion).
pub(crate) struct Backend {
    pool: AtomicPtr<Pool>,
    region_list: RegionList,
    coalesce_q: CoalesceQueue,
    pub(crate) sync: BackendSync,
    mem_extend_sema: MemExtendSema,
    total_mem_size: AtomicUsize,
    mem_soft_limit: AtomicUsize,
    used_addr_range: UsedAddressRange,
    bootstrap_status: AtomicUsize,
    bootstrap_lock: SpinLock,
    // Maximal observed request below the binned cap; sizes advance
    // regions so that mixed workloads carve from fewer mappings.
    max_requested_size: AtomicUsize,
    adv_reg_bins: BinMask,
    free_large_bins: IndexedBins,
    free_aligned_bins: IndexedBins,
}

const BOOTSTRAP_NOT_DONE: usize = 0;
const BOOTSTRAP_INITIALIZING: usize = 1;
const BOOTSTRAP_DONE: usize = 2;

impl Backend {
    /// Wire the backend to its pool. The pool must already live at a
    /// stable address and the backend must be zero-initialized.
    pub unsafe fn init(&self, pool: *mut Pool) {
        self.pool.store(pool, Ordering::Relaxed);
        self.used_addr_range.init();
    }

    #[inline]
    fn pool(&self) -> &Pool {
        unsafe { &*self.pool.load(Ordering::Relaxed) }
    }

    pub fn total_mem_size(&self) -> usize {
        self.total_mem_size.load(Ordering::Relaxed)
    }

    pub fn ptr_can_be_valid(&self, ptr: *const u8) -> bool {
        self.used_addr_range.in_range(ptr)
    }

    pub(crate) fn in_user_pool(&self) -> bool {
        self.pool().user_pool()
    }

    pub fn max_binned_size(&self) -> usize {
        if HUGE_PAGES.is_enabled() && !self.pool().user_pool() {
            MAX_BINNED_HUGE
        } else {
            MAX_BINNED_SMALL
        }
    }

    /// Soft heap limit: remember it and immediately try to shrink below.
    pub fn set_soft_limit(&self, limit: usize) {
        self.mem_soft_limit.store(limit, Ordering::Relaxed);
        self.release_caches_to_limit();
    }

    /*----------------------------- Raw memory -----------------------------*/

    unsafe fn alloc_raw_mem(&self, size: &mut usize) -> *mut u8 {
        let pool = self.pool();
        let mut alloc_size;
        let mut res = ptr::null_mut();

        if pool.user_pool() {
            alloc_size = align_up(*size, pool.granularity);
            if let Some(raw_alloc) = pool.raw_alloc {
                res = unsafe { raw_alloc(pool.pool_id, &mut alloc_size) };
            }
        } else {
            // Round to huge page granularity when huge pages are on, so
            // kernels can back the mapping with them transparently.
            let page_size = if HUGE_PAGES.is_enabled() {
                HUGE_PAGES.page_size()
            } else {
                pool.granularity
            };
            debug_assert!(page_size > 0);
            alloc_size = align_up(*size, page_size);

            if HUGE_PAGES.is_enabled() {
                if HUGE_PAGES.preallocated_available() {
                    res = unsafe { platform::map_memory(alloc_size, PageKind::PreallocatedHuge) };
                }
                if res.is_null() && HUGE_PAGES.transparent_available() {
                    res = unsafe { platform::map_memory(alloc_size, PageKind::TransparentHuge) };
                }
            }
            if res.is_null() {
                res = unsafe { platform::map_memory(alloc_size, PageKind::Regular) };
            }
        }

        if !res.is_null() {
            if !pool.user_pool() {
                self.used_addr_range
                    .register_alloc(res as usize, res as usize + alloc_size);
            }
            self.total_mem_size.fetch_add(alloc_size, Ordering::Relaxed);
            stat_inc!(regions_mapped);
            *size = alloc_size;
        }
        res
    }

    unsafe fn free_raw_mem(&self, object: *mut u8, size: usize) -> bool {
        let pool = self.pool();
        self.total_mem_size.fetch_sub(size, Ordering::Relaxed);
        stat_inc!(regions_released);
        if pool.user_pool() {
            debug_assert!(!pool.fixed_pool, "no free for fixed pools");
            match pool.raw_free {
                Some(raw_free) => unsafe { raw_free(pool.pool_id, object, size) },
                None => false,
            }
        } else {
            self.used_addr_range
                .register_free(object as usize, object as usize + size);
            unsafe { platform::unmap_memory(object, size) }
        }
    }

    /*----------------------------- Coalescing -----------------------------*/

    fn remove_block_from_bin(&self, block: *mut FreeBlock) {
        unsafe {
            if (*block).my_bin != NO_BIN {
                if (*block).slab_aligned {
                    self.free_aligned_bins
                        .lock_remove_block((*block).my_bin as usize, block);
                } else {
                    self.free_large_bins
                        .lock_remove_block((*block).my_bin as usize, block);
                }
            }
        }
    }

    /// Merge a freed block with its free neighbors. Returns the merged
    /// block, or null when the merge was deferred to the queue. On
    /// return `*out_region` is the region to release if the block now
    /// spans it wholly.
    unsafe fn do_coalesce(
        &self,
        block: *mut FreeBlock,
        out_region: &mut *mut Region,
    ) -> *mut FreeBlock {
        let mut res_block = block;
        let mut res_size = unsafe { (*block).size_tmp };
        let mut region: *mut Region = ptr::null_mut();

        unsafe {
            FreeBlock::mark_coalescing(block, res_size);
            (*res_block).in_bin = false;

            // Left neighbor.
            let left_sz = FreeBlock::try_set_left_used(block, GuardedSize::COAL_BLOCK);
            if left_sz != GuardedSize::LOCKED {
                if left_sz == GuardedSize::COAL_BLOCK {
                    // Another coalesce owns our left word; retry later.
                    self.coalesce_q.put_block(block);
                    return ptr::null_mut();
                }
                let left = FreeBlock::left_neighbor(block, left_sz);
                let l_sz = FreeBlock::try_set_me_used(left, GuardedSize::COAL_BLOCK);
                if l_sz <= GuardedSize::MAX_LOCKED_VAL {
                    FreeBlock::set_left_free(block, left_sz); // rollback
                    self.coalesce_q.put_block(block);
                    return ptr::null_mut();
                }
                debug_assert_eq!(l_sz, left_sz);
                (*left).in_bin = true;
                res_block = left;
                res_size += left_sz;
                (*res_block).size_tmp = res_size;
                stat_inc!(coalesce_merges);
            }

            // Right neighbor.
            let right = FreeBlock::right_neighbor(block, (*block).size_tmp);
            let right_sz = FreeBlock::try_set_me_used(right, GuardedSize::COAL_BLOCK);
            if right_sz != GuardedSize::LOCKED {
                if right_sz == GuardedSize::LAST_REGION_BLOCK {
                    FreeBlock::set_me_free(right, GuardedSize::LAST_REGION_BLOCK);
                    region = (*(right as *mut LastRegionBlock)).region;
                } else if right_sz == GuardedSize::COAL_BLOCK {
                    if (*res_block).in_bin {
                        (*res_block).in_bin = false;
                        self.remove_block_from_bin(res_block);
                    }
                    self.coalesce_q.put_block(res_block);
                    return ptr::null_mut();
                } else {
                    let r_sz = FreeBlock::try_set_left_used(
                        FreeBlock::right_neighbor(right, right_sz),
                        GuardedSize::COAL_BLOCK,
                    );
                    if r_sz <= GuardedSize::MAX_LOCKED_VAL {
                        FreeBlock::set_me_free(right, right_sz); // rollback
                        if (*res_block).in_bin {
                            (*res_block).in_bin = false;
                            self.remove_block_from_bin(res_block);
                        }
                        self.coalesce_q.put_block(res_block);
                        return ptr::null_mut();
                    }
                    debug_assert_eq!(r_sz, right_sz);
                    self.remove_block_from_bin(right);
                    res_size += right_sz;
                    stat_inc!(coalesce_merges);

                    // The region sentinel may sit just past `right`.
                    let next_right = FreeBlock::right_neighbor(right, right_sz);
                    let next_right_sz =
                        FreeBlock::try_set_me_used(next_right, GuardedSize::COAL_BLOCK);
                    if next_right_sz > GuardedSize::MAX_LOCKED_VAL {
                        if next_right_sz == GuardedSize::LAST_REGION_BLOCK {
                            region = (*(next_right as *mut LastRegionBlock)).region;
                        }
                        FreeBlock::set_me_free(next_right, next_right_sz);
                    }
                }
            }

            if !region.is_null() {
                debug_assert!((region as usize) < res_block as usize);
            }
            *out_region = region;
            (*res_block).size_tmp = res_size;
        }
        res_block
    }

    unsafe fn coalesce_and_put_list(
        &self,
        mut list: *mut FreeBlock,
        force_queue_drop: bool,
        report_processed: bool,
    ) -> bool {
        let mut region_released = false;
        let pool = self.pool();

        while !list.is_null() {
            let helper = unsafe { (*list).next_to_free };
            let mut region: *mut Region = ptr::null_mut();
            let mut add_to_tail = false;

            let done = 'one: {
                let to_ret = unsafe { self.do_coalesce(list, &mut region) };
                if to_ret.is_null() {
                    break 'one true; // deferred to the queue
                }

                unsafe {
                    if !region.is_null()
                        && (*region).block_size == (*to_ret).size_tmp
                        && !pool.fixed_pool
                    {
                        if pool.regions_are_releaseable() {
                            // Nothing else lives in the region: unmap it.
                            if (*to_ret).in_bin {
                                self.remove_block_from_bin(to_ret);
                            }
                            self.release_region(region);
                            region_released = true;
                            break 'one true;
                        }
                        // Keep the block but prefer it for exact fits.
                        add_to_tail = true;
                    }

                    let curr_sz = (*to_ret).size_tmp;
                    let bin = size_to_bin(curr_sz);
                    let to_aligned = if pool.fixed_pool {
                        to_aligned_bin(to_ret, curr_sz)
                    } else {
                        (*to_ret).slab_aligned
                    };
                    let mut need_add_to_bin = true;

                    if (*to_ret).in_bin {
                        if (*to_ret).my_bin == bin && (*to_ret).slab_aligned == to_aligned {
                            need_add_to_bin = false;
                        } else {
                            (*to_ret).in_bin = false;
                            self.remove_block_from_bin(to_ret);
                        }
                    }

                    if need_add_to_bin {
                        (*to_ret).prev = ptr::null_mut();
                        (*to_ret).next = ptr::null_mut();
                        (*to_ret).next_to_free = ptr::null_mut();
                        (*to_ret).my_bin = NO_BIN;
                        (*to_ret).slab_aligned = to_aligned;

                        // Sub-minimum blocks stay bin-less; they are not
                        // leaked because a later coalesce can pick them up.
                        if curr_sz >= MIN_BINNED_SIZE {
                            (*to_ret).size_tmp = curr_sz;
                            let target = if to_aligned {
                                &self.free_aligned_bins
                            } else {
                                &self.free_large_bins
                            };
                            if force_queue_drop {
                                target.add_block(bin as usize, to_ret, add_to_tail);
                            } else if !target.try_add_block(bin as usize, to_ret, add_to_tail) {
                                self.coalesce_q.put_block(to_ret);
                                break 'one true;
                            }
                        }
                        (*to_ret).size_tmp = 0;
                    }
                    // Publishing must come last: once free, the block can
                    // be coalesced away and its pointer becomes unusable.
                    FreeBlock::set_me_free(to_ret, curr_sz);
                    FreeBlock::set_left_free(
                        FreeBlock::right_neighbor(to_ret, curr_sz),
                        curr_sz,
                    );
                }
                true
            };
            let _ = done;

            if report_processed {
                // Matches the enqueue in CoalesceQueue::put_block.
                self.coalesce_q.block_was_processed(&self.sync);
            }
            list = helper;
        }
        region_released
    }

    unsafe fn coalesce_and_put(&self, block: *mut FreeBlock, size: usize, slab_aligned: bool) {
        unsafe {
            (*block).size_tmp = size;
            (*block).next_to_free = ptr::null_mut();
            (*block).slab_aligned = slab_aligned;
            self.coalesce_and_put_list(block, false, false);
        }
    }

    /// Drain the delayed-coalesce queue. Returns true when anything was
    /// dequeued (an indication the bins may have changed).
    pub(crate) fn scan_coalesce_queue(&self, force_queue_drop: bool) -> bool {
        let list = self.coalesce_q.get_all();
        if !list.is_null() {
            unsafe { self.coalesce_and_put_list(list, force_queue_drop, true) };
        }
        !list.is_null()
    }

    pub(crate) fn blocks_in_coalescing(&self) -> isize {
        self.coalesce_q.blocks_in_fly()
    }

    /// Wait while some other thread holds blocks in processing, in hope
    /// they are returned to the bins. True means a re-scan makes sense.
    pub(crate) fn wait_till_block_released(&self, start_modified_cnt: isize) -> bool {
        let mut backoff = Backoff::new();
        let mut my_bins_in_fly = self.sync.in_fly();
        let mut my_coalesce_in_fly = self.blocks_in_coalescing();
        loop {
            debug_assert!(my_bins_in_fly >= 0 && my_coalesce_in_fly >= 0);
            let curr_bins = self.sync.in_fly();
            let curr_coalesce = self.blocks_in_coalescing();
            // Progress: blocks left processing, or left the queue.
            if my_bins_in_fly > curr_bins || my_coalesce_in_fly > curr_coalesce {
                return true;
            }
            // Help the queue along instead of spinning idle.
            if curr_coalesce > 0 && self.scan_coalesce_queue(false) {
                return true;
            }
            if curr_bins == 0 && curr_coalesce == 0 {
                // Re-scan only pays off if bins changed since the caller
                // last looked.
                return start_modified_cnt != self.sync.num_of_mods();
            }
            my_bins_in_fly = curr_bins;
            my_coalesce_in_fly = curr_coalesce;
            backoff.pause();
        }
    }

    /*------------------------------ Regions -------------------------------*/

    unsafe fn release_region(&self, region: *mut Region) {
        unsafe {
            self.region_list.remove(region);
            self.free_raw_mem(region as *mut u8, (*region).alloc_size);
        }
    }

    /// Locate the free block inside a fresh region and record its size.
    unsafe fn find_block_in_region(region: *mut Region, exact_block_size: usize) -> *mut FreeBlock {
        unsafe {
            let last_block_place =
                region as usize + (*region).alloc_size - core::mem::size_of::<LastRegionBlock>();

            let (block, block_end) = if (*region).kind == RegionKind::SlabBlocks {
                // Right bound is slab-aligned; the sentinel sits after it.
                let b = align_up(
                    region as usize + core::mem::size_of::<Region>(),
                    core::mem::size_of::<usize>(),
                );
                (b, align_down(last_block_place, SLAB_SIZE))
            } else {
                let b = align_up(
                    region as usize + core::mem::size_of::<Region>(),
                    LARGE_OBJECT_ALIGNMENT,
                );
                let e = b + exact_block_size;
                debug_assert!(e <= last_block_place);
                (b, e)
            };

            if block_end <= block {
                return ptr::null_mut(); // the mapping came up too small
            }
            let block_size = block_end - block;
            if (*region).kind == RegionKind::SlabBlocks && block_size < SLABS_PER_MISS * SLAB_SIZE
            {
                return ptr::null_mut();
            }
            (*region).block_size = block_size;
            block as *mut FreeBlock
        }
    }

    /// Publish the single free block of a fresh region: init its guarded
    /// words and the region sentinel, then either park it in a bin or
    /// hand it back locked.
    unsafe fn start_use_block(&self, region: *mut Region, block: *mut FreeBlock, add_to_bin: bool) {
        unsafe {
            let block_size = (*region).block_size;
            FreeBlock::init_header(block);
            FreeBlock::set_me_free(block, block_size);

            let last = FreeBlock::right_neighbor(block, block_size) as *mut LastRegionBlock;
            debug_assert!(is_aligned(last as usize, core::mem::size_of::<usize>()));
            FreeBlock::init_header(last as *mut FreeBlock);
            FreeBlock::set_me_free(last as *mut FreeBlock, GuardedSize::LAST_REGION_BLOCK);
            FreeBlock::set_left_free(last as *mut FreeBlock, block_size);
            (*last).block.my_bin = NO_BIN;
            (*last).region = region;

            if add_to_bin {
                let target_bin = size_to_bin(block_size);
                debug_assert!(target_bin != NO_BIN);
                // Advance regions are remembered so clean() can find and
                // release them if they are never carved.
                self.adv_reg_bins.set(target_bin as usize, true);
                if (*region).kind == RegionKind::SlabBlocks {
                    (*block).slab_aligned = true;
                    self.free_aligned_bins
                        .add_block(target_bin as usize, block, false);
                } else {
                    (*block).slab_aligned = false;
                    self.free_large_bins
                        .add_block(target_bin as usize, block, false);
                }
            } else {
                // Matches block_released() in generic_get_block.
                self.sync.block_consumed();
                (*block).slab_aligned = (*region).kind == RegionKind::SlabBlocks;
                (*block).size_tmp = FreeBlock::try_lock_block(block);
                debug_assert!((*block).size_tmp >= MIN_BLOCK_SIZE);
            }
        }
    }

    unsafe fn add_new_region(
        &self,
        size: usize,
        kind: RegionKind,
        add_to_bin: bool,
    ) -> *mut FreeBlock {
        const _: () = assert!(core::mem::size_of::<Region>() % core::mem::size_of::<usize>() == 0);

        // Non-slab regions need room for the header, worst-case
        // alignment and the terminal sentinel.
        let request_size = if kind == RegionKind::SlabBlocks {
            size
        } else {
            size + core::mem::size_of::<Region>()
                + LARGE_OBJECT_ALIGNMENT
                + MIN_BLOCK_SIZE
                + core::mem::size_of::<LastRegionBlock>()
        };

        let mut raw_size = request_size;
        let region = unsafe { self.alloc_raw_mem(&mut raw_size) } as *mut Region;
        if region.is_null() {
            return ptr::null_mut();
        }
        let fixed_pool = self.pool().fixed_pool;
        unsafe {
            if raw_size < core::mem::size_of::<Region>() {
                if !fixed_pool {
                    self.free_raw_mem(region as *mut u8, raw_size);
                }
                return ptr::null_mut();
            }
            (*region).kind = kind;
            (*region).alloc_size = raw_size;

            let block = Self::find_block_in_region(region, size);
            if block.is_null() {
                if !fixed_pool {
                    self.free_raw_mem(region as *mut u8, raw_size);
                }
                return ptr::null_mut();
            }
            self.region_list.add(region);
            self.start_use_block(region, block, add_to_bin);
            self.sync.bins_modified();
            if add_to_bin { valid_block_in_bin() } else { block }
        }
    }

    /// Map a rather large slab region in advance on first use, so the
    /// first allocations do not pay one mapping per slab.
    fn request_bootstrap_mem(&self) {
        if self.bootstrap_status.load(Ordering::Acquire) == BOOTSTRAP_DONE {
            return;
        }
        self.bootstrap_lock.lock();
        if self.bootstrap_status.load(Ordering::Relaxed) == BOOTSTRAP_DONE {
            self.bootstrap_lock.unlock();
            return;
        }
        self.bootstrap_status
            .store(BOOTSTRAP_INITIALIZING, Ordering::Relaxed);
        // Null is fine here; the caller re-requests with a modest size.
        unsafe { self.add_new_region(2 * 1024 * 1024, RegionKind::SlabBlocks, true) };
        self.bootstrap_status.store(BOOTSTRAP_DONE, Ordering::Release);
        self.bootstrap_lock.unlock();
    }

    /*------------------------- Getting new blocks --------------------------*/

    /// Last chance before giving up: empty the caches or wait for
    /// blocks that are currently in processing.
    unsafe fn release_mem_in_caches(
        &self,
        start_modified_cnt: isize,
        locked_bins_threshold: &mut i32,
        num_of_locked_bins: i32,
    ) -> *mut FreeBlock {
        if self.pool().hard_caches_cleanup() || self.wait_till_block_released(start_modified_cnt) {
            return valid_block_in_bin();
        }
        // The OS is out, but some bins were locked: stop skipping them.
        if *locked_bins_threshold != 0 && num_of_locked_bins > 0 {
            *locked_bins_threshold = 0;
            return valid_block_in_bin();
        }
        ptr::null_mut()
    }

    /// Size-classified heap extension. Huge blocks get a region of their
    /// own; middling ones share a region; small ones also pre-map a few
    /// advance regions straight into the bins.
    unsafe fn ask_mem_from_os(
        &self,
        block_size: usize,
        start_modified_cnt: isize,
        locked_bins_threshold: &mut i32,
        num_of_locked_bins: i32,
        splittable: &mut bool,
        need_slab_region: bool,
    ) -> *mut FreeBlock {
        let max_binned = self.max_binned_size();
        let quite_small = max_binned / 8;
        let mut block;

        if block_size >= max_binned {
            // Exact fit; the region is never shared, so no semaphore.
            block = unsafe { self.add_new_region(block_size, RegionKind::OneBlock, false) };
            if block.is_null() {
                return unsafe {
                    self.release_mem_in_caches(
                        start_modified_cnt,
                        locked_bins_threshold,
                        num_of_locked_bins,
                    )
                };
            }
            *splittable = false;
        } else {
            let region_size = align_up(
                4 * self.max_requested_size.load(Ordering::Relaxed),
                1024 * 1024,
            );
            // If someone is mid-modification, let them finish and
            // re-scan before growing the heap ourselves.
            if self.wait_till_block_released(start_modified_cnt) || self.mem_extend_sema.wait() {
                return valid_block_in_bin();
            }
            if start_modified_cnt != self.sync.num_of_mods() {
                self.mem_extend_sema.signal();
                return valid_block_in_bin();
            }

            if block_size < quite_small {
                let kind = if need_slab_region {
                    RegionKind::SlabBlocks
                } else {
                    RegionKind::LargeBlocks
                };
                block = unsafe { self.add_new_region(region_size, kind, false) };
                if !block.is_null() {
                    for _ in 0..ADVANCE_REGIONS {
                        if unsafe { self.add_new_region(region_size, kind, true) }.is_null() {
                            break;
                        }
                    }
                }
            } else {
                block =
                    unsafe { self.add_new_region(region_size, RegionKind::LargeBlocks, false) };
            }
            self.mem_extend_sema.signal();

            if block.is_null() || is_valid_block_in_bin(block) {
                return unsafe {
                    self.release_mem_in_caches(
                        start_modified_cnt,
                        locked_bins_threshold,
                        num_of_locked_bins,
                    )
                };
            }
            *splittable = true;
        }
        self.release_caches_to_limit();
        block
    }

    fn release_caches_to_limit(&self) {
        let limit = self.mem_soft_limit.load(Ordering::Relaxed);
        if limit == 0 || self.total_mem_size.load(Ordering::Relaxed) <= limit {
            return;
        }
        let pool = self.pool();
        self.scan_coalesce_queue(false);
        if pool.soft_caches_cleanup()
            && self.total_mem_size.load(Ordering::Acquire) <= self.mem_soft_limit.load(Ordering::Acquire)
        {
            return;
        }
        // Shrink the shared cache first, then thread-local caches; retry
        // because backend fragmentation can block region release.
        for clean_local in 0..2 {
            loop {
                let released = if clean_local == 1 {
                    pool.all_local_caches.cleanup(true)
                } else {
                    pool.loc.decreasing_cleanup()
                };
                if !released {
                    break;
                }
                if self.total_mem_size.load(Ordering::Acquire)
                    <= self.mem_soft_limit.load(Ordering::Acquire)
                {
                    return;
                }
            }
        }
        pool.hard_caches_cleanup();
    }

    /// Cut the requested piece out of a found block and return leftovers
    /// to the bins.
    unsafe fn split_block(
        &self,
        block: *mut FreeBlock,
        num: usize,
        size: usize,
        block_is_aligned: bool,
        need_aligned_block: bool,
    ) -> *mut FreeBlock {
        let total_size = num * size;
        let mut block = block;
        unsafe {
            if need_aligned_block && !block_is_aligned {
                debug_assert!(
                    self.pool().fixed_pool,
                    "aligned block out of an unaligned bin happens only in fixed pools"
                );
                // The usable space is in the middle of the block.
                let new_block = align_up(block as usize, SLAB_SIZE) as *mut FreeBlock;
                let right_part = (new_block as usize + total_size) as *mut FreeBlock;
                let block_end = block as usize + (*block).size_tmp;

                if (right_part as usize) != block_end {
                    FreeBlock::init_header(right_part); // blocks coalescing with the piece in use
                    let right_size = block_end - right_part as usize;
                    self.coalesce_and_put(right_part, right_size, to_aligned_bin(right_part, right_size));
                }
                if new_block != block {
                    FreeBlock::init_header(new_block);
                    let left_size = new_block as usize - block as usize;
                    self.coalesce_and_put(block, left_size, to_aligned_bin(block, left_size));
                }
                block = new_block;
            } else {
                let split_size = (*block).size_tmp - total_size;
                if split_size > 0 {
                    let split_block;
                    if need_aligned_block {
                        // Cut the slab-aligned piece from the right side;
                        // the remainder keeps the block's start.
                        split_block = block;
                        block = (split_block as usize + split_size) as *mut FreeBlock;
                        FreeBlock::init_header(block);
                    } else {
                        split_block = (block as usize + total_size) as *mut FreeBlock;
                        FreeBlock::init_header(split_block);
                    }
                    let mark_aligned = if block_is_aligned ^ need_aligned_block {
                        to_aligned_bin(split_block, split_size)
                    } else {
                        block_is_aligned
                    };
                    self.coalesce_and_put(split_block, split_size, mark_aligned);
                }
            }
            debug_assert!(
                !need_aligned_block || is_aligned(block as usize, SLAB_SIZE),
                "aligned block expected"
            );
            FreeBlock::mark_blocks(block, num, size);
        }
        block
    }

    /// Allocate `num` blocks of `size` bytes as one span, slab-aligned
    /// when requested. The heart of the backend.
    pub(crate) unsafe fn generic_get_block(
        &self,
        num: usize,
        size: usize,
        need_aligned_block: bool,
    ) -> *mut FreeBlock {
        let total_req_size = num * size;
        let native_bin = size_to_bin(total_req_size).max(0) as usize;

        self.request_bootstrap_mem();
        let pool = self.pool();

        // With two or fewer locked bins it is cheaper to map more memory
        // than to wait, except in fixed pools and for very large blocks.
        let mut locked_bins_threshold: i32 =
            if pool.fixed_pool || size >= MAX_BINNED_SMALL { 0 } else { 2 };

        // Track the maximal request below the binned cap.
        let max_binned = self.max_binned_size();
        let mut observed = self.max_requested_size.load(Ordering::Acquire);
        while total_req_size > observed && total_req_size < max_binned {
            match self.max_requested_size.compare_exchange(
                observed,
                total_req_size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(o) => observed = o,
            }
        }

        self.scan_coalesce_queue(false);

        let mut splittable = true;
        let mut block;
        loop {
            let start_modified_cnt = self.sync.num_of_mods();
            let mut num_of_locked_bins;
            loop {
                num_of_locked_bins = 0;
                unsafe {
                    if need_aligned_block {
                        block = self.free_aligned_bins.find_block(
                            native_bin,
                            &self.sync,
                            total_req_size,
                            true,
                            true,
                            &mut num_of_locked_bins,
                        );
                        if block.is_null() && pool.fixed_pool {
                            block = self.free_large_bins.find_block(
                                native_bin,
                                &self.sync,
                                total_req_size,
                                true,
                                false,
                                &mut num_of_locked_bins,
                            );
                        }
                    } else {
                        block = self.free_large_bins.find_block(
                            native_bin,
                            &self.sync,
                            total_req_size,
                            false,
                            false,
                            &mut num_of_locked_bins,
                        );
                        if block.is_null() && pool.fixed_pool {
                            block = self.free_aligned_bins.find_block(
                                native_bin,
                                &self.sync,
                                total_req_size,
                                false,
                                true,
                                &mut num_of_locked_bins,
                            );
                        }
                    }
                }
                if !block.is_null() || num_of_locked_bins <= locked_bins_threshold {
                    break;
                }
            }
            if !block.is_null() {
                break;
            }

            let queue_drained = self.scan_coalesce_queue(true);
            let caches_cleaned = pool.soft_caches_cleanup();
            if !(queue_drained | caches_cleaned) {
                // Bins did not change; the only option left is more
                // memory from the OS.
                block = unsafe {
                    self.ask_mem_from_os(
                        total_req_size,
                        start_modified_cnt,
                        &mut locked_bins_threshold,
                        num_of_locked_bins,
                        &mut splittable,
                        need_aligned_block,
                    )
                };
                if block.is_null() {
                    return ptr::null_mut();
                }
                if !is_valid_block_in_bin(block) {
                    // Size can have been rounded up inside.
                    debug_assert!(unsafe { (*block).size_tmp } >= total_req_size);
                    break;
                }
                // A valid block landed in some bin; go find it.
                block = ptr::null_mut();
            }
        }

        if splittable {
            block = unsafe {
                self.split_block(block, num, size, (*block).slab_aligned, need_aligned_block)
            };
        }
        // Matches block_consumed() from get_from_bin / start_use_block.
        self.sync.block_released();
        block
    }

    pub(crate) unsafe fn generic_put_block(
        &self,
        block: *mut FreeBlock,
        block_size: usize,
        slab_aligned: bool,
    ) {
        self.sync.block_consumed();
        unsafe { self.coalesce_and_put(block, block_size, slab_aligned) };
        self.sync.block_released();
    }

    /*------------------------- Slab & large blocks -------------------------*/

    /// Get `num` consecutive slab-aligned slab blocks as one allocation.
    pub unsafe fn get_slab_block(&self, num: usize) -> *mut u8 {
        let block = unsafe { self.generic_get_block(num, SLAB_SIZE, true) };
        debug_assert!(block.is_null() || is_aligned(block as usize, SLAB_SIZE));
        block as *mut u8
    }

    pub unsafe fn put_slab_block(&self, block: *mut u8) {
        unsafe { self.generic_put_block(block as *mut FreeBlock, SLAB_SIZE, true) };
    }

    pub unsafe fn get_large_block(&self, size: usize) -> *mut LargeBlock {
        let lmb = unsafe { self.generic_get_block(1, size, false) } as *mut LargeBlock;
        if !lmb.is_null() {
            unsafe {
                (*lmb).unaligned_size = size;
                if self.pool().user_pool() {
                    self.pool().lmb_list.add(lmb);
                }
            }
        }
        lmb
    }

    unsafe fn put_large_block(&self, lmb: *mut LargeBlock) {
        unsafe {
            if self.pool().user_pool() {
                self.pool().lmb_list.remove(lmb);
            }
            self.generic_put_block(lmb as *mut FreeBlock, (*lmb).unaligned_size, false);
        }
    }

    /// Final resting path of a cached large block: drop its backref and
    /// give the span back to the bins.
    pub(crate) unsafe fn return_large_object(&self, lmb: *mut LargeBlock) {
        unsafe {
            crate::backref::remove_backref((*lmb).backref);
            self.put_large_block(lmb);
        }
    }

    /*------------------------ Backref table space --------------------------*/

    /// Space for backref leaves. Raw mappings are preferred: a backend
    /// block would pin its whole region until shutdown.
    pub(crate) unsafe fn get_backref_space(&self, size: usize, raw_mem_used: &mut bool) -> *mut u8 {
        let raw = unsafe { platform::map_memory(size, PageKind::Regular) };
        if !raw.is_null() {
            *raw_mem_used = true;
            return raw;
        }
        let block = unsafe { self.generic_get_block(1, size, false) };
        if !block.is_null() {
            *raw_mem_used = false;
        }
        block as *mut u8
    }

    pub(crate) unsafe fn put_backref_space(&self, block: *mut u8, size: usize, raw_mem_used: bool) {
        // Backend blocks are reclaimed with their region at teardown.
        if raw_mem_used {
            unsafe { platform::unmap_memory(block, size) };
        }
    }

    /*-------------------------------- Remap --------------------------------*/

    /// Try to `mremap` a large object that owns its region. Only valid
    /// for sole-occupant `OneBlock` regions in the default pool.
    pub(crate) unsafe fn remap(
        &self,
        ptr_in: *mut u8,
        old_size: usize,
        new_size: usize,
        alignment: usize,
    ) -> *mut u8 {
        use crate::large_cache::{LargeHeader, LargeObjectCache};

        let pool = self.pool();
        if pool.user_pool()
            || old_size.min(new_size) < MAX_BINNED_SMALL
            || !is_aligned(ptr_in as usize, alignment)
            || alignment > pool.granularity
        {
            return ptr::null_mut();
        }
        unsafe {
            let lmb_old = (*(ptr_in as *mut LargeHeader).sub(1)).block;
            let old_unaligned_size = (*lmb_old).unaligned_size;
            let old_f_block = lmb_old as *mut FreeBlock;
            let right = FreeBlock::right_neighbor(old_f_block, old_unaligned_size);
            // Only one block per region can see LAST_REGION_BLOCK on its
            // right, so no synchronization is needed for this check.
            if !FreeBlock::is_last_region_block(right) {
                return ptr::null_mut();
            }
            let old_region = (*(right as *mut LastRegionBlock)).region;
            debug_assert!((old_region as usize) < ptr_in as usize);
            let old_region_size = (*old_region).alloc_size;
            if (*old_region).kind != RegionKind::OneBlock {
                return ptr::null_mut(); // not alone in the region
            }

            let user_offset = ptr_in as usize - old_region as usize;
            let aligned_size = LargeObjectCache::align_to_bin(new_size + user_offset);
            let request_size = align_up(
                core::mem::size_of::<Region>()
                    + aligned_size
                    + core::mem::size_of::<LastRegionBlock>(),
                pool.granularity,
            );
            if request_size < aligned_size {
                return ptr::null_mut(); // wrapped around
            }
            self.region_list.remove(old_region);
            // Deregister before the remap so a racing thread seeing the
            // reused address cannot observe a stale registration.
            self.used_addr_range.register_free(
                old_region as usize,
                old_region as usize + old_region_size,
            );

            let ret = platform::remap_memory(old_region as *mut u8, old_region_size, request_size);
            if ret.is_null() {
                self.region_list.add(old_region);
                self.used_addr_range.register_alloc(
                    old_region as usize,
                    old_region as usize + old_region_size,
                );
                return ptr::null_mut();
            }
            let region = ret as *mut Region;
            debug_assert!((*region).kind == RegionKind::OneBlock);
            (*region).alloc_size = request_size;
            (*region).block_size = aligned_size;

            let f_block = align_up(
                region as usize + core::mem::size_of::<Region>(),
                LARGE_OBJECT_ALIGNMENT,
            ) as *mut FreeBlock;

            self.region_list.add(region);
            self.start_use_block(region, f_block, false);
            debug_assert!((*f_block).size_tmp == (*region).block_size);
            // Matches block_consumed() in start_use_block.
            self.sync.block_released();

            // The object keeps its offset from the region start.
            let object = (region as usize + user_offset) as *mut u8;
            debug_assert!(is_aligned(object as usize, alignment));
            let header = (object as *mut LargeHeader).sub(1);
            crate::backref::set_backref((*header).backref, header as *mut u8);

            let lmb = f_block as *mut LargeBlock;
            (*lmb).unaligned_size = (*region).block_size;
            (*lmb).object_size = new_size;
            (*lmb).backref = (*header).backref;
            (*header).block = lmb;
            debug_assert!(lmb as usize + (*lmb).unaligned_size >= object as usize + new_size);

            self.used_addr_range
                .register_alloc(region as usize, region as usize + request_size);
            if request_size >= old_region_size {
                self.total_mem_size
                    .fetch_add(request_size - old_region_size, Ordering::Relaxed);
            } else {
                self.total_mem_size
                    .fetch_sub(old_region_size - request_size, Ordering::Relaxed);
            }
            object
        }
    }

    /*------------------------ Cleanup and teardown -------------------------*/

    /// Release advance regions that were mapped but never carved.
    pub fn clean(&self) -> bool {
        self.scan_coalesce_queue(false);

        let mut released = false;
        let mut idx = self.adv_reg_bins.min_true(0);
        while let Some(i) = idx {
            if self.free_aligned_bins.min_nonempty_bin(i) == Some(i) {
                released |= unsafe { self.free_aligned_bins.try_release_regions(i, self) };
            }
            if self.free_large_bins.min_nonempty_bin(i) == Some(i) {
                released |= unsafe { self.free_large_bins.try_release_regions(i, self) };
            }
            idx = self.adv_reg_bins.min_true(i + 1);
        }
        released
    }

    /// Re-initialize every region as a single free block. Only valid for
    /// user pools with no other threads inside the allocator.
    pub unsafe fn reset(&self) {
        debug_assert!(self.pool().user_pool(), "only user pools can be reset");
        self.verify();

        self.free_large_bins.reset();
        self.free_aligned_bins.reset();
        self.adv_reg_bins.reset();

        let mut curr = self.region_list.first();
        while !curr.is_null() {
            unsafe {
                let block = Self::find_block_in_region(curr, (*curr).block_size);
                debug_assert!(!block.is_null(), "a region unexpectedly got smaller");
                self.start_use_block(curr, block, true);
                curr = (*curr).next;
            }
        }
    }

    /// Unmap everything. Only valid with no other threads inside.
    pub unsafe fn destroy(&self) -> bool {
        let mut no_error = true;
        self.verify();
        if !self.pool().user_pool() {
            self.free_large_bins.reset();
            self.free_aligned_bins.reset();
        }
        loop {
            let head = self.region_list.first();
            if head.is_null() {
                break;
            }
            unsafe {
                self.region_list.remove(head);
                no_error &= self.free_raw_mem(head as *mut u8, (*head).alloc_size);
            }
        }
        no_error
    }

    #[cfg(debug_assertions)]
    fn verify(&self) {
        self.free_large_bins.verify();
        self.free_aligned_bins.verify();
    }

    #[cfg(not(debug_assertions))]
    fn verify(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_to_bin() {
        assert_eq!(size_to_bin(MIN_BINNED_SIZE), 0);
        assert_eq!(size_to_bin(MIN_BINNED_SIZE - 1), NO_BIN);
        assert_eq!(size_to_bin(MIN_BINNED_SIZE + FREE_BINS_STEP), 1);
        assert_eq!(size_to_bin(MAX_BINNED_HUGE), HUGE_BIN as i32);
        assert_eq!(size_to_bin(usize::MAX), HUGE_BIN as i32);
        // One step below the huge cap still maps below HUGE_BIN.
        let below = size_to_bin(MAX_BINNED_HUGE - FREE_BINS_STEP);
        assert!(below >= 0 && (below as usize) < HUGE_BIN);
    }

    #[test]
    fn test_to_aligned_bin() {
        let base = (64 * SLAB_SIZE) as *mut FreeBlock;
        assert!(to_aligned_bin(base, SLAB_SIZE));
        assert!(to_aligned_bin(
            (base as usize - 100) as *mut FreeBlock,
            SLAB_SIZE + 100
        ));
        assert!(!to_aligned_bin(base, SLAB_SIZE - 8));
        assert!(!to_aligned_bin((base as usize + 8) as *mut FreeBlock, SLAB_SIZE));
    }

    #[test]
    fn test_mem_extend_sema() {
        let sema = MemExtendSema {
            active: AtomicIsize::new(0),
        };
        for _ in 0..MEM_EXTEND_SLOTS {
            assert!(!sema.wait());
        }
        assert_eq!(sema.active.load(Ordering::Relaxed), MEM_EXTEND_SLOTS);
        for _ in 0..MEM_EXTEND_SLOTS {
            sema.signal();
        }
        assert_eq!(sema.active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_used_address_range() {
        let range = UsedAddressRange {
            left: AtomicUsize::new(0),
            right: AtomicUsize::new(0),
        };
        range.init();
        assert!(!range.in_range(0x1000 as *const u8));
        range.register_alloc(0x10000, 0x20000);
        assert!(range.in_range(0x10000 as *const u8));
        assert!(range.in_range(0x1ffff as *const u8));
        assert!(!range.in_range(0x20001 as *const u8));
        range.register_alloc(0x8000, 0x9000);
        assert!(range.in_range(0x8000 as *const u8));
    }
}
