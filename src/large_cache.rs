//! Large object cache (LOC): exact-fit caching of freed large blocks.
//!
//! Two tiers of bins: *large* sizes use arithmetic 8 KiB steps up to
//! 8 MiB, *huge* sizes use a geometric progression with eight sub-bins
//! per power of two up to the platform cap. Every bin is a logical LIFO
//! ordered by age; all bin mutations funnel through a per-bin
//! [`Aggregator`], which also pre-processes batches (put/get pairs
//! cancel, redundant cleanups collapse).
//!
//! Ageing: a pool-wide logical clock ticks on every operation. A miss
//! teaches the bin an age threshold; cleanup evicts blocks older than
//! it; a long stretch without hits makes the bin forget what it learned.

use crate::aggregator::{AggNode, Aggregator, OP_DONE, OP_NOWAIT, OP_WAIT};
use crate::backref::BackRefIdx;
use crate::bitmask::BitMask;
use crate::config::*;
use crate::pool::Pool;
use crate::size_class::MIN_LARGE_OBJECT_SIZE;
use crate::{align_up, stat_inc};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

/// Header of one large allocation, placed at the start of the span the
/// backend handed out. The first two words are preserved for the
/// backend's guarded-size protocol.
#[repr(C)]
pub struct LargeBlock {
    guard: [usize; 2],
    /// Owner pool.
    pub pool: *mut Pool,
    /// Links inside one cache bin (or a transfer list).
    pub next: *mut LargeBlock,
    pub prev: *mut LargeBlock,
    /// Links in the pool-wide list of live large blocks; needed to drop
    /// backrefs when a user pool is destroyed.
    pub g_next: *mut LargeBlock,
    pub g_prev: *mut LargeBlock,
    /// Logical time of the put that cached this block.
    pub age: usize,
    /// Size the user asked for.
    pub object_size: usize,
    /// Size the backend carved for it.
    pub unaligned_size: usize,
    /// Copy of the backref index; the used copy sits in [`LargeHeader`].
    pub backref: BackRefIdx,
}

/// Sits immediately before the user-visible pointer of a large object.
#[repr(C)]
pub struct LargeHeader {
    pub block: *mut LargeBlock,
    pub backref: BackRefIdx,
}

/*------------------------------ Operations ------------------------------*/

#[derive(Clone, Copy)]
pub(crate) enum CacheOpData {
    Get {
        res: *mut *mut LargeBlock,
        size: usize,
        /// Local (negative) time, filled in during preprocessing.
        local_time: isize,
    },
    PutList {
        head: *mut LargeBlock,
    },
    CleanToThreshold {
        res: *mut *mut LargeBlock,
        curr_time: usize,
    },
    CleanAll {
        res: *mut *mut LargeBlock,
    },
    UpdateUsedSize {
        delta: isize,
    },
}

pub(crate) struct CacheOp {
    next: *mut CacheOp,
    status: AtomicUsize,
    data: CacheOpData,
}

impl CacheOp {
    fn new(data: CacheOpData, status: usize) -> Self {
        Self {
            next: ptr::null_mut(),
            status: AtomicUsize::new(status),
            data,
        }
    }

    unsafe fn commit(op: *mut CacheOp) {
        unsafe { (*op).status.store(OP_DONE, Ordering::Release) };
    }
}

unsafe impl AggNode for CacheOp {
    unsafe fn set_next(this: *mut Self, next: *mut Self) {
        unsafe { (*this).next = next };
    }
    unsafe fn next(this: *mut Self) -> *mut Self {
        unsafe { (*this).next }
    }
    unsafe fn status<'a>(this: *mut Self) -> &'a AtomicUsize {
        unsafe { &(*this).status }
    }
}

/// Ageing factors of one tier.
#[derive(Clone, Copy)]
pub(crate) struct TierFactors {
    /// Cache counts as "too large" beyond this multiple of used size.
    pub too_large: usize,
    /// Miss threshold = on_miss × (time since last cleanup).
    pub on_miss: usize,
    /// Forget bin history after long_wait × threshold idle ticks.
    pub long_wait: usize,
}

/// Bit-set view the bins use to mark themselves used/unused without
/// knowing the mask's const-generic shape.
pub(crate) trait BinIndexMask {
    fn set_bit(&self, idx: usize, val: bool);
}

impl<const N: usize, const W: usize> BinIndexMask for BitMask<N, W> {
    fn set_bit(&self, idx: usize, val: bool) {
        self.set(idx, val);
    }
}

/*------------------------------- CacheBin -------------------------------*/

/// One exact-fit bin: an age-ordered 2-linked list of cached blocks plus
/// the learned ageing state. All mutation happens inside the aggregator
/// handler, so the non-atomic fields are drainer-private.
pub(crate) struct CacheBin {
    first: UnsafeCell<*mut LargeBlock>,
    last: AtomicPtr<LargeBlock>,
    /// Age of the oldest block; readable without the aggregator.
    oldest: AtomicUsize,
    /// Time of the last eviction caused by age (not by a hit).
    last_cleaned_age: UnsafeCell<usize>,
    /// Eviction threshold for this size; set on cache misses.
    age_threshold: AtomicIsize,
    /// Bytes of live user objects of this size.
    used_size: AtomicIsize,
    /// Bytes currently cached in the bin.
    cached_size: AtomicIsize,
    /// Moving average of ticks between a put and its matching get.
    mean_hit_range: AtomicIsize,
    /// Time of the last get.
    last_get: UnsafeCell<usize>,
    aggregator: Aggregator<CacheOp>,
}

// SAFETY: the UnsafeCell fields are only touched by the single batch
// drainer the aggregator admits at a time.
unsafe impl Send for CacheBin {}
unsafe impl Sync for CacheBin {}

impl CacheBin {
    /*------------------ aggregated entry points ------------------*/

    unsafe fn execute_op(
        &self,
        op: *mut CacheOp,
        blocking: bool,
        pool: &Pool,
        mask: &dyn BinIndexMask,
        idx: usize,
        factors: TierFactors,
    ) {
        let mut outcome: (*mut LargeBlock, bool, usize) = (ptr::null_mut(), false, 0);
        unsafe {
            self.aggregator.execute(op, blocking, |batch| {
                outcome = unsafe { self.handle_batch(batch, pool, mask, idx, factors) };
            });
        }
        let (to_release, need_cleanup, curr_time) = outcome;
        if !to_release.is_null() {
            unsafe { pool.backend.return_large_object(to_release) };
        }
        if need_cleanup {
            pool.loc.do_cleanup(curr_time, false);
        }
    }

    pub unsafe fn get_block(
        &self,
        pool: &Pool,
        mask: &dyn BinIndexMask,
        idx: usize,
        factors: TierFactors,
        size: usize,
    ) -> *mut LargeBlock {
        let mut result: *mut LargeBlock = ptr::null_mut();
        let mut op = CacheOp::new(
            CacheOpData::Get {
                res: &mut result,
                size,
                local_time: 0,
            },
            OP_WAIT,
        );
        unsafe { self.execute_op(&mut op, true, pool, mask, idx, factors) };
        result
    }

    /// Insert a list of same-bin blocks. Non-blocking: the operation
    /// record is placed in the head block's dead user area, which stays
    /// valid at least until the block leaves the cache.
    pub unsafe fn put_blocks(
        &self,
        pool: &Pool,
        mask: &dyn BinIndexMask,
        idx: usize,
        factors: TierFactors,
        head: *mut LargeBlock,
    ) {
        unsafe {
            debug_assert!(
                core::mem::size_of::<LargeBlock>() + core::mem::size_of::<CacheOp>()
                    <= (*head).unaligned_size
            );
            let op = head.add(1) as *mut CacheOp;
            ptr::write(op, CacheOp::new(CacheOpData::PutList { head }, OP_NOWAIT));
            self.execute_op(op, false, pool, mask, idx, factors);
        }
    }

    pub unsafe fn clean_to_threshold(
        &self,
        pool: &Pool,
        mask: &dyn BinIndexMask,
        idx: usize,
        factors: TierFactors,
        curr_time: usize,
    ) -> bool {
        let mut to_release: *mut LargeBlock = ptr::null_mut();
        // Age wrap-around makes the difference signed.
        if !self.last.load(Ordering::Relaxed).is_null()
            && curr_time.wrapping_sub(self.oldest.load(Ordering::Relaxed)) as isize
                > self.age_threshold.load(Ordering::Relaxed)
        {
            let mut op = CacheOp::new(
                CacheOpData::CleanToThreshold {
                    res: &mut to_release,
                    curr_time,
                },
                OP_WAIT,
            );
            unsafe { self.execute_op(&mut op, true, pool, mask, idx, factors) };
        }
        let released = !to_release.is_null();
        while !to_release.is_null() {
            unsafe {
                let next = (*to_release).next;
                pool.backend.return_large_object(to_release);
                to_release = next;
            }
        }
        released
    }

    pub unsafe fn release_all(
        &self,
        pool: &Pool,
        mask: &dyn BinIndexMask,
        idx: usize,
        factors: TierFactors,
    ) -> bool {
        let mut to_release: *mut LargeBlock = ptr::null_mut();
        if !self.last.load(Ordering::Relaxed).is_null() {
            let mut op = CacheOp::new(CacheOpData::CleanAll { res: &mut to_release }, OP_WAIT);
            unsafe { self.execute_op(&mut op, true, pool, mask, idx, factors) };
        }
        let released = !to_release.is_null();
        while !to_release.is_null() {
            unsafe {
                let next = (*to_release).next;
                pool.backend.return_large_object(to_release);
                to_release = next;
            }
        }
        released
    }

    pub unsafe fn update_used(
        &self,
        pool: &Pool,
        mask: &dyn BinIndexMask,
        idx: usize,
        factors: TierFactors,
        delta: isize,
    ) {
        let mut op = CacheOp::new(CacheOpData::UpdateUsedSize { delta }, OP_WAIT);
        unsafe { self.execute_op(&mut op, true, pool, mask, idx, factors) };
    }

    /*---------------------- batch processing ----------------------*/

    /// Apply one batch of operations. Returns (block to sieve to the
    /// backend, whether a pool-wide cleanup is due, the current time).
    unsafe fn handle_batch(
        &self,
        batch: *mut CacheOp,
        pool: &Pool,
        mask: &dyn BinIndexMask,
        idx: usize,
        factors: TierFactors,
    ) -> (*mut LargeBlock, bool, usize) {
        // Preprocessing: relative times count backwards because the
        // batch arrives newest-first.
        let mut lcl_time: isize = 0;
        let mut op_get_list: *mut CacheOp = ptr::null_mut();
        let mut op_clean_list: *mut CacheOp = ptr::null_mut();
        let mut clean_time: usize = 0;
        let mut last_get_op_time: isize = 0;
        let mut last_get: isize = 0;
        let mut update_used_sum: isize = 0;
        let mut put_head: *mut LargeBlock = ptr::null_mut();
        let mut put_tail: *mut LargeBlock = ptr::null_mut();
        let mut put_num: isize = 0;
        let mut is_clean_all = false;

        // Serve a pending get straight from the batch's own put list.
        // The cancelled pair still teaches the bin its hit interval.
        // Expanded only inside the unsafe batch walk below.
        macro_rules! get_from_put_list {
            ($op_get:expr, $time:expr) => {{
                if put_head.is_null() {
                    false
                } else {
                    let block = put_head;
                    let age = (*block).age;
                    put_head = (*block).next;
                    if put_head.is_null() {
                        put_tail = ptr::null_mut();
                    }
                    if let CacheOpData::Get { res, .. } = (*$op_get).data {
                        *res = block;
                    }
                    CacheOp::commit($op_get);
                    put_num -= 1;
                    debug_assert!(put_num >= 0);
                    self.update_mean_hit_range($time.wrapping_sub(age as isize));
                    true
                }
            }};
        }

        let mut op = batch;
        while !op.is_null() {
            let op_next = unsafe { CacheOp::next(op) };
            unsafe {
                match (*op).data {
                    CacheOpData::Get { .. } => {
                        lcl_time -= 1;
                        if last_get_op_time == 0 {
                            last_get_op_time = lcl_time;
                            last_get = 0;
                        } else if last_get == 0 {
                            last_get = lcl_time;
                        }
                        if !get_from_put_list!(op, lcl_time) {
                            if let CacheOpData::Get { local_time, .. } = &mut (*op).data {
                                *local_time = lcl_time;
                            }
                            (*op).next = op_get_list;
                            op_get_list = op;
                        }
                    }
                    CacheOpData::PutList { head } => {
                        let mut curr = head;
                        let mut prev: *mut LargeBlock = ptr::null_mut();
                        let mut num: isize = 0;
                        while !curr.is_null() {
                            (*curr).prev = prev;
                            // Local age; shifted to global time once the
                            // clock advances for the whole batch.
                            lcl_time -= 1;
                            (*curr).age = lcl_time as usize;
                            prev = curr;
                            num += 1;
                            curr = (*curr).next;
                        }
                        if put_head.is_null() {
                            put_head = head;
                            put_tail = prev;
                            put_num = num;
                        } else {
                            (*put_tail).next = head;
                            (*head).prev = put_tail;
                            put_tail = prev;
                            put_num += num;
                        }
                        while !op_get_list.is_null() {
                            let next_get = (*op_get_list).next;
                            let time = match (*op_get_list).data {
                                CacheOpData::Get { local_time, .. } => local_time,
                                _ => 0,
                            };
                            if !get_from_put_list!(op_get_list, time) {
                                break;
                            }
                            op_get_list = next_get;
                        }
                    }
                    CacheOpData::UpdateUsedSize { delta } => {
                        update_used_sum += delta;
                        CacheOp::commit(op);
                    }
                    CacheOpData::CleanAll { .. } => {
                        is_clean_all = true;
                        (*op).next = op_clean_list;
                        op_clean_list = op;
                    }
                    CacheOpData::CleanToThreshold { curr_time, .. } => {
                        if curr_time > clean_time {
                            clean_time = curr_time;
                        }
                        (*op).next = op_clean_list;
                        op_clean_list = op;
                    }
                }
            }
            op = op_next;
        }
        debug_assert!(
            op_get_list.is_null() || put_head.is_null(),
            "unmerged put/get pairs left in batch"
        );

        // Apply phase.
        let mut to_release: *mut LargeBlock = ptr::null_mut();
        let mut need_cleanup = false;
        let mut out_time = 0usize;

        let time_range = (-lcl_time) as usize;
        if time_range != 0 {
            let start_time = pool.loc.advance_time(time_range);
            // Local times are negative offsets from the batch end.
            let end_time = start_time.wrapping_add(time_range);

            if last_get_op_time != 0 && last_get != 0 {
                unsafe { self.set_last_get((last_get as usize).wrapping_add(end_time)) };
            }

            if !op_get_list.is_null() {
                let mut is_empty = false;
                let mut op_get = op_get_list;
                while !op_get.is_null() {
                    let op_next = unsafe { CacheOp::next(op_get) };
                    unsafe {
                        if let CacheOpData::Get {
                            res,
                            size,
                            local_time,
                        } = (*op_get).data
                        {
                            if !is_empty {
                                let block = self.pop_front();
                                if !block.is_null() {
                                    let get_time =
                                        (local_time as usize).wrapping_add(end_time);
                                    self.update_mean_hit_range(
                                        get_time.wrapping_sub((*block).age) as isize,
                                    );
                                    self.cached_size
                                        .fetch_sub(size as isize, Ordering::Relaxed);
                                    *res = block;
                                } else {
                                    is_empty = true;
                                    let miss_time =
                                        (last_get_op_time as usize).wrapping_add(end_time);
                                    self.forget_outdated_state(miss_time, factors);
                                    self.update_age_threshold(miss_time, factors);
                                }
                            }
                            self.update_used_size(size as isize, mask, idx);
                            CacheOp::commit(op_get);
                        }
                    }
                    op_get = op_next;
                }
                if last_get_op_time != 0 {
                    unsafe {
                        self.set_last_get((last_get_op_time as usize).wrapping_add(end_time))
                    };
                }
            } else if !put_head.is_null() {
                unsafe {
                    (*put_head).prev = ptr::null_mut();
                    let mut curr = put_head;
                    while !curr.is_null() {
                        (*curr).age = (*curr).age.wrapping_add(end_time);
                        curr = (*curr).next;
                    }
                    to_release = self.insert_blocks(
                        put_head,
                        put_tail,
                        mask,
                        idx,
                        put_num,
                        pool.loc.huge_size_threshold(),
                    );
                }
            }
            need_cleanup = pool.loc.is_cleanup_needed_on_range(time_range, start_time);
            out_time = end_time.wrapping_sub(1);
        }

        if !op_clean_list.is_null() {
            let cleaned = unsafe {
                if is_clean_all {
                    self.take_all(mask, idx)
                } else {
                    self.take_older_than(clean_time, mask, idx)
                }
            };
            // Only the first record reports the blocks; later cleanups
            // in the same batch were subsumed by it.
            let mut first = true;
            let mut op = op_clean_list;
            while !op.is_null() {
                let op_next = unsafe { CacheOp::next(op) };
                unsafe {
                    if first {
                        match (*op).data {
                            CacheOpData::CleanAll { res }
                            | CacheOpData::CleanToThreshold { res, .. } => *res = cleaned,
                            _ => {}
                        }
                        first = false;
                    }
                    CacheOp::commit(op);
                }
                op = op_next;
            }
        }

        if update_used_sum != 0 {
            unsafe { self.update_used_size(update_used_sum, mask, idx) };
        }

        (to_release, need_cleanup, out_time)
    }

    /*------------------- drainer-only primitives -------------------*/

    unsafe fn pop_front(&self) -> *mut LargeBlock {
        unsafe {
            let result = *self.first.get();
            if !result.is_null() {
                *self.first.get() = (*result).next;
                if !(*result).next.is_null() {
                    (*(*result).next).prev = ptr::null_mut();
                } else {
                    self.last.store(ptr::null_mut(), Ordering::Relaxed);
                    self.oldest.store(0, Ordering::Relaxed);
                }
            }
            result
        }
    }

    /// Splice an age-stamped `[head; tail]` list into the bin. The very
    /// first block of a size is not cached: its release time seeds
    /// `last_cleaned_age` so the next miss can learn a threshold.
    unsafe fn insert_blocks(
        &self,
        head: *mut LargeBlock,
        tail: *mut LargeBlock,
        mask: &dyn BinIndexMask,
        idx: usize,
        num: isize,
        huge_threshold: usize,
    ) -> *mut LargeBlock {
        unsafe {
            let mut head = head;
            let mut tail = tail;
            let mut num = num;
            let size = (*head).unaligned_size;
            self.used_size
                .fetch_sub(num * size as isize, Ordering::Relaxed);
            debug_assert!(num == 1 && head == tail || num > 1 && head != tail);

            let mut to_release: *mut LargeBlock = ptr::null_mut();
            if size < huge_threshold && *self.last_cleaned_age.get() == 0 {
                *self.last_cleaned_age.get() = (*tail).age;
                to_release = tail;
                tail = (*tail).prev;
                if !tail.is_null() {
                    (*tail).next = ptr::null_mut();
                } else {
                    head = ptr::null_mut();
                }
                num -= 1;
            }
            if num > 0 {
                debug_assert!(!tail.is_null());
                (*tail).next = *self.first.get();
                if !(*self.first.get()).is_null() {
                    (*(*self.first.get())).prev = tail;
                }
                *self.first.get() = head;
                if self.last.load(Ordering::Relaxed).is_null() {
                    debug_assert_eq!(self.oldest.load(Ordering::Relaxed), 0);
                    self.oldest.store((*tail).age, Ordering::Relaxed);
                    self.last.store(tail, Ordering::Relaxed);
                }
                self.cached_size
                    .fetch_add(num * size as isize, Ordering::Relaxed);
            }
            if self.used_size.load(Ordering::Relaxed) == 0 && (*self.first.get()).is_null() {
                mask.set_bit(idx, false);
            }
            to_release
        }
    }

    /// Detach every block older than the bin's threshold at `curr_time`.
    unsafe fn take_older_than(
        &self,
        curr_time: usize,
        mask: &dyn BinIndexMask,
        idx: usize,
    ) -> *mut LargeBlock {
        unsafe {
            let threshold = self.age_threshold.load(Ordering::Relaxed);
            let mut last = self.last.load(Ordering::Relaxed);
            if last.is_null()
                || (curr_time.wrapping_sub((*last).age) as isize) < threshold
            {
                return ptr::null_mut();
            }
            loop {
                self.cached_size
                    .fetch_sub((*last).unaligned_size as isize, Ordering::Relaxed);
                last = (*last).prev;
                if last.is_null()
                    || (curr_time.wrapping_sub((*last).age) as isize) <= threshold
                {
                    break;
                }
            }
            self.last.store(last, Ordering::Relaxed);

            let to_release;
            if !last.is_null() {
                to_release = (*last).next;
                self.oldest.store((*last).age, Ordering::Relaxed);
                (*last).next = ptr::null_mut();
            } else {
                to_release = *self.first.get();
                *self.first.get() = ptr::null_mut();
                self.oldest.store(0, Ordering::Relaxed);
                if self.used_size.load(Ordering::Relaxed) == 0 {
                    mask.set_bit(idx, false);
                }
            }
            debug_assert!(!to_release.is_null());
            *self.last_cleaned_age.get() = (*to_release).age;
            to_release
        }
    }

    unsafe fn take_all(&self, mask: &dyn BinIndexMask, idx: usize) -> *mut LargeBlock {
        unsafe {
            if self.last.load(Ordering::Relaxed).is_null() {
                return ptr::null_mut();
            }
            let to_release = *self.first.get();
            self.last.store(ptr::null_mut(), Ordering::Relaxed);
            *self.first.get() = ptr::null_mut();
            self.oldest.store(0, Ordering::Relaxed);
            self.cached_size.store(0, Ordering::Relaxed);
            if self.used_size.load(Ordering::Relaxed) == 0 {
                mask.set_bit(idx, false);
            }
            to_release
        }
    }

    /// Rarely-used bin: after `long_wait × threshold` ticks without a
    /// get, drop the learned history so stale thresholds do not pin
    /// blocks of a workload that moved on.
    unsafe fn forget_outdated_state(&self, curr_time: usize, factors: TierFactors) {
        unsafe {
            let since_last_get = curr_time.wrapping_sub(*self.last_get.get());
            let threshold = self.age_threshold.load(Ordering::Relaxed);
            let do_forget = if threshold != 0 {
                since_last_get as isize > factors.long_wait as isize * threshold
            } else if *self.last_cleaned_age.get() != 0 {
                since_last_get as isize
                    > factors.long_wait as isize
                        * ((*self.last_cleaned_age.get()).wrapping_sub(*self.last_get.get())
                            as isize)
            } else {
                false
            };
            if do_forget {
                *self.last_cleaned_age.get() = 0;
                self.age_threshold.store(0, Ordering::Relaxed);
            }
        }
    }

    unsafe fn update_age_threshold(&self, curr_time: usize, factors: TierFactors) {
        unsafe {
            let cleaned = *self.last_cleaned_age.get();
            if cleaned != 0 {
                self.age_threshold.store(
                    factors.on_miss as isize * curr_time.wrapping_sub(cleaned) as isize,
                    Ordering::Relaxed,
                );
            }
        }
    }

    fn update_mean_hit_range(&self, hit_range: isize) {
        let hit_range = hit_range.max(0);
        let mean = self.mean_hit_range.load(Ordering::Relaxed);
        let mean = if mean != 0 { (mean + hit_range) / 2 } else { hit_range };
        self.mean_hit_range.store(mean, Ordering::Relaxed);
    }

    unsafe fn update_used_size(&self, delta: isize, mask: &dyn BinIndexMask, idx: usize) {
        unsafe {
            if self.used_size.load(Ordering::Relaxed) == 0 {
                mask.set_bit(idx, true);
            }
            self.used_size.fetch_add(delta, Ordering::Relaxed);
            if self.used_size.load(Ordering::Relaxed) == 0 && (*self.first.get()).is_null() {
                mask.set_bit(idx, false);
            }
        }
    }

    unsafe fn set_last_get(&self, time: usize) {
        unsafe { *self.last_get.get() = time };
    }

    pub fn decrease_threshold(&self) {
        let threshold = self.age_threshold.load(Ordering::Relaxed);
        if threshold != 0 {
            self.age_threshold.store(
                (threshold + self.mean_hit_range.load(Ordering::Relaxed)) / 2,
                Ordering::Relaxed,
            );
        }
    }

    fn cached(&self) -> isize {
        self.cached_size.load(Ordering::Relaxed)
    }

    fn used(&self) -> isize {
        self.used_size.load(Ordering::Relaxed)
    }

    /// Back to the all-zero state; only valid with no concurrent users.
    fn reset_state(&self) {
        unsafe {
            *self.first.get() = ptr::null_mut();
            *self.last_cleaned_age.get() = 0;
            *self.last_get.get() = 0;
        }
        self.last.store(ptr::null_mut(), Ordering::Relaxed);
        self.oldest.store(0, Ordering::Relaxed);
        self.age_threshold.store(0, Ordering::Relaxed);
        self.used_size.store(0, Ordering::Relaxed);
        self.cached_size.store(0, Ordering::Relaxed);
        self.mean_hit_range.store(0, Ordering::Relaxed);
    }
}

/*-------------------------------- Tiers ---------------------------------*/

pub(crate) trait TierProps {
    const MIN_SIZE: usize;
    const MAX_SIZE: usize;
    const NUM_BINS: usize;
    const FACTORS: TierFactors;

    fn align_to_bin(size: usize) -> usize;
    fn size_to_idx(size: usize) -> usize;
}

/// Arithmetic tier: one bin per 8 KiB step.
pub(crate) struct LargeTier;

impl TierProps for LargeTier {
    const MIN_SIZE: usize = LARGE_CACHE_MIN_SIZE;
    const MAX_SIZE: usize = LARGE_CACHE_MAX_SIZE;
    const NUM_BINS: usize = LARGE_CACHE_NUM_BINS;
    const FACTORS: TierFactors = TierFactors {
        too_large: LARGE_TOO_LARGE_FACTOR,
        on_miss: LARGE_ON_MISS_FACTOR,
        long_wait: LARGE_LONG_WAIT_FACTOR,
    };

    fn align_to_bin(size: usize) -> usize {
        align_up(size, FREE_BINS_STEP)
    }

    fn size_to_idx(size: usize) -> usize {
        debug_assert!(Self::MIN_SIZE <= size && size < Self::MAX_SIZE);
        debug_assert!(size % FREE_BINS_STEP == 0);
        (size - Self::MIN_SIZE) / FREE_BINS_STEP
    }
}

/// Geometric tier: sizes grow as `MIN × 2^(idx / step_factor)`, with
/// `HUGE_STEP_FACTOR` bins between consecutive powers of two.
pub(crate) struct HugeTier;

const STEP_FACTOR_EXP: usize = HUGE_STEP_FACTOR.trailing_zeros() as usize;

#[inline]
fn bit_scan_rev(v: usize) -> usize {
    usize::BITS as usize - 1 - v.leading_zeros() as usize
}

impl TierProps for HugeTier {
    const MIN_SIZE: usize = LARGE_CACHE_MAX_SIZE;
    const MAX_SIZE: usize = MAX_HUGE_SIZE;
    const NUM_BINS: usize = HUGE_CACHE_NUM_BINS;
    const FACTORS: TierFactors = TierFactors {
        too_large: HUGE_TOO_LARGE_FACTOR,
        on_miss: HUGE_ON_MISS_FACTOR,
        long_wait: HUGE_LONG_WAIT_FACTOR,
    };

    fn align_to_bin(size: usize) -> usize {
        let minor_step_exp = bit_scan_rev(size) - STEP_FACTOR_EXP;
        align_up(size, 1 << minor_step_exp)
    }

    fn size_to_idx(size: usize) -> usize {
        debug_assert!(Self::MIN_SIZE <= size && size <= Self::MAX_SIZE);
        let size_exp = bit_scan_rev(size);
        let major_step_size = 1usize << size_exp;
        let minor_step_exp = size_exp - STEP_FACTOR_EXP;
        let minor_idx = (size - major_step_size) >> minor_step_exp;
        debug_assert!(size == major_step_size + (minor_idx << minor_step_exp));
        HUGE_STEP_FACTOR * (size_exp - bit_scan_rev(Self::MIN_SIZE)) + minor_idx
    }
}

/// One tier of bins with its used-bin mask and too-large detector.
pub(crate) struct TierCache<P: TierProps, const NB: usize, const WORDS: usize> {
    /// Bins at or above this index hold sizes past the huge-size
    /// threshold and are skipped by regular cleanup.
    threshold_idx: AtomicUsize,
    /// Consecutive cleanups that found the cache too large.
    too_large_count: AtomicIsize,
    bitmask: BitMask<NB, WORDS>,
    bins: [CacheBin; NB],
    _props: PhantomData<P>,
}

impl<P: TierProps, const NB: usize, const WORDS: usize> TierCache<P, NB, WORDS> {
    pub unsafe fn get(&self, pool: &Pool, size: usize) -> *mut LargeBlock {
        let idx = P::size_to_idx(size);
        unsafe { self.bins[idx].get_block(pool, &self.bitmask, idx, P::FACTORS, size) }
    }

    pub unsafe fn put_list(&self, pool: &Pool, head: *mut LargeBlock) {
        let idx = P::size_to_idx(unsafe { (*head).unaligned_size });
        unsafe { self.bins[idx].put_blocks(pool, &self.bitmask, idx, P::FACTORS, head) };
    }

    pub unsafe fn update_cache_state(&self, pool: &Pool, delta: isize, size: usize) {
        let idx = P::size_to_idx(size);
        debug_assert!(idx < NB);
        unsafe { self.bins[idx].update_used(pool, &self.bitmask, idx, P::FACTORS, delta) };
    }

    /// Evict blocks older than each used bin's threshold. With the
    /// too-large detector tripped, thresholds shrink first.
    pub unsafe fn regular_cleanup(
        &self,
        pool: &Pool,
        curr_time: usize,
        mut do_thresh_decr: bool,
    ) -> bool {
        let mut released = false;
        let mut used_sum: isize = 0;
        let mut cached_sum: isize = 0;

        let threshold_idx = self.threshold_idx.load(Ordering::Relaxed);
        if threshold_idx == 0 {
            return false;
        }
        let start_search = threshold_idx - 1;

        let mut idx = self.bitmask.max_true(start_search);
        while let Some(i) = idx {
            let bin = &self.bins[i];
            used_sum += bin.used();
            cached_sum += bin.cached();
            if !do_thresh_decr
                && self.too_large_count.load(Ordering::Relaxed) > 2
                && cached_sum > P::FACTORS.too_large as isize * used_sum
            {
                // Persistent oversize: redo the pass shrinking
                // thresholds from learned hit intervals.
                do_thresh_decr = true;
                used_sum = 0;
                cached_sum = 0;
                idx = self.bitmask.max_true(start_search);
                continue;
            }
            if do_thresh_decr {
                bin.decrease_threshold();
            }
            if unsafe { bin.clean_to_threshold(pool, &self.bitmask, i, P::FACTORS, curr_time) } {
                released = true;
            }
            idx = if i == 0 { None } else { self.bitmask.max_true(i - 1) };
        }

        // Detect "too large for a while": races between increment and
        // zeroing are fine, only the streak matters.
        if cached_sum > P::FACTORS.too_large as isize * used_sum {
            self.too_large_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.too_large_count.store(0, Ordering::Relaxed);
        }
        released
    }

    pub unsafe fn clean_all(&self, pool: &Pool) -> bool {
        let mut released = false;
        for i in (0..NB).rev() {
            released |= unsafe { self.bins[i].release_all(pool, &self.bitmask, i, P::FACTORS) };
        }
        released
    }

    pub fn reset(&self) {
        self.too_large_count.store(0, Ordering::Relaxed);
        for bin in &self.bins {
            bin.reset_state();
        }
        self.bitmask.reset();
    }

    fn set_threshold_idx(&self, idx: usize) {
        self.threshold_idx.store(idx, Ordering::Relaxed);
    }
}

type LargeTierCache =
    TierCache<LargeTier, LARGE_CACHE_NUM_BINS, { bitmask_words(LARGE_CACHE_NUM_BINS) }>;
type HugeTierCache =
    TierCache<HugeTier, HUGE_CACHE_NUM_BINS, { bitmask_words(HUGE_CACHE_NUM_BINS) }>;

/*--------------------------- LargeObjectCache ---------------------------*/

/// The pool-wide cache of freed large blocks.
pub(crate) struct LargeObjectCache {
    pool: AtomicPtr<Pool>,
    /// Sizes at or above this are skipped by regular cleanup; settable
    /// by the user, aligned to a bin boundary.
    huge_size_threshold: AtomicUsize,
    /// Logical clock; every put/get advances it so cached ages and hit
    /// predictors stay distinct.
    curr_time: AtomicUsize,
    // The huge tier leads to keep the hot large tier away from
    // whatever precedes this struct in the pool.
    huge: HugeTierCache,
    large: LargeTierCache,
}

impl LargeObjectCache {
    /// Wire up and apply the huge-size threshold from the environment.
    pub unsafe fn init(&self, pool: *mut Pool) {
        self.pool.store(pool, Ordering::Relaxed);
        if self.huge_size_threshold.load(Ordering::Relaxed) == 0 {
            let requested = crate::platform::env_usize(c"SCMALLOC_HUGE_SIZE_THRESHOLD");
            self.set_huge_size_threshold(requested.unwrap_or(MAX_HUGE_SIZE));
        }
    }

    fn pool(&self) -> &Pool {
        unsafe { &*self.pool.load(Ordering::Relaxed) }
    }

    pub fn set_huge_size_threshold(&self, value: usize) {
        // Valid only inside the huge tier's range.
        if value <= MAX_HUGE_SIZE {
            let threshold = if value >= LARGE_CACHE_MAX_SIZE {
                Self::align_to_bin(value)
            } else {
                LARGE_CACHE_MAX_SIZE
            };
            self.huge_size_threshold.store(threshold, Ordering::Relaxed);
            self.large.set_threshold_idx(LARGE_CACHE_NUM_BINS);
            self.huge
                .set_threshold_idx(HugeTier::size_to_idx(threshold));
        }
    }

    pub fn huge_size_threshold(&self) -> usize {
        self.huge_size_threshold.load(Ordering::Relaxed)
    }

    /// Should this size be cached at all, or sieved through?
    pub fn size_in_cache_range(&self, size: usize) -> bool {
        size < MAX_HUGE_SIZE
            && (size <= DEFAULT_MAX_HUGE_SIZE || size >= self.huge_size_threshold())
    }

    /// Exact-fit sizes only: round a block size up to its bin boundary.
    pub fn align_to_bin(size: usize) -> usize {
        if size < LARGE_CACHE_MAX_SIZE {
            LargeTier::align_to_bin(size)
        } else {
            HugeTier::align_to_bin(size)
        }
    }

    fn size_to_idx(size: usize) -> usize {
        debug_assert!(size <= MAX_HUGE_SIZE);
        if size < LARGE_CACHE_MAX_SIZE {
            LargeTier::size_to_idx(size)
        } else {
            LARGE_CACHE_NUM_BINS + HugeTier::size_to_idx(size)
        }
    }

    pub fn advance_time(&self, range: usize) -> usize {
        self.curr_time.fetch_add(range, Ordering::AcqRel).wrapping_add(1)
    }

    /// A cleanup is due when the batch's time range crosses a multiple
    /// of the cleanup frequency (or the clock wrapped).
    pub fn is_cleanup_needed_on_range(&self, range: usize, curr_time: usize) -> bool {
        let next_boundary =
            curr_time.wrapping_add(CACHE_CLEANUP_FREQ - 1) & !(CACHE_CLEANUP_FREQ - 1);
        range >= CACHE_CLEANUP_FREQ
            || curr_time.wrapping_add(range) < curr_time.wrapping_sub(1)
            || next_boundary < curr_time.wrapping_add(range)
    }

    pub unsafe fn put(&self, block: *mut LargeBlock) {
        let pool = self.pool();
        unsafe {
            let block_size = (*block).unaligned_size;
            if self.size_in_cache_range(block_size) {
                (*block).next = ptr::null_mut();
                if block_size < LARGE_CACHE_MAX_SIZE {
                    self.large.put_list(pool, block);
                } else {
                    self.huge.put_list(pool, block);
                }
            } else {
                pool.backend.return_large_object(block);
            }
        }
    }

    /// Insert a mixed-size list, grouping same-bin runs so each bin is
    /// entered once. The list is short (a thread's local cache), so the
    /// quadratic grouping is fine.
    pub unsafe fn put_list(&self, list: *mut LargeBlock) {
        let pool = self.pool();
        let mut to_process = list;
        unsafe {
            while !to_process.is_null() {
                let curr = to_process;
                let mut tail = curr;
                to_process = (*curr).next;
                if !self.size_in_cache_range((*curr).unaligned_size) {
                    pool.backend.return_large_object(curr);
                    continue;
                }
                let curr_idx = Self::size_to_idx((*curr).unaligned_size);

                let mut scan = to_process;
                while !scan.is_null() {
                    let next = (*scan).next;
                    if Self::size_to_idx((*scan).unaligned_size) == curr_idx {
                        (*tail).next = scan;
                        tail = scan;
                        if to_process == scan {
                            to_process = (*to_process).next;
                        } else {
                            (*(*scan).prev).next = (*scan).next;
                            if !(*scan).next.is_null() {
                                (*(*scan).next).prev = (*scan).prev;
                            }
                        }
                    }
                    scan = next;
                }
                (*tail).next = ptr::null_mut();

                if (*curr).unaligned_size < LARGE_CACHE_MAX_SIZE {
                    self.large.put_list(pool, curr);
                } else {
                    self.huge.put_list(pool, curr);
                }
            }
        }
    }

    pub unsafe fn get(&self, size: usize) -> *mut LargeBlock {
        debug_assert!(size >= MIN_LARGE_OBJECT_SIZE);
        if !self.size_in_cache_range(size) {
            return ptr::null_mut();
        }
        let pool = self.pool();
        let block = unsafe {
            if size < LARGE_CACHE_MAX_SIZE {
                self.large.get(pool, size)
            } else {
                self.huge.get(pool, size)
            }
        };
        if !block.is_null() {
            stat_inc!(large_cache_hits);
        }
        block
    }

    /// Account an allocation (or free) that bypassed the cache bins.
    pub unsafe fn update_cache_state(&self, delta_size: isize, size: usize) {
        let pool = self.pool();
        unsafe {
            if size < LARGE_CACHE_MAX_SIZE {
                self.large.update_cache_state(pool, delta_size, size);
            } else if size < MAX_HUGE_SIZE {
                self.huge.update_cache_state(pool, delta_size, size);
            }
        }
    }

    pub unsafe fn register_realloc(&self, old_size: usize, new_size: usize) {
        unsafe {
            self.update_cache_state(-(old_size as isize), old_size);
            let new_aligned = Self::align_to_bin(new_size);
            self.update_cache_state(new_aligned as isize, new_aligned);
        }
    }

    pub fn do_cleanup(&self, curr_time: usize, do_thresh_decr: bool) -> bool {
        let pool = self.pool();
        if !do_thresh_decr {
            pool.all_local_caches.mark_unused();
        }
        unsafe {
            self.large.regular_cleanup(pool, curr_time, do_thresh_decr)
                | self.huge.regular_cleanup(pool, curr_time, do_thresh_decr)
        }
    }

    pub fn regular_cleanup(&self) -> bool {
        self.do_cleanup(self.curr_time.load(Ordering::Acquire), false)
    }

    pub fn decreasing_cleanup(&self) -> bool {
        self.do_cleanup(self.curr_time.load(Ordering::Acquire), true)
    }

    pub fn clean_all(&self) -> bool {
        let pool = self.pool();
        unsafe { self.large.clean_all(pool) | self.huge.clean_all(pool) }
    }

    /// Only valid with no concurrent users of the pool.
    pub fn reset(&self) {
        self.large.reset();
        self.huge.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_tier_idx() {
        assert_eq!(LargeTier::size_to_idx(LARGE_CACHE_MIN_SIZE), 0);
        assert_eq!(
            LargeTier::size_to_idx(LARGE_CACHE_MIN_SIZE + FREE_BINS_STEP),
            1
        );
        assert_eq!(
            LargeTier::size_to_idx(LARGE_CACHE_MAX_SIZE - FREE_BINS_STEP),
            LARGE_CACHE_NUM_BINS - 1
        );
        assert_eq!(LargeTier::align_to_bin(LARGE_CACHE_MIN_SIZE + 1), LARGE_CACHE_MIN_SIZE + FREE_BINS_STEP);
    }

    #[test]
    fn test_huge_tier_idx() {
        // The first huge bin starts at the large/huge boundary.
        assert_eq!(HugeTier::size_to_idx(LARGE_CACHE_MAX_SIZE), 0);
        // Next power of two starts a new group of HUGE_STEP_FACTOR bins.
        assert_eq!(
            HugeTier::size_to_idx(2 * LARGE_CACHE_MAX_SIZE),
            HUGE_STEP_FACTOR
        );
        let minor = LARGE_CACHE_MAX_SIZE / HUGE_STEP_FACTOR;
        assert_eq!(HugeTier::size_to_idx(LARGE_CACHE_MAX_SIZE + minor), 1);
        assert_eq!(
            HugeTier::size_to_idx(MAX_HUGE_SIZE),
            HUGE_CACHE_NUM_BINS
        );
    }

    #[test]
    fn test_huge_align_to_bin() {
        let minor = LARGE_CACHE_MAX_SIZE / HUGE_STEP_FACTOR;
        assert_eq!(
            HugeTier::align_to_bin(LARGE_CACHE_MAX_SIZE),
            LARGE_CACHE_MAX_SIZE
        );
        assert_eq!(
            HugeTier::align_to_bin(LARGE_CACHE_MAX_SIZE + 1),
            LARGE_CACHE_MAX_SIZE + minor
        );
        // Alignment never decreases a size and lands on a bin boundary.
        for size in [
            LARGE_CACHE_MAX_SIZE + 12345,
            3 * LARGE_CACHE_MAX_SIZE / 2 + 7,
            5 * LARGE_CACHE_MAX_SIZE + 1,
        ] {
            let aligned = HugeTier::align_to_bin(size);
            assert!(aligned >= size);
            let idx = HugeTier::size_to_idx(aligned);
            assert!(idx < HUGE_CACHE_NUM_BINS + HUGE_STEP_FACTOR);
        }
    }

    #[test]
    fn test_mean_hit_range_moving_average() {
        let bin: CacheBin = unsafe { core::mem::zeroed() };
        bin.update_mean_hit_range(100);
        assert_eq!(bin.mean_hit_range.load(Ordering::Relaxed), 100);
        bin.update_mean_hit_range(50);
        assert_eq!(bin.mean_hit_range.load(Ordering::Relaxed), 75);
        // Negative ranges clamp to zero.
        bin.update_mean_hit_range(-10);
        assert_eq!(bin.mean_hit_range.load(Ordering::Relaxed), 37);
    }
}
