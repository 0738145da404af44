//! Free blocks and memory regions managed by the backend.
//!
//! Every free span starts with two guarded-size words: one protecting the
//! block itself and one mirroring the size of the left neighbor. The pair
//! lets the non-blocking coalescing protocol lock a block and its
//! neighbors with plain CASes instead of a global lock. The words occupy
//! the first two `usize`s of the span and are preserved (never written)
//! while the span is in use, so in-use block headers simply reserve that
//! space.

use crate::sync::SpinMutex;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A word that holds either a lock state or the real size of a block.
///
/// Values in order: `LOCKED` < `COAL_BLOCK` < `LAST_REGION_BLOCK` < any
/// real size. Locking CASes a real size down to a lock state and returns
/// the size; releasing stores the size back with release ordering.
pub struct GuardedSize {
    value: AtomicUsize,
}

impl GuardedSize {
    /// Block is owned exclusively (allocated or being split).
    pub const LOCKED: usize = 0;
    /// Block is part of an in-flight coalesce operation.
    pub const COAL_BLOCK: usize = 1;
    pub const MAX_LOCKED_VAL: usize = Self::COAL_BLOCK;
    /// Sentinel marking the terminal block of a region.
    pub const LAST_REGION_BLOCK: usize = 2;
    pub const MAX_SPEC_VAL: usize = Self::LAST_REGION_BLOCK;

    pub fn init_locked(&self) {
        self.value.store(Self::LOCKED, Ordering::Release);
    }

    pub fn make_coalescing(&self) {
        debug_assert_eq!(self.value.load(Ordering::Relaxed), Self::LOCKED);
        self.value.store(Self::COAL_BLOCK, Ordering::Release);
    }

    /// Try to move a real size to the given lock state. Returns the value
    /// observed: a real size means the lock was taken, a special value
    /// means some other thread holds the block.
    pub fn try_lock(&self, state: usize) -> usize {
        debug_assert!(state <= Self::MAX_LOCKED_VAL);
        let mut sz = self.value.load(Ordering::Acquire);
        loop {
            if sz <= Self::MAX_LOCKED_VAL {
                break;
            }
            match self
                .value
                .compare_exchange(sz, state, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => sz = observed,
            }
        }
        sz
    }

    /// Publish the block as free with the given real size.
    pub fn unlock(&self, size: usize) {
        debug_assert!(self.value.load(Ordering::Relaxed) <= Self::MAX_LOCKED_VAL);
        debug_assert!(size > Self::MAX_LOCKED_VAL);
        self.value.store(size, Ordering::Release);
    }

    pub fn is_last_region_block(&self) -> bool {
        self.value.load(Ordering::Relaxed) == Self::LAST_REGION_BLOCK
    }

    #[cfg(debug_assertions)]
    pub(crate) fn raw(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }
}

/// Bin index of blocks that are not linked into any bin.
pub const NO_BIN: i32 = -1;

/// Header of a free span tracked by the backend. The guarded words must
/// stay the first two `usize`s of the span.
#[repr(C)]
pub struct FreeBlock {
    my_size: GuardedSize,
    left_size: GuardedSize,
    pub prev: *mut FreeBlock,
    pub next: *mut FreeBlock,
    /// Link used while the block sits in the delayed-coalesce queue.
    pub next_to_free: *mut FreeBlock,
    /// Block size while the block is in processing (locked, not in a bin).
    pub size_tmp: usize,
    /// Bin currently holding the block, or `NO_BIN`.
    pub my_bin: i32,
    pub slab_aligned: bool,
    pub in_bin: bool,
}

/// Smallest span the backend will track as a standalone block.
pub const MIN_BLOCK_SIZE: usize = core::mem::size_of::<FreeBlock>();

const _: () = assert!(MIN_BLOCK_SIZE > GuardedSize::MAX_SPEC_VAL);

/// All `FreeBlock` operations work on raw pointers: blocks live inside
/// mapped regions and their non-atomic fields are handed between threads
/// by the guarded-size protocol, never by Rust references.
impl FreeBlock {
    #[inline]
    pub unsafe fn right_neighbor(this: *mut FreeBlock, size: usize) -> *mut FreeBlock {
        debug_assert!(size > 0);
        (this as usize + size) as *mut FreeBlock
    }

    #[inline]
    pub unsafe fn left_neighbor(this: *mut FreeBlock, size: usize) -> *mut FreeBlock {
        debug_assert!(size > 0);
        (this as usize - size) as *mut FreeBlock
    }

    pub unsafe fn init_header(this: *mut FreeBlock) {
        unsafe {
            (*this).my_size.init_locked();
            (*this).left_size.init_locked();
        }
    }

    pub unsafe fn set_me_free(this: *mut FreeBlock, size: usize) {
        unsafe { (*this).my_size.unlock(size) };
    }

    pub unsafe fn try_set_me_used(this: *mut FreeBlock, state: usize) -> usize {
        unsafe { (*this).my_size.try_lock(state) }
    }

    pub unsafe fn is_last_region_block(this: *mut FreeBlock) -> bool {
        unsafe { (*this).my_size.is_last_region_block() }
    }

    pub unsafe fn set_left_free(this: *mut FreeBlock, size: usize) {
        unsafe { (*this).left_size.unlock(size) };
    }

    pub unsafe fn try_set_left_used(this: *mut FreeBlock, state: usize) -> usize {
        unsafe { (*this).left_size.try_lock(state) }
    }

    /// Lock the block and the mirror word of its right neighbor. Returns
    /// the block size, or 0 when the block could not be locked.
    pub unsafe fn try_lock_block(this: *mut FreeBlock) -> usize {
        unsafe {
            let sz = Self::try_set_me_used(this, GuardedSize::LOCKED);
            if sz <= GuardedSize::MAX_LOCKED_VAL {
                return 0;
            }
            let right = Self::right_neighbor(this, sz);
            let r_sz = Self::try_set_left_used(right, GuardedSize::LOCKED);
            if r_sz <= GuardedSize::MAX_LOCKED_VAL {
                Self::set_me_free(this, sz);
                return 0;
            }
            debug_assert_eq!(r_sz, sz);
            sz
        }
    }

    /// Mark the block (and the mirror of its right neighbor) as being
    /// coalesced. Both words must already be `LOCKED`.
    pub unsafe fn mark_coalescing(this: *mut FreeBlock, block_size: usize) {
        unsafe {
            (*this).my_size.make_coalescing();
            (*FreeBlock::right_neighbor(this, block_size))
                .left_size
                .make_coalescing();
            (*this).size_tmp = block_size;
            (*this).next_to_free = core::ptr::null_mut();
        }
    }

    /// Re-lock a block that sat in the coalesce queue; `size_tmp` holds
    /// its size.
    pub unsafe fn mark_used(this: *mut FreeBlock) {
        unsafe {
            (*this).my_size.init_locked();
            (*FreeBlock::right_neighbor(this, (*this).size_tmp))
                .left_size
                .init_locked();
            (*this).next_to_free = core::ptr::null_mut();
        }
    }

    /// Initialize headers of the 2nd..nth sub-blocks of a multi-block
    /// allocation so each can be returned individually later.
    pub unsafe fn mark_blocks(first: *mut FreeBlock, num: usize, size: usize) {
        let mut block = first;
        for _ in 1..num {
            block = (block as usize + size) as *mut FreeBlock;
            unsafe { FreeBlock::init_header(block) };
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn my_size_raw(&self) -> usize {
        self.my_size.raw()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn left_size_raw(&self) -> usize {
        self.left_size.raw()
    }
}

/// What one raw mapping is used for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RegionKind {
    /// The region holds only 16 KiB slab blocks.
    SlabBlocks = 0,
    /// The region can hold several large blocks.
    LargeBlocks,
    /// The region holds exactly one block of a requested size.
    OneBlock,
}

/// Header of one raw mapping. Lives at the start of the mapping itself.
#[repr(C)]
pub struct Region {
    pub next: *mut Region,
    pub prev: *mut Region,
    /// Bytes obtained from the raw source.
    pub alloc_size: usize,
    /// Initial (and maximal) size of the inner block.
    pub block_size: usize,
    pub kind: RegionKind,
}

/// Terminal block of every region; `my_size` reads `LAST_REGION_BLOCK`
/// and the extra field points back to the region header so that any
/// block can find its region by walking right.
#[repr(C)]
pub struct LastRegionBlock {
    pub block: FreeBlock,
    pub region: *mut Region,
}

const _: () = assert!(core::mem::size_of::<LastRegionBlock>() % core::mem::size_of::<usize>() == 0);

struct RegionHead(*mut Region);

// SAFETY: the raw head pointer is only touched under the SpinMutex; the
// regions themselves are plain memory owned by the pool.
unsafe impl Send for RegionHead {}

/// Doubly-linked list of a pool's regions, guarded by a mutex. Links are
/// only spliced here; region memory is owned by the pool.
pub struct RegionList {
    inner: SpinMutex<RegionHead>,
}

impl RegionList {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(RegionHead(core::ptr::null_mut())),
        }
    }

    pub unsafe fn add(&self, region: *mut Region) {
        let mut head = self.inner.lock();
        unsafe {
            (*region).prev = core::ptr::null_mut();
            (*region).next = head.0;
            if !head.0.is_null() {
                (*head.0).prev = region;
            }
        }
        head.0 = region;
    }

    pub unsafe fn remove(&self, region: *mut Region) {
        let mut head = self.inner.lock();
        unsafe {
            if head.0 == region {
                head.0 = (*region).next;
            }
            if !(*region).next.is_null() {
                (*(*region).next).prev = (*region).prev;
            }
            if !(*region).prev.is_null() {
                (*(*region).prev).next = (*region).next;
            }
        }
    }

    /// First region in the list. Walking from here without the lock is
    /// only valid when no other thread can touch the pool (reset and
    /// destroy paths).
    pub fn first(&self) -> *mut Region {
        self.inner.lock().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_size_lock_cycle() {
        let g = GuardedSize {
            value: AtomicUsize::new(4096),
        };
        // A real size can be locked exactly once.
        assert_eq!(g.try_lock(GuardedSize::LOCKED), 4096);
        assert_eq!(g.try_lock(GuardedSize::LOCKED), GuardedSize::LOCKED);
        g.unlock(8192);
        assert_eq!(g.try_lock(GuardedSize::COAL_BLOCK), 8192);
        assert_eq!(g.try_lock(GuardedSize::LOCKED), GuardedSize::COAL_BLOCK);
    }

    #[test]
    fn test_special_values_are_below_sizes() {
        assert!(GuardedSize::LOCKED < GuardedSize::COAL_BLOCK);
        assert!(GuardedSize::COAL_BLOCK < GuardedSize::LAST_REGION_BLOCK);
        assert!(MIN_BLOCK_SIZE > GuardedSize::MAX_SPEC_VAL);
    }

    #[test]
    fn test_region_list_add_remove() {
        let list = RegionList::new();
        let mut regions: [Region; 3] = unsafe { core::mem::zeroed() };
        let (a, b, c) = {
            let base = regions.as_mut_ptr();
            (base, unsafe { base.add(1) }, unsafe { base.add(2) })
        };
        unsafe {
            list.add(a);
            list.add(b);
            list.add(c);
            assert_eq!(list.first(), c);
            list.remove(b);
            assert_eq!(list.first(), c);
            assert_eq!((*c).next, a);
            assert_eq!((*a).prev, c);
            list.remove(c);
            assert_eq!(list.first(), a);
            list.remove(a);
            assert!(list.first().is_null());
        }
    }
}
