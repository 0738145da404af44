//! Slab blocks and per-thread bins for small objects.
//!
//! A slab is a 16 KiB, 16 KiB-aligned block cut into equal-size objects.
//! The owner thread allocates from a private free list and a bump
//! pointer that walks down from the block's end; foreign threads free
//! into an atomic public free list that the owner privatizes on its next
//! miss. Slabs whose owner died are parked in per-size orphan lists
//! until some thread misses in that size class and adopts them.
//!
//! The slab header occupies two cache lines: fields the owner touches
//! are separated from fields foreign threads write to keep false sharing
//! off the hot path. The first two words belong to the backend's
//! guarded-size protocol and are never written while the slab is live.

use crate::backend::Backend;
use crate::backref::BackRefIdx;
use crate::config::{CACHE_LINE, SLAB_HEADER_SIZE, SLAB_SIZE};
use crate::platform;
use crate::pool::Pool;
use crate::size_class::{self, MAX_SEGREGATED_OBJECT_SIZE, NUM_SLAB_BINS};
use crate::sync::SpinLock;
use crate::tls::TlsData;
use crate::{align_down, is_aligned, stat_inc};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// An intrusive free list node living inside a freed object.
#[repr(C)]
pub struct FreeObject {
    pub next: *mut FreeObject,
}

/// Distinguished public-free-list / next-privatizable state: the slab is
/// orphan-ready and must not be used through this pointer.
pub const UNUSABLE: usize = 0x1;

#[inline]
pub fn is_solid_ptr(p: *mut FreeObject) -> bool {
    (UNUSABLE | p as usize) != UNUSABLE
}

#[inline]
pub fn is_not_for_use(p: usize) -> bool {
    p == UNUSABLE
}

/// `object_size` value marking slabs owned by the startup allocator.
pub const STARTUP_OBJECT_SIZE_MARK: u16 = u16::MAX;

/// A slab becomes usable again ("empty enough") when at least this
/// fraction of its body is free.
const EMPTY_ENOUGH_NUMERATOR: usize = 1;
const EMPTY_ENOUGH_DENOMINATOR: usize = 4;

const GLOBAL_FIELDS_PAD: usize = CACHE_LINE - 5 * core::mem::size_of::<usize>();

/// Header of one slab block.
#[repr(C)]
pub struct Slab {
    // -- preserved for the backend --
    guard: [usize; 2],
    // -- fields foreign threads write --
    public_free_list: AtomicPtr<FreeObject>,
    /// Owner's bin tag normally, a next-in-mailbox slab while queued for
    /// privatization, or `UNUSABLE` when orphan-ready.
    next_privatizable: AtomicUsize,
    pool: *mut Pool,
    _pad: [u8; GLOBAL_FIELDS_PAD],
    // -- owner-local fields --
    pub next: *mut Slab,
    pub previous: *mut Slab,
    pub(crate) bump_ptr: *mut FreeObject,
    free_list: *mut FreeObject,
    tls: AtomicPtr<TlsData>,
    owner_tid: AtomicUsize,
    pub backref: BackRefIdx,
    allocated_count: u16,
    object_size: u16,
    is_full: bool,
}

const _: () = assert!(core::mem::size_of::<Slab>() <= SLAB_HEADER_SIZE);
const _: () = assert!(SLAB_HEADER_SIZE == 2 * CACHE_LINE);

impl Slab {
    #[inline]
    pub unsafe fn containing(object: *const u8) -> *mut Slab {
        align_down(object as usize, SLAB_SIZE) as *mut Slab
    }

    pub unsafe fn pool(this: *mut Slab) -> *mut Pool {
        unsafe { (*this).pool }
    }

    pub unsafe fn set_pool(this: *mut Slab, pool: *mut Pool) {
        unsafe { (*this).pool = pool };
    }

    pub unsafe fn set_tls(this: *mut Slab, tls: *mut TlsData) {
        unsafe { (*this).tls.store(tls, Ordering::Relaxed) };
    }

    pub unsafe fn is_startup_slab(this: *mut Slab) -> bool {
        unsafe { (*this).object_size == STARTUP_OBJECT_SIZE_MARK }
    }

    /// Object size served by this slab; 0 for startup slabs.
    pub unsafe fn size(this: *mut Slab) -> usize {
        unsafe {
            if Slab::is_startup_slab(this) {
                0
            } else {
                (*this).object_size as usize
            }
        }
    }

    pub unsafe fn is_owned_by_current_thread(this: *mut Slab) -> bool {
        unsafe {
            !(*this).tls.load(Ordering::Relaxed).is_null()
                && (*this).owner_tid.load(Ordering::Relaxed) == platform::thread_id()
        }
    }

    unsafe fn mark_owned(this: *mut Slab, tls: *mut TlsData) {
        unsafe {
            debug_assert!((*this).tls.load(Ordering::Relaxed).is_null());
            (*this).owner_tid.store(platform::thread_id(), Ordering::Relaxed);
            (*this).tls.store(tls, Ordering::Relaxed);
        }
    }

    unsafe fn mark_orphaned(this: *mut Slab) {
        unsafe {
            debug_assert!(!(*this).tls.load(Ordering::Relaxed).is_null());
            (*this).tls.store(ptr::null_mut(), Ordering::Relaxed);
        }
    }

    pub unsafe fn empty(this: *mut Slab) -> bool {
        unsafe {
            if (*this).allocated_count > 0 {
                return false;
            }
            debug_assert!(!is_solid_ptr((*this).public_free_list.load(Ordering::Relaxed)));
            true
        }
    }

    /*--------------------------- allocation ---------------------------*/

    pub unsafe fn allocate_from_free_list(this: *mut Slab) -> *mut FreeObject {
        unsafe {
            let result = (*this).free_list;
            if result.is_null() {
                return ptr::null_mut();
            }
            (*this).free_list = (*result).next;
            debug_assert!(
                ((*this).allocated_count as usize)
                    < (SLAB_SIZE - SLAB_HEADER_SIZE) / (*this).object_size as usize
            );
            (*this).allocated_count += 1;
            result
        }
    }

    unsafe fn allocate_from_bump(this: *mut Slab) -> *mut FreeObject {
        unsafe {
            let result = (*this).bump_ptr;
            if !result.is_null() {
                let next = (result as usize) - (*this).object_size as usize;
                (*this).bump_ptr = if next < this as usize + core::mem::size_of::<Slab>() {
                    ptr::null_mut()
                } else {
                    next as *mut FreeObject
                };
                (*this).allocated_count += 1;
            }
            result
        }
    }

    /// Allocate one object, or mark the slab full and return null.
    pub unsafe fn allocate(this: *mut Slab) -> *mut FreeObject {
        unsafe {
            debug_assert!(Slab::is_owned_by_current_thread(this));
            // The free list first, for locality.
            let result = Slab::allocate_from_free_list(this);
            if !result.is_null() {
                return result;
            }
            let result = Slab::allocate_from_bump(this);
            if !result.is_null() {
                return result;
            }
            (*this).is_full = true;
            ptr::null_mut()
        }
    }

    /*---------------------------- freeing -----------------------------*/

    /// Find the start of the object containing `address`, which may be
    /// displaced by aligned allocation.
    unsafe fn find_allocated_object(this: *mut Slab, address: *const u8) -> *mut FreeObject {
        unsafe {
            // Distance from the end of the slab, folded to the offset
            // inside one object.
            let mut offset = this as usize + SLAB_SIZE - address as usize;
            debug_assert!(offset <= SLAB_SIZE - core::mem::size_of::<Slab>());
            offset %= (*this).object_size as usize;
            (address as usize - if offset != 0 {
                (*this).object_size as usize - offset
            } else {
                0
            }) as *mut FreeObject
        }
    }

    pub unsafe fn find_object_to_free(this: *mut Slab, object: *const u8) -> *mut FreeObject {
        unsafe {
            // Small objects cannot be displaced by aligned allocation.
            if (*this).object_size as usize <= MAX_SEGREGATED_OBJECT_SIZE {
                object as *mut FreeObject
            } else {
                Slab::find_allocated_object(this, object)
            }
        }
    }

    pub unsafe fn find_object_size(this: *mut Slab, object: *const u8) -> usize {
        unsafe {
            let block_size = Slab::size(this);
            if block_size == 0 {
                return crate::bootstrap::startup_msize(object);
            }
            // The object can be aligned up inside its slot.
            let size =
                block_size - (object as usize - Slab::find_object_to_free(this, object) as usize);
            debug_assert!(size > 0 && size < size_class::MIN_LARGE_OBJECT_SIZE);
            size
        }
    }

    /// Debug-only sanity checks against double free and corruption.
    pub unsafe fn check_free_precondition(this: *mut Slab, object: *const u8) {
        unsafe {
            debug_assert!(is_aligned(object as usize, core::mem::size_of::<usize>()));
            debug_assert!((*this).allocated_count > 0, "possible double free");
            debug_assert!(
                object as usize - this as usize >= core::mem::size_of::<Slab>(),
                "object points into the slab header"
            );
            if !Slab::is_startup_slab(this) {
                let to_free = Slab::find_object_to_free(this, object);
                debug_assert!(to_free != (*this).free_list, "possible double free");
                debug_assert!(
                    to_free as usize
                        != (*this).public_free_list.load(Ordering::Relaxed) as usize,
                    "possible double free from another thread"
                );
            }
        }
        let _ = (this, object);
    }

    /// Same-thread free: push onto the private free list, return the
    /// slab when it drains.
    pub unsafe fn free_own_object(this: *mut Slab, object: *mut u8) {
        unsafe {
            let tls = (*this).tls.load(Ordering::Relaxed);
            (*tls).mark_used();
            (*this).allocated_count -= 1;
            stat_inc!(own_frees);
            if Slab::empty(this) {
                // The last freed object cannot leave the slab full.
                debug_assert!(!(*this).is_full);
                (*tls)
                    .allocation_bin((*this).object_size as usize)
                    .process_empty_block(this, true);
            } else {
                let to_free = Slab::find_object_to_free(this, object);
                (*to_free).next = (*this).free_list;
                (*this).free_list = to_free;
                Slab::adjust_position_in_bin(this, None);
            }
        }
    }

    /// Foreign-thread free: push onto the public free list; the first
    /// push also mails the slab to its owner for privatization.
    pub unsafe fn free_public_object(this: *mut Slab, object: *mut FreeObject) {
        unsafe {
            stat_inc!(foreign_frees);
            let mut head = (*this).public_free_list.load(Ordering::Relaxed);
            let was_empty = loop {
                (*object).next = head;
                match (*this).public_free_list.compare_exchange(
                    head,
                    object,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(prev) => break prev.is_null(),
                    Err(observed) => head = observed,
                }
            };

            if was_empty {
                // We atomically took the list from null to non-null, so
                // we alone may look at next_privatizable: the owner can
                // only reset it after the slab went through the mailbox.
                let next = (*this).next_privatizable.load(Ordering::Acquire);
                if !is_not_for_use(next) {
                    debug_assert!(next != 0);
                    let bin = next as *const SlabBin;
                    (*bin).add_public_free_list_block(this);
                }
            }
        }
    }

    /// Take the public free list and splice it into the private one.
    /// With `reset` false the list is left `UNUSABLE` (orphan-ready).
    pub unsafe fn privatize_public_free_list(this: *mut Slab, reset: bool) {
        unsafe {
            // Only the owner may reset the list to null.
            debug_assert!(Slab::is_owned_by_current_thread(this) || !reset);
            let end_marker = if reset { 0 } else { UNUSABLE };
            let local = (*this)
                .public_free_list
                .swap(end_marker as *mut FreeObject, Ordering::AcqRel);
            debug_assert!(!local.is_null());

            if is_solid_ptr(local) {
                stat_inc!(privatizations);
                // Foreign frees did not touch the counter; settle it now.
                (*this).allocated_count -= 1;
                let mut tail = local;
                while is_solid_ptr((*tail).next) {
                    // The list ends with null or UNUSABLE.
                    tail = (*tail).next;
                    (*this).allocated_count -= 1;
                }
                (*tail).next = (*this).free_list;
                (*this).free_list = local;
            }
        }
    }

    /*------------------------ fullness tracking ------------------------*/

    /// Re-evaluate `is_full` after objects came back.
    unsafe fn adjust_fullness(this: *mut Slab) -> bool {
        unsafe {
            if !(*this).bump_ptr.is_null() {
                // Still bump-allocating: empty enough by definition.
                (*this).is_full = false;
            } else {
                let body = SLAB_SIZE - SLAB_HEADER_SIZE;
                let threshold =
                    body * (EMPTY_ENOUGH_DENOMINATOR - EMPTY_ENOUGH_NUMERATOR)
                        / EMPTY_ENOUGH_DENOMINATOR;
                // allocated_count still counts objects sitting in the
                // public free list; privatize first for best accuracy.
                (*this).is_full =
                    (*this).allocated_count as usize * (*this).object_size as usize > threshold;
            }
            (*this).is_full
        }
    }

    /// A block that was full but became empty enough moves to the front
    /// of its bin so it is found before fresh slabs.
    pub unsafe fn adjust_position_in_bin(this: *mut Slab, bin: Option<&SlabBin>) {
        unsafe {
            if (*this).is_full && !Slab::adjust_fullness(this) {
                match bin {
                    Some(bin) => bin.move_block_to_front(this),
                    None => {
                        let tls = (*this).tls.load(Ordering::Relaxed);
                        (*tls)
                            .allocation_bin((*this).object_size as usize)
                            .move_block_to_front(this);
                    }
                }
            }
        }
    }

    /// Restore the bump pointer of a drained block that stays in use.
    pub unsafe fn restore_bump_ptr(this: *mut Slab) {
        unsafe {
            debug_assert!((*this).allocated_count == 0);
            debug_assert!(!is_solid_ptr((*this).public_free_list.load(Ordering::Relaxed)));
            (*this).bump_ptr =
                (this as usize + SLAB_SIZE - (*this).object_size as usize) as *mut FreeObject;
            (*this).free_list = ptr::null_mut();
            (*this).is_full = false;
        }
    }

    /*------------------------ lifecycle helpers ------------------------*/

    unsafe fn clean_header(this: *mut Slab) {
        unsafe {
            (*this).next = ptr::null_mut();
            (*this).previous = ptr::null_mut();
            (*this).free_list = ptr::null_mut();
            (*this).allocated_count = 0;
            (*this).is_full = false;
            (*this).tls.store(ptr::null_mut(), Ordering::Relaxed);
            (*this).public_free_list.store(ptr::null_mut(), Ordering::Relaxed);
        }
    }

    /// Set up a fresh (or recycled) slab for an object size.
    pub unsafe fn init_empty(this: *mut Slab, tls: *mut TlsData, size: usize) {
        unsafe {
            let index = size_class::index(size);
            let object_size = size_class::object_size(size);

            Slab::clean_header(this);
            (*this).object_size = object_size as u16;
            Slab::mark_owned(this, tls);
            (*this).bump_ptr = (this as usize + SLAB_SIZE - object_size) as *mut FreeObject;

            // Everything except the bootstrap block (whose TLS does not
            // exist yet) points at its owner's bin.
            (*this).next_privatizable.store(
                if tls.is_null() {
                    0
                } else {
                    (*tls).allocation_bin_tag(index)
                },
                Ordering::Relaxed,
            );
        }
    }

    /// Strip the header before the slab goes back to a pool or backend.
    pub unsafe fn reset(this: *mut Slab) {
        unsafe {
            debug_assert!((*this).allocated_count == 0);
            debug_assert!(!is_solid_ptr((*this).public_free_list.load(Ordering::Relaxed)));
            Slab::clean_header(this);
            (*this).next_privatizable.store(0, Ordering::Relaxed);
            (*this).object_size = 0;
            (*this).bump_ptr = (this as usize + SLAB_SIZE) as *mut FreeObject;
        }
    }

    /*----------------------- bootstrap & startup -----------------------*/

    /// Bump one record off a bootstrap block. Bootstrap records are not
    /// counted; their slab lives until the pool resets.
    pub(crate) unsafe fn bump_one(this: *mut Slab) -> *mut FreeObject {
        unsafe {
            let result = (*this).bump_ptr;
            debug_assert!(!result.is_null());
            let next = result as usize - (*this).object_size as usize;
            (*this).bump_ptr = if next < this as usize + core::mem::size_of::<Slab>() {
                ptr::null_mut()
            } else {
                next as *mut FreeObject
            };
            result
        }
    }

    /// Set a fresh slab up for startup allocations: marked object size,
    /// bump pointer growing upwards from the header.
    pub(crate) unsafe fn init_startup(this: *mut Slab) {
        unsafe {
            Slab::clean_header(this);
            (*this).object_size = STARTUP_OBJECT_SIZE_MARK;
            (*this).next_privatizable.store(0, Ordering::Relaxed);
            (*this).bump_ptr =
                (this as usize + core::mem::size_of::<Slab>()) as *mut FreeObject;
        }
    }

    pub(crate) unsafe fn startup_available(this: *mut Slab) -> usize {
        unsafe { this as usize + SLAB_SIZE - (*this).bump_ptr as usize }
    }

    pub(crate) unsafe fn startup_bump(this: *mut Slab, req_size: usize) -> *mut u8 {
        unsafe {
            debug_assert!(Slab::startup_available(this) >= req_size);
            let result = (*this).bump_ptr as *mut u8;
            (*this).bump_ptr = (result as usize + req_size) as *mut FreeObject;
            (*this).allocated_count += 1;
            result
        }
    }

    /// Count one startup object released; true when the slab drained.
    pub(crate) unsafe fn startup_release_one(this: *mut Slab) -> bool {
        unsafe {
            debug_assert!((*this).allocated_count > 0);
            (*this).allocated_count -= 1;
            (*this).allocated_count == 0
        }
    }

    /*--------------------------- orphaning -----------------------------*/

    /// Adopt an orphaned slab into this thread's bin.
    pub unsafe fn privatize_orphaned(this: *mut Slab, tls: *mut TlsData, index: usize) {
        unsafe {
            (*this).next = ptr::null_mut();
            (*this).previous = ptr::null_mut();
            debug_assert!(!(*this).public_free_list.load(Ordering::Relaxed).is_null());
            // No race: nothing else owns the block right now.
            Slab::mark_owned(this, tls);
            debug_assert!(is_not_for_use(
                (*this).next_privatizable.load(Ordering::Relaxed)
            ));
            (*this)
                .next_privatizable
                .store((*tls).allocation_bin_tag(index), Ordering::Relaxed);
            // Required to move the public free list off UNUSABLE.
            Slab::privatize_public_free_list(this, true);
            if Slab::empty(this) {
                Slab::restore_bump_ptr(this);
            } else {
                Slab::adjust_fullness(this);
            }
            debug_assert!(!is_not_for_use(
                (*this).public_free_list.load(Ordering::Relaxed) as usize
            ));
        }
    }

    /// CAS the empty public free list to `UNUSABLE`. False means some
    /// foreign thread freed an object concurrently.
    unsafe fn ready_to_share(this: *mut Slab) -> bool {
        unsafe {
            (*this)
                .public_free_list
                .compare_exchange(
                    ptr::null_mut(),
                    UNUSABLE as *mut FreeObject,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
        }
    }

    /// Detach a non-empty slab from a dying thread.
    pub unsafe fn share_orphaned(this: *mut Slab, bin_tag: usize, _index: usize) {
        unsafe {
            debug_assert!(bin_tag != 0);
            Slab::mark_orphaned(this);
            if (*this).next_privatizable.load(Ordering::Relaxed) == bin_tag {
                // Not in the mailbox yet: force the public free list
                // non-null so no new thread queues the block, then wait
                // out any in-flight foreign free.
                if !Slab::ready_to_share(this) {
                    // The freeing thread just needs a chance to run; a
                    // bounded spin with yields is enough.
                    let mut count = 256;
                    while (*this).next_privatizable.load(Ordering::Relaxed) == bin_tag {
                        count -= 1;
                        if count == 0 {
                            platform::yield_now();
                            count = 256;
                        }
                    }
                }
            }
            debug_assert!(!(*this).public_free_list.load(Ordering::Relaxed).is_null());
            (*this).previous = ptr::null_mut();
            // The mailbox chain through next_privatizable, if any, is a
            // dying thread's private state at this point.
            (*this).next_privatizable.store(UNUSABLE, Ordering::Relaxed);
        }
    }
}

/*------------------------------- SlabBin --------------------------------*/

/// Per-thread bin for one size class: the active slab, a 2-linked list
/// of other owned slabs, and the mailbox of slabs awaiting
/// privatization.
pub struct SlabBin {
    active: UnsafeCell<*mut Slab>,
    mailbox: AtomicPtr<Slab>,
    mail_lock: SpinLock,
}

// SAFETY: `active` and the slab list are owner-thread-only; foreign
// threads only touch the mailbox, which has its own lock.
unsafe impl Sync for SlabBin {}

impl SlabBin {
    #[inline]
    pub fn active_block(&self) -> *mut Slab {
        unsafe { *self.active.get() }
    }

    pub unsafe fn set_active_block(&self, block: *mut Slab) {
        unsafe {
            debug_assert!(Slab::is_owned_by_current_thread(block));
            *self.active.get() = block;
        }
    }

    pub fn reset_active(&self) {
        unsafe { *self.active.get() = ptr::null_mut() };
    }

    /// The block before the active one is empty enough by construction;
    /// make it active.
    pub unsafe fn set_previous_block_active(&self) -> *mut Slab {
        unsafe {
            let active = *self.active.get();
            debug_assert!(!active.is_null());
            let previous = (*active).previous;
            if !previous.is_null() {
                debug_assert!(!(*previous).is_full);
                *self.active.get() = previous;
            }
            previous
        }
    }

    /// Add a block to the start of the bin list (just before active).
    pub unsafe fn push(&self, block: *mut Slab) {
        unsafe {
            debug_assert!(Slab::is_owned_by_current_thread(block));
            debug_assert!((*block).object_size != 0);
            debug_assert!((*block).next.is_null() && (*block).previous.is_null());

            let active = *self.active.get();
            (*block).next = active;
            if !active.is_null() {
                (*block).previous = (*active).previous;
                (*active).previous = block;
                if !(*block).previous.is_null() {
                    (*(*block).previous).next = block;
                }
            } else {
                *self.active.get() = block;
            }
        }
    }

    /// Take a block out of the bin list (e.g. before returning it).
    pub unsafe fn out_of_bin(&self, block: *mut Slab) {
        unsafe {
            debug_assert!(Slab::is_owned_by_current_thread(block));
            if block == *self.active.get() {
                *self.active.get() = if !(*block).previous.is_null() {
                    (*block).previous
                } else {
                    (*block).next
                };
            }
            if !(*block).previous.is_null() {
                (*(*block).previous).next = (*block).next;
            }
            if !(*block).next.is_null() {
                (*(*block).next).previous = (*block).previous;
            }
            (*block).next = ptr::null_mut();
            (*block).previous = ptr::null_mut();
        }
    }

    pub unsafe fn move_block_to_front(&self, block: *mut Slab) {
        unsafe {
            if block == *self.active.get() {
                return;
            }
            self.out_of_bin(block);
            self.push(block);
        }
    }

    /// Tag foreign threads use to find this bin through a slab.
    pub fn tag(&self) -> usize {
        self as *const SlabBin as usize
    }

    /// Mail a slab whose public free list just became non-empty.
    pub unsafe fn add_public_free_list_block(&self, block: *mut Slab) {
        self.mail_lock.lock();
        unsafe {
            (*block)
                .next_privatizable
                .store(self.mailbox.load(Ordering::Relaxed) as usize, Ordering::Relaxed);
            self.mailbox.store(block, Ordering::Relaxed);
        }
        self.mail_lock.unlock();
    }

    /// Pop one mailed slab and privatize its public free list.
    pub unsafe fn get_privatized_free_list_block(&self) -> *mut Slab {
        // Hot path: empty mailbox.
        if self.mailbox.load(Ordering::Acquire).is_null() {
            return ptr::null_mut();
        }
        self.mail_lock.lock();
        let block = self.mailbox.load(Ordering::Relaxed);
        unsafe {
            if !block.is_null() {
                debug_assert!(Slab::is_owned_by_current_thread(block));
                let next = (*block).next_privatizable.load(Ordering::Relaxed);
                debug_assert!(!is_not_for_use(next));
                self.mailbox.store(next as *mut Slab, Ordering::Relaxed);
                (*block).next_privatizable.store(self.tag(), Ordering::Relaxed);
            }
        }
        self.mail_lock.unlock();
        unsafe {
            if !block.is_null() {
                debug_assert!(is_solid_ptr(
                    (*block).public_free_list.load(Ordering::Relaxed)
                ));
                Slab::privatize_public_free_list(block, true);
                Slab::adjust_position_in_bin(block, Some(self));
            }
        }
        block
    }

    /// Drain the whole mailbox, returning emptied blocks to the pool.
    pub unsafe fn clean_public_free_lists(&self) -> bool {
        if self.mailbox.load(Ordering::Acquire).is_null() {
            return false;
        }
        self.mail_lock.lock();
        let mut block = self.mailbox.load(Ordering::Relaxed);
        self.mailbox.store(ptr::null_mut(), Ordering::Relaxed);
        self.mail_lock.unlock();

        let mut released = false;
        unsafe {
            while !block.is_null() {
                debug_assert!(Slab::is_owned_by_current_thread(block));
                let next = (*block).next_privatizable.load(Ordering::Relaxed) as *mut Slab;
                (*block).next_privatizable.store(self.tag(), Ordering::Relaxed);
                Slab::privatize_public_free_list(block, true);
                if Slab::empty(block) {
                    self.process_empty_block(block, false);
                    released = true;
                } else {
                    Slab::adjust_position_in_bin(block, Some(self));
                }
                block = next;
            }
        }
        released
    }

    /// Wait out any foreign thread still inside the mailbox before the
    /// bin's storage is released with its thread.
    pub fn sync_mailbox(&self) {
        self.mail_lock.lock();
        self.mail_lock.unlock();
    }

    /// An empty block either restores its bump pointer (if active) or
    /// leaves the bin for the per-thread pool / backend.
    pub unsafe fn process_empty_block(&self, block: *mut Slab, pool_the_block: bool) {
        unsafe {
            if block != *self.active.get() {
                self.out_of_bin(block);
                (*Slab::pool(block)).return_empty_slab(block, pool_the_block);
            } else {
                Slab::restore_bump_ptr(block);
            }
        }
    }
}

/*----------------------------- FreeSlabPool -----------------------------*/

use crate::config::{FREE_SLAB_POOL_HIGH_MARK, FREE_SLAB_POOL_LOW_MARK};

/// Per-thread pool of empty slabs: memory a thread just used is likely
/// still in its cache, so keep it local rather than share it.
pub struct FreeSlabPool {
    head: AtomicPtr<Slab>,
    size: UnsafeCell<isize>,
}

// SAFETY: `size` is owner-thread-only; foreign cleanup steals the whole
// list atomically through `head` and never looks at `size`.
unsafe impl Sync for FreeSlabPool {}

pub struct FreeSlabResult {
    pub block: *mut Slab,
    pub last_access_miss: bool,
}

impl FreeSlabPool {
    pub unsafe fn get_block(&self) -> FreeSlabResult {
        unsafe {
            let block = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
            if block.is_null() {
                FreeSlabResult {
                    block,
                    last_access_miss: true,
                }
            } else {
                *self.size.get() -= 1;
                self.head.store((*block).next, Ordering::Release);
                FreeSlabResult {
                    block,
                    last_access_miss: false,
                }
            }
        }
    }

    pub unsafe fn return_block(&self, pool: &Pool, block: *mut Slab) {
        unsafe {
            debug_assert!(*self.size.get() <= FREE_SLAB_POOL_HIGH_MARK as isize);
            let local_head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);

            if local_head.is_null() {
                // The list was stolen by an external cleanup.
                *self.size.get() = 0;
            } else if *self.size.get() == FREE_SLAB_POOL_HIGH_MARK as isize {
                // Overflow: keep the hot head, trim the cold tail back
                // to the backend.
                let mut last = local_head;
                for _ in 0..FREE_SLAB_POOL_LOW_MARK - 2 {
                    last = (*last).next;
                }
                let mut to_free = (*last).next;
                (*last).next = ptr::null_mut();
                *self.size.get() = FREE_SLAB_POOL_LOW_MARK as isize - 1;
                while !to_free.is_null() {
                    let next = (*to_free).next;
                    // Slab blocks in user pools carry no backrefs.
                    if !pool.user_pool() {
                        crate::backref::remove_backref((*to_free).backref);
                    }
                    pool.backend.put_slab_block(to_free as *mut u8);
                    to_free = next;
                }
            }
            *self.size.get() += 1;
            (*block).next = local_head;
            self.head.store(block, Ordering::Release);
        }
    }

    /// Steal and release everything; callable from any thread.
    pub unsafe fn external_cleanup(&self, pool: &Pool) -> bool {
        let mut released = false;
        unsafe {
            let mut block = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
            while !block.is_null() {
                let next = (*block).next;
                if !pool.user_pool() {
                    crate::backref::remove_backref((*block).backref);
                }
                pool.backend.put_slab_block(block as *mut u8);
                released = true;
                block = next;
            }
        }
        released
    }
}

/*----------------------------- OrphanedSlabs ----------------------------*/

/// Mutex-guarded LIFO of slabs; assumes zero initialization.
pub struct LifoList {
    top: AtomicPtr<Slab>,
    lock: SpinLock,
}

impl LifoList {
    pub unsafe fn push(&self, block: *mut Slab) {
        self.lock.lock();
        unsafe {
            (*block).next = self.top.load(Ordering::Relaxed);
            self.top.store(block, Ordering::Relaxed);
        }
        self.lock.unlock();
    }

    pub unsafe fn pop(&self) -> *mut Slab {
        let mut block = ptr::null_mut();
        if !self.top.load(Ordering::Relaxed).is_null() {
            self.lock.lock();
            block = self.top.load(Ordering::Relaxed);
            if !block.is_null() {
                unsafe { self.top.store((*block).next, Ordering::Relaxed) };
            }
            self.lock.unlock();
        }
        block
    }

    /// Take the whole list at once.
    pub unsafe fn grab(&self) -> *mut Slab {
        let mut block = ptr::null_mut();
        if !self.top.load(Ordering::Relaxed).is_null() {
            self.lock.lock();
            block = self.top.load(Ordering::Relaxed);
            self.top.store(ptr::null_mut(), Ordering::Relaxed);
            self.lock.unlock();
        }
        block
    }
}

/// Non-empty slabs whose owner thread died, by size class, waiting for
/// adoption by a thread that misses in that class.
pub struct OrphanedSlabs {
    bins: [LifoList; NUM_SLAB_BINS],
}

impl OrphanedSlabs {
    pub unsafe fn get(&self, tls: *mut TlsData, size: usize) -> *mut Slab {
        let index = size_class::index(size);
        let block = unsafe { self.bins[index].pop() };
        if !block.is_null() {
            stat_inc!(orphans_adopted);
            unsafe { Slab::privatize_orphaned(block, tls, index) };
        }
        block
    }

    pub unsafe fn put(&self, bin_tag: usize, block: *mut Slab) {
        unsafe {
            let index = size_class::index(Slab::size(block));
            Slab::share_orphaned(block, bin_tag, index);
            self.bins[index].push(block);
        }
    }

    pub fn reset(&self) {
        for bin in &self.bins {
            bin.top.store(ptr::null_mut(), Ordering::Relaxed);
        }
    }

    /// Privatize what foreign threads freed meanwhile and return any
    /// fully empty slabs to the backend.
    pub unsafe fn cleanup(&self, backend: &Backend) -> bool {
        let mut released = false;
        for bin in &self.bins {
            unsafe {
                let mut block = bin.grab();
                while !block.is_null() {
                    let next = (*block).next;
                    // Keep the list UNUSABLE-terminated for new sharers.
                    Slab::privatize_public_free_list(block, false);
                    if Slab::empty(block) {
                        Slab::reset(block);
                        if !backend.in_user_pool() {
                            crate::backref::remove_backref((*block).backref);
                        }
                        backend.put_slab_block(block as *mut u8);
                        released = true;
                    } else {
                        bin.push(block);
                    }
                    block = next;
                }
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fits_two_cache_lines() {
        assert!(core::mem::size_of::<Slab>() <= SLAB_HEADER_SIZE);
    }

    #[test]
    fn test_solid_ptr_predicate() {
        assert!(!is_solid_ptr(ptr::null_mut()));
        assert!(!is_solid_ptr(UNUSABLE as *mut FreeObject));
        assert!(is_solid_ptr(0x1000 as *mut FreeObject));
        assert!(is_not_for_use(UNUSABLE));
        assert!(!is_not_for_use(0));
    }

    #[test]
    fn test_containing_slab() {
        unsafe {
            let p = (5 * SLAB_SIZE + 1234) as *const u8;
            assert_eq!(Slab::containing(p), (5 * SLAB_SIZE) as *mut Slab);
            let q = (5 * SLAB_SIZE) as *const u8;
            assert_eq!(Slab::containing(q), (5 * SLAB_SIZE) as *mut Slab);
        }
    }
}
