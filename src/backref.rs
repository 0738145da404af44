//! Back-references: a two-level table answering "is this pointer ours,
//! and which header owns it?".
//!
//! Every slab block and every large-object header carries a compact
//! [`BackRefIdx`] naming one slot in the table; the slot points back at
//! the block or header. `free`/`msize` on an arbitrary pointer first
//! look the suspected index up here — a mismatch means the pointer is
//! foreign. The table is global (shared by all pools) and only grows.
//!
//! Level 1 is one fixed main array; level 2 is a chain of 16 KiB leaves,
//! each a bump-down array of pointer slots with an intrusive free list.

use crate::backend::Backend;
use crate::config::SLAB_SIZE;
use crate::sync::SpinLock;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

#[cfg(target_pointer_width = "64")]
type MainIdx = u32;
#[cfg(target_pointer_width = "32")]
type MainIdx = u16;

const LARGE_OBJECT_BIT: u16 = 1 << 15;

/// Composite index `(main, offset, large_obj)` of one table slot.
///
/// Readers must tolerate observing the invalid value: a freshly
/// allocated header holds it for a moment, and "invalid" simply means
/// "not our pointer".
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BackRefIdx {
    main: MainIdx,
    /// Leaf slot in the low 15 bits, large-object flag in the top bit.
    off: u16,
}

impl BackRefIdx {
    pub const fn invalid() -> Self {
        Self {
            main: MainIdx::MAX,
            off: 0,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.main == MainIdx::MAX
    }

    pub fn is_large_object(&self) -> bool {
        self.off & LARGE_OBJECT_BIT != 0
    }

    fn main(&self) -> usize {
        self.main as usize
    }

    fn offset(&self) -> usize {
        (self.off & !LARGE_OBJECT_BIT) as usize
    }
}

const LEAF_BYTES: usize = SLAB_SIZE;

/// One level-2 leaf; the header sits at the start of its 16 KiB block
/// and the rest is pointer slots, filled from the far end downwards.
#[repr(C)]
struct BackRefLeaf {
    // First two words are preserved for the backend when the leaf comes
    // out of a backend block.
    guard: [usize; 2],
    /// Next leaf with free slots; links under the main lock.
    next_for_use: *mut BackRefLeaf,
    /// Bump pointer, moving from the last slot towards the header.
    bump: *mut AtomicUsize,
    /// Intrusive list of freed slots (each slot stores the next one).
    free_list: *mut AtomicUsize,
    /// Chain of leaves backed by raw mappings, for shutdown.
    next_raw: *mut BackRefLeaf,
    allocated: AtomicI32,
    my_num: usize,
    lock: SpinLock,
    /// Already linked into the for-use chain (guarded by the main lock).
    added_to_for_use: AtomicBool,
}

/// Slots per leaf.
const BR_MAX_CNT: usize =
    (LEAF_BYTES - core::mem::size_of::<BackRefLeaf>()) / core::mem::size_of::<usize>();

const _: () = assert!(BR_MAX_CNT < 1 << 15, "slot offset must fit in 15 bits");

#[cfg(target_pointer_width = "64")]
const MAIN_BYTES: usize = 256 * 1024;
#[cfg(target_pointer_width = "32")]
const MAIN_BYTES: usize = 8 * 1024;

/// Leaves co-allocated with the main array.
const INITIAL_LEAVES: usize = 4;
const MAIN_SPACE: usize = MAIN_BYTES + INITIAL_LEAVES * LEAF_BYTES;
/// Growth request; a multiple of the leaf size.
const LEAF_SPACE: usize = 64 * 1024;

const _: () = assert!(LEAF_SPACE % LEAF_BYTES == 0);

#[repr(C)]
struct BackRefMain {
    backend: *const Backend,
    /// Current allocation target.
    active: AtomicPtr<BackRefLeaf>,
    /// Chain of other leaves that still have free slots.
    list_for_use: AtomicPtr<BackRefLeaf>,
    all_raw_leaves: *mut BackRefLeaf,
    /// Highest initialized main index; published with release so slot
    /// lookups against it are safe.
    last_used: AtomicIsize,
    raw_mem_used: bool,
    request_space_lock: SpinLock,
    /// Really `DATA_SZ` entries; the main array extends to MAIN_BYTES.
    leaves: [AtomicPtr<BackRefLeaf>; 1],
}

/// Number of leaf pointers the main array can hold.
const DATA_SZ: usize =
    1 + (MAIN_BYTES - core::mem::size_of::<BackRefMain>()) / core::mem::size_of::<usize>();

static BACKREF_MAIN: AtomicPtr<BackRefMain> = AtomicPtr::new(ptr::null_mut());
static MAIN_LOCK: SpinLock = SpinLock::new();

unsafe fn main_entry(main: *mut BackRefMain, idx: usize) -> &'static AtomicPtr<BackRefLeaf> {
    unsafe { &*(&raw mut (*main).leaves[0]).add(idx) }
}

unsafe fn leaf_slot(leaf: *mut BackRefLeaf, offset: usize) -> *mut AtomicUsize {
    (leaf as usize
        + core::mem::size_of::<BackRefLeaf>()
        + offset * core::mem::size_of::<usize>()) as *mut AtomicUsize
}

/// Zero a leaf's slot area (backend blocks may carry old data).
unsafe fn zero_slots(leaf: *mut BackRefLeaf) {
    unsafe {
        ptr::write_bytes(
            (leaf as *mut u8).add(core::mem::size_of::<BackRefLeaf>()),
            0,
            LEAF_BYTES - core::mem::size_of::<BackRefLeaf>(),
        );
    }
}

/// Place a fresh leaf header and publish it in the main array.
unsafe fn init_empty_leaf(main: *mut BackRefMain, leaf: *mut BackRefLeaf) {
    unsafe {
        let next_lu = (*main).last_used.load(Ordering::Relaxed) + 1;
        debug_assert!((next_lu as usize) < DATA_SZ);
        ptr::write(
            leaf,
            BackRefLeaf {
                guard: [0; 2],
                next_for_use: ptr::null_mut(),
                bump: leaf_slot(leaf, BR_MAX_CNT - 1),
                free_list: ptr::null_mut(),
                next_raw: ptr::null_mut(),
                allocated: AtomicI32::new(0),
                my_num: next_lu as usize,
                lock: SpinLock::new(),
                added_to_for_use: AtomicBool::new(false),
            },
        );
        main_entry(main, next_lu as usize).store(leaf, Ordering::Relaxed);
        // Slot lookups check against last_used before dereferencing.
        (*main).last_used.store(next_lu, Ordering::Release);
    }
}

/// Chain a leaf into the for-use list. The main lock must be held
/// (or the table must still be private).
unsafe fn add_to_for_use_list(main: *mut BackRefMain, leaf: *mut BackRefLeaf) {
    unsafe {
        (*leaf).next_for_use = (*main).list_for_use.load(Ordering::Relaxed);
        (*main).list_for_use.store(leaf, Ordering::Relaxed);
        (*leaf).added_to_for_use.store(true, Ordering::Relaxed);
    }
}

/// Map the main array plus the first leaves. Called once, before the
/// allocator serves its first request.
pub(crate) unsafe fn init_backref_main(backend: &Backend) -> bool {
    let mut raw_mem_used = false;
    let main =
        unsafe { backend.get_backref_space(MAIN_SPACE, &mut raw_mem_used) } as *mut BackRefMain;
    if main.is_null() {
        return false;
    }
    unsafe {
        (*main).backend = backend;
        (*main).list_for_use.store(ptr::null_mut(), Ordering::Relaxed);
        (*main).all_raw_leaves = ptr::null_mut();
        (*main).raw_mem_used = raw_mem_used;
        (*main).last_used.store(-1, Ordering::Relaxed);
        for i in 0..INITIAL_LEAVES {
            let leaf = (main as usize + MAIN_BYTES + i * LEAF_BYTES) as *mut BackRefLeaf;
            zero_slots(leaf);
            init_empty_leaf(main, leaf);
            if i != 0 {
                add_to_for_use_list(main, leaf);
            } else {
                // The active leaf is not kept in the for-use chain.
                (*main).active.store(leaf, Ordering::Relaxed);
            }
        }
    }
    // Publish in a consistent state; get_backref reads this.
    BACKREF_MAIN.store(main, Ordering::Release);
    true
}

/// Best-effort teardown at process exit.
pub(crate) unsafe fn destroy_backref_main(backend: &Backend) {
    let main = BACKREF_MAIN.load(Ordering::Acquire);
    if main.is_null() {
        return;
    }
    unsafe {
        let mut curr = (*main).all_raw_leaves;
        while !curr.is_null() {
            let next = (*curr).next_raw;
            backend.put_backref_space(curr as *mut u8, LEAF_SPACE, true);
            curr = next;
        }
        backend.put_backref_space(main as *mut u8, MAIN_SPACE, (*main).raw_mem_used);
    }
    BACKREF_MAIN.store(ptr::null_mut(), Ordering::Release);
}

/// Map more leaves. Returns false when the main array is full or memory
/// is exhausted.
unsafe fn request_new_space(main: *mut BackRefMain) -> bool {
    unsafe {
        if DATA_SZ as isize <= (*main).last_used.load(Ordering::Relaxed) + 1 {
            return false; // no space left in the main array
        }
        // Only one thread at a time adds leaves.
        (*main).request_space_lock.lock();
        if !(*main).list_for_use.load(Ordering::Relaxed).is_null() {
            // Someone else already supplied leaves.
            (*main).request_space_lock.unlock();
            return true;
        }

        let mut raw_mem_used = false;
        let space = (*(*main).backend).get_backref_space(LEAF_SPACE, &mut raw_mem_used)
            as *mut BackRefLeaf;
        if space.is_null() {
            (*main).request_space_lock.unlock();
            return false;
        }

        // Touch the pages before taking the main lock.
        let mut leaf = space;
        while (leaf as usize) < space as usize + LEAF_SPACE {
            zero_slots(leaf);
            leaf = (leaf as usize + LEAF_BYTES) as *mut BackRefLeaf;
        }

        MAIN_LOCK.lock();
        let unused_idxs = DATA_SZ as isize - (*main).last_used.load(Ordering::Relaxed) - 1;
        if unused_idxs <= 0 {
            MAIN_LOCK.unlock();
            (*main).request_space_lock.unlock();
            (*(*main).backend).put_backref_space(space as *mut u8, LEAF_SPACE, raw_mem_used);
            return false;
        }
        // Part of the batch can go unused when main indices run out;
        // that underuse happens at most once over the table's life.
        let mut leaves_to_use = (unused_idxs as usize).min(LEAF_SPACE / LEAF_BYTES);

        if raw_mem_used {
            (*space).next_raw = (*main).all_raw_leaves;
            (*main).all_raw_leaves = space;
        }
        let mut leaf = space;
        while leaves_to_use > 0 {
            init_empty_leaf(main, leaf);
            let active = (*main).active.load(Ordering::Relaxed);
            if (*active).allocated.load(Ordering::Relaxed) == BR_MAX_CNT as i32 {
                (*main).active.store(leaf, Ordering::Release);
            } else {
                add_to_for_use_list(main, leaf);
            }
            leaf = (leaf as usize + LEAF_BYTES) as *mut BackRefLeaf;
            leaves_to_use -= 1;
        }
        MAIN_LOCK.unlock();
        (*main).request_space_lock.unlock();
        true
    }
}

/// Pick a leaf to allocate a slot from, growing the table if needed.
unsafe fn find_free_leaf(main: *mut BackRefMain) -> *mut BackRefLeaf {
    unsafe {
        let active = (*main).active.load(Ordering::Acquire);
        debug_assert!(!active.is_null());
        if (*active).allocated.load(Ordering::Relaxed) < BR_MAX_CNT as i32 {
            return active;
        }

        if !(*main).list_for_use.load(Ordering::Relaxed).is_null() {
            MAIN_LOCK.lock();
            let active = (*main).active.load(Ordering::Relaxed);
            if (*active).allocated.load(Ordering::Relaxed) == BR_MAX_CNT as i32 {
                let next = (*main).list_for_use.load(Ordering::Relaxed);
                if !next.is_null() {
                    (*main).active.store(next, Ordering::Release);
                    (*main).list_for_use.store((*next).next_for_use, Ordering::Relaxed);
                    debug_assert!((*next).added_to_for_use.load(Ordering::Relaxed));
                    (*next).added_to_for_use.store(false, Ordering::Relaxed);
                }
            }
            MAIN_LOCK.unlock();
        } else if !request_new_space(main) {
            return ptr::null_mut();
        }
        // Re-read: request_new_space may have installed a new active.
        (*main).active.load(Ordering::Acquire)
    }
}

/// Allocate one slot. Returns the invalid index when the table cannot
/// grow any further.
pub(crate) fn new_backref(large_obj: bool) -> BackRefIdx {
    let main = BACKREF_MAIN.load(Ordering::Acquire);
    debug_assert!(!main.is_null());

    unsafe {
        loop {
            let leaf = find_free_leaf(main);
            if leaf.is_null() {
                return BackRefIdx::invalid();
            }

            let mut to_use: *mut AtomicUsize = ptr::null_mut();
            let mut last_leaf_first_used = false;
            (*leaf).lock.lock();
            if !(*leaf).free_list.is_null() {
                to_use = (*leaf).free_list;
                (*leaf).free_list = (*to_use).load(Ordering::Relaxed) as *mut AtomicUsize;
            } else if (*leaf).allocated.load(Ordering::Relaxed) < BR_MAX_CNT as i32 {
                to_use = (*leaf).bump;
                (*leaf).bump = (*leaf).bump.sub(1);
                if (*leaf).allocated.load(Ordering::Relaxed) == BR_MAX_CNT as i32 - 1 {
                    (*leaf).bump = ptr::null_mut();
                }
            }
            if !to_use.is_null() {
                if (*leaf).allocated.load(Ordering::Relaxed) == 0
                    && (*main).list_for_use.load(Ordering::Relaxed).is_null()
                {
                    last_leaf_first_used = true;
                }
                (*leaf)
                    .allocated
                    .store((*leaf).allocated.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
            }
            (*leaf).lock.unlock();

            if to_use.is_null() {
                continue;
            }
            // First user of the last free leaf grows the table in
            // advance; failures are ignored here.
            if last_leaf_first_used {
                request_new_space(main);
            }

            let offset = (to_use as usize
                - (leaf as usize + core::mem::size_of::<BackRefLeaf>()))
                / core::mem::size_of::<usize>();
            debug_assert!(offset < BR_MAX_CNT);
            let mut off = offset as u16;
            if large_obj {
                off |= LARGE_OBJECT_BIT;
            }
            return BackRefIdx {
                main: (*leaf).my_num as MainIdx,
                off,
            };
        }
    }
}

/// Resolve an index to the pointer last stored for it, or null for
/// anything out of the table's current bounds.
pub(crate) fn get_backref(idx: BackRefIdx) -> *mut u8 {
    let main = BACKREF_MAIN.load(Ordering::Acquire);
    if main.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        if idx.main() as isize > (*main).last_used.load(Ordering::Acquire)
            || idx.offset() >= BR_MAX_CNT
        {
            return ptr::null_mut();
        }
        let leaf = main_entry(main, idx.main()).load(Ordering::Relaxed);
        (*leaf_slot(leaf, idx.offset())).load(Ordering::Relaxed) as *mut u8
    }
}

pub(crate) fn set_backref(idx: BackRefIdx, ptr_val: *mut u8) {
    let main = BACKREF_MAIN.load(Ordering::Acquire);
    unsafe {
        debug_assert!(
            idx.main() as isize <= (*main).last_used.load(Ordering::Relaxed)
                && idx.offset() < BR_MAX_CNT
        );
        let leaf = main_entry(main, idx.main()).load(Ordering::Relaxed);
        (*leaf_slot(leaf, idx.offset())).store(ptr_val as usize, Ordering::Relaxed);
    }
}

/// Free a slot, putting it on its leaf's free list.
pub(crate) fn remove_backref(idx: BackRefIdx) {
    debug_assert!(!idx.is_invalid());
    let main = BACKREF_MAIN.load(Ordering::Acquire);
    unsafe {
        debug_assert!(
            idx.main() as isize <= (*main).last_used.load(Ordering::Relaxed)
                && idx.offset() < BR_MAX_CNT
        );
        let leaf = main_entry(main, idx.main()).load(Ordering::Relaxed);
        let slot = leaf_slot(leaf, idx.offset());

        (*leaf).lock.lock();
        (*slot).store((*leaf).free_list as usize, Ordering::Relaxed);
        (*leaf).free_list = slot;
        (*leaf)
            .allocated
            .store((*leaf).allocated.load(Ordering::Relaxed) - 1, Ordering::Relaxed);
        (*leaf).lock.unlock();

        // A drained leaf becomes allocatable again.
        if !(*leaf).added_to_for_use.load(Ordering::Relaxed)
            && leaf != (*main).active.load(Ordering::Relaxed)
        {
            MAIN_LOCK.lock();
            if !(*leaf).added_to_for_use.load(Ordering::Relaxed)
                && leaf != (*main).active.load(Ordering::Relaxed)
            {
                add_to_for_use_list(main, leaf);
            }
            MAIN_LOCK.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_idx() {
        let idx = BackRefIdx::invalid();
        assert!(idx.is_invalid());
        assert!(!idx.is_large_object());
        // Looking up nonsense gives null, not a crash.
        assert!(get_backref(idx).is_null());
    }

    #[test]
    fn test_large_object_flag() {
        let idx = BackRefIdx {
            main: 3,
            off: 5 | LARGE_OBJECT_BIT,
        };
        assert!(idx.is_large_object());
        assert_eq!(idx.offset(), 5);
        assert_eq!(idx.main(), 3);
    }

    #[test]
    fn test_table_geometry() {
        // One leaf must address a useful number of blocks and fit the
        // 15-bit offset.
        assert!(BR_MAX_CNT > 1000);
        assert!(BR_MAX_CNT < 1 << 15);
        assert!(DATA_SZ > INITIAL_LEAVES);
        assert_eq!(MAIN_SPACE % LEAF_BYTES, 0);
    }
}
