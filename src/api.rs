//! Public allocation API over the default pool, the configuration
//! surface, and the `GlobalAlloc` adapter.

use crate::platform::{self, EINVAL, ENOMEM};
use crate::pool::{
    self, allocate_aligned, default_pool, internal_free, internal_malloc, internal_msize,
    is_recognized, realloc_aligned,
};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// Allocate `size` bytes, at least word-aligned (cache-line-aligned for
/// large objects). `size` 0 behaves as the smallest allocation. Null on
/// exhaustion, with `errno` set to `ENOMEM`.
pub fn malloc(size: usize) -> *mut u8 {
    let result = unsafe { internal_malloc(size) };
    if result.is_null() {
        platform::set_errno(ENOMEM);
    }
    result
}

/// Free an allocation of the default pool. Null is a no-op.
///
/// # Safety
/// `object` must come from this allocator's default pool and must not
/// be freed twice.
pub unsafe fn free(object: *mut u8) {
    unsafe { internal_free(object) };
}

/// Free only if the pointer is recognized as ours; foreign pointers are
/// reported back to the caller instead of being touched.
///
/// # Safety
/// `object` must be a valid allocation of *some* allocator (or null).
pub unsafe fn free_if_recognized(object: *mut u8) -> bool {
    if object.is_null() {
        return true;
    }
    unsafe {
        if is_recognized(object) {
            internal_free(object);
            true
        } else {
            false
        }
    }
}

/// Grow or shrink an allocation. Null `object` allocates; `size` 0
/// frees and returns null.
///
/// # Safety
/// `object` must come from the default pool (or be null).
pub unsafe fn realloc(object: *mut u8, size: usize) -> *mut u8 {
    unsafe {
        if object.is_null() {
            return malloc(size);
        }
        if size == 0 {
            internal_free(object);
            return ptr::null_mut();
        }
        let result = match default_pool() {
            Some(p) => realloc_aligned(p, object, size, 0),
            None => ptr::null_mut(),
        };
        if result.is_null() {
            platform::set_errno(ENOMEM);
        }
        result
    }
}

/// Overflow-checked, zero-initialized array allocation.
pub fn calloc(nobj: usize, size: usize) -> *mut u8 {
    // Square root of the address space: products of two smaller factors
    // cannot overflow, so the division runs only for suspect inputs.
    let mult_not_overflow = 1usize << (usize::BITS / 2);
    let array_size = nobj.wrapping_mul(size);
    if (nobj >= mult_not_overflow || size >= mult_not_overflow)
        && nobj != 0
        && array_size / nobj != size
    {
        platform::set_errno(ENOMEM);
        return ptr::null_mut();
    }
    let result = unsafe { internal_malloc(array_size) };
    match result.is_null() {
        true => platform::set_errno(ENOMEM),
        false => unsafe { ptr::write_bytes(result, 0, array_size) },
    }
    result
}

/// Aligned allocation; `alignment` must be a power of two and `size`
/// non-zero, else `EINVAL`.
pub fn aligned_malloc(size: usize, alignment: usize) -> *mut u8 {
    if !alignment.is_power_of_two() || size == 0 {
        platform::set_errno(EINVAL);
        return ptr::null_mut();
    }
    let result = match default_pool() {
        Some(p) => unsafe { allocate_aligned(p, size, alignment) },
        None => ptr::null_mut(),
    };
    if result.is_null() {
        platform::set_errno(ENOMEM);
    }
    result
}

/// Aligned analog of [`realloc`].
///
/// # Safety
/// `object` must come from the default pool (or be null).
pub unsafe fn aligned_realloc(object: *mut u8, size: usize, alignment: usize) -> *mut u8 {
    if !alignment.is_power_of_two() {
        platform::set_errno(EINVAL);
        return ptr::null_mut();
    }
    unsafe {
        if object.is_null() {
            return aligned_malloc(size, alignment);
        }
        if size == 0 {
            internal_free(object);
            return ptr::null_mut();
        }
        let result = match default_pool() {
            Some(p) => realloc_aligned(p, object, size, alignment),
            None => ptr::null_mut(),
        };
        if result.is_null() {
            platform::set_errno(ENOMEM);
        }
        result
    }
}

/// POSIX-style aligned allocation: alignment must be a power of two and
/// at least pointer-sized. Returns 0, `EINVAL` or `ENOMEM`.
pub fn posix_memalign(memptr: &mut *mut u8, alignment: usize, size: usize) -> i32 {
    if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
        return EINVAL;
    }
    let result = match default_pool() {
        Some(p) => unsafe { allocate_aligned(p, size, alignment) },
        None => ptr::null_mut(),
    };
    if result.is_null() {
        return ENOMEM;
    }
    *memptr = result;
    0
}

/// Usable size of an allocation. Null gives 0 and `EINVAL`.
///
/// # Safety
/// `object` must come from the default pool or be null.
pub unsafe fn msize(object: *mut u8) -> usize {
    if object.is_null() {
        platform::set_errno(EINVAL);
        // 0 is less likely to cause trouble than a huge bogus size.
        return 0;
    }
    unsafe {
        debug_assert!(is_recognized(object), "msize of a foreign pointer");
        internal_msize(object)
    }
}

/// Like [`msize`], but foreign pointers report `None` instead of being
/// dereferenced blindly.
///
/// # Safety
/// `object` must be a valid allocation of *some* allocator (or null).
pub unsafe fn msize_if_recognized(object: *mut u8) -> Option<usize> {
    if object.is_null() {
        return None;
    }
    unsafe {
        if is_recognized(object) {
            Some(internal_msize(object))
        } else {
            None
        }
    }
}

/*----------------------------- configuration ----------------------------*/

/// Result of a configuration or cleanup request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommandStatus {
    Ok,
    InvalidParam,
    /// Valid request with nothing to act on (e.g. no cached memory).
    NoEffect,
}

/// Runtime-adjustable allocator behavior.
#[derive(Clone, Copy, Debug)]
pub enum AllocationMode {
    /// Try to keep OS consumption at or below this many bytes; 0 lifts
    /// the limit.
    SoftHeapLimit(usize),
    /// Request (or stop requesting) huge page backing for new regions.
    UseHugePages(bool),
    /// Sizes at or above this bypass regular large-cache cleanup.
    HugeSizeThreshold(usize),
}

pub fn set_allocation_mode(mode: AllocationMode) -> CommandStatus {
    let Some(p) = default_pool() else {
        return CommandStatus::NoEffect;
    };
    match mode {
        AllocationMode::SoftHeapLimit(limit) => {
            p.backend.set_soft_limit(limit);
            CommandStatus::Ok
        }
        AllocationMode::UseHugePages(on) => {
            if cfg!(target_os = "linux") {
                crate::backend::HUGE_PAGES.set_mode(on);
                CommandStatus::Ok
            } else {
                CommandStatus::NoEffect
            }
        }
        AllocationMode::HugeSizeThreshold(bytes) => {
            p.loc.set_huge_size_threshold(bytes);
            CommandStatus::Ok
        }
    }
}

/// Explicit cache release requests.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CleanupCommand {
    /// Drop the calling thread's cached slabs and large blocks.
    CleanThreadBuffers,
    /// Drop every cache of the default pool.
    CleanAllBuffers,
}

pub fn allocation_command(command: CleanupCommand) -> CommandStatus {
    let Some(p) = default_pool() else {
        return CommandStatus::NoEffect;
    };
    let released = match command {
        CleanupCommand::CleanThreadBuffers => {
            let tls = p.get_tls(false);
            if tls.is_null() {
                false
            } else {
                unsafe { (*tls).external_cleanup(false, true) }
            }
        }
        CleanupCommand::CleanAllBuffers => p.hard_caches_cleanup(),
    };
    if released { CommandStatus::Ok } else { CommandStatus::NoEffect }
}

/*------------------------------ GlobalAlloc -----------------------------*/

/// Scalable concurrent allocator for Rust programs.
///
/// Register with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: scmalloc::ScMalloc = scmalloc::ScMalloc;
/// ```
pub struct ScMalloc;

unsafe impl GlobalAlloc for ScMalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        unsafe {
            if layout.align() <= core::mem::size_of::<usize>() {
                internal_malloc(size)
            } else if crate::bootstrap::RecursionGuard::same_thread_active() {
                // Nested allocation during initialization: the pool
                // structures exist but its TLS is not usable yet.
                let pool = &*crate::pool::default_pool_raw();
                pool.malloc_large(
                    ptr::null_mut(),
                    size,
                    layout.align().max(crate::config::SLAB_SIZE),
                )
            } else {
                match default_pool() {
                    Some(p) => allocate_aligned(p, size, layout.align()),
                    None => ptr::null_mut(),
                }
            }
        }
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        unsafe { internal_free(ptr_in) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let result = unsafe { self.alloc(layout) };
        if !result.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(result, 0, layout.size()) };
        }
        result
    }

    unsafe fn realloc(&self, ptr_in: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe {
            if ptr_in.is_null() || layout.size() == 0 {
                let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
                return self.alloc(new_layout);
            }
            if new_size == 0 {
                self.dealloc(ptr_in, layout);
                return layout.align() as *mut u8;
            }
            let alignment = if layout.align() <= core::mem::size_of::<usize>() {
                0
            } else {
                layout.align()
            };
            match default_pool() {
                Some(p) => realloc_aligned(p, ptr_in, new_size, alignment),
                None => ptr::null_mut(),
            }
        }
    }
}

/// Best-effort release of everything at process exit. Allocations made
/// after this call re-enter through normal paths.
pub fn process_shutdown() {
    pool::process_shutdown_notification();
}

/// Bytes the default pool currently holds from the OS (mapped regions,
/// including cached and free memory).
pub fn reserved_bytes() -> usize {
    match default_pool() {
        Some(p) => p.total_mem_size(),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    #[test]
    fn test_malloc_free_roundtrip() {
        unsafe {
            let p = malloc(24);
            assert!(!p.is_null());
            // The slab hands out the full class size.
            assert_eq!(msize(p), 32);
            free(p);
            // The freed object comes straight back from the free list.
            let q = malloc(24);
            assert_eq!(q, p);
            free(q);
        }
    }

    #[test]
    fn test_malloc_zero() {
        unsafe {
            let p = malloc(0);
            assert!(!p.is_null());
            assert!(msize(p) >= core::mem::size_of::<usize>());
            free(p);
        }
    }

    #[test]
    fn test_calloc_zeroes() {
        unsafe {
            let p = calloc(100, 7);
            assert!(!p.is_null());
            for i in 0..700 {
                assert_eq!(*p.add(i), 0);
            }
            free(p);
        }
    }

    #[test]
    fn test_calloc_overflow() {
        let p = calloc(usize::MAX / 2, 4);
        assert!(p.is_null());
    }

    #[test]
    fn test_aligned_malloc_invalid_alignment() {
        assert!(aligned_malloc(64, 24).is_null());
        assert!(aligned_malloc(0, 64).is_null());
    }

    #[test]
    fn test_aligned_malloc_variants() {
        unsafe {
            for align in [8usize, 16, 64, 256, 4096, 32 * 1024] {
                for size in [1usize, 24, 500, 2000, 9000, 200_000] {
                    let p = aligned_malloc(size, align);
                    assert!(!p.is_null(), "size {} align {}", size, align);
                    assert_eq!(p as usize % align, 0);
                    core::ptr::write_bytes(p, 0xC7, size);
                    free(p);
                }
            }
        }
    }

    #[test]
    fn test_posix_memalign_contract() {
        let mut p: *mut u8 = ptr::null_mut();
        assert_eq!(posix_memalign(&mut p, 2, 100), EINVAL);
        assert_eq!(posix_memalign(&mut p, 48, 100), EINVAL);
        assert_eq!(posix_memalign(&mut p, 64, 100), 0);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        unsafe { free(p) };
    }

    #[test]
    fn test_realloc_semantics() {
        unsafe {
            // Null object allocates.
            let p = realloc(ptr::null_mut(), 100);
            assert!(!p.is_null());
            // Shrink keeps the pointer.
            let q = realloc(p, 10);
            assert_eq!(q, p);
            // Growing copies the payload.
            ptr::write_bytes(q, 0x5A, 10);
            let r = realloc(q, 50_000);
            assert!(!r.is_null());
            for i in 0..10 {
                assert_eq!(*r.add(i), 0x5A);
            }
            // Size 0 frees.
            assert!(realloc(r, 0).is_null());
        }
    }

    #[test]
    fn test_realloc_keeps_pointer_at_same_usable_size() {
        unsafe {
            let p = malloc(1000);
            let usable = msize(p);
            let q = realloc(p, usable);
            assert_eq!(q, p);
            free(q);
        }
    }

    #[test]
    fn test_msize_null() {
        unsafe {
            assert_eq!(msize(ptr::null_mut()), 0);
        }
    }

    #[test]
    fn test_free_if_recognized_rejects_foreign() {
        unsafe {
            let our = malloc(64);
            assert!(free_if_recognized(our));

            let foreign = Box::into_raw(Box::new([0u8; 64])) as *mut u8;
            assert!(!free_if_recognized(foreign));
            drop(Box::from_raw(foreign as *mut [u8; 64]));
        }
    }

    #[test]
    fn test_large_allocation_roundtrip() {
        unsafe {
            let size = 100 * 1024;
            let p1 = malloc(size);
            assert!(!p1.is_null());
            assert_eq!(msize(p1), size);
            ptr::write_bytes(p1, 0xEE, size);
            free(p1);
            // Exact-fit cache returns the same block.
            let p2 = malloc(size);
            assert_eq!(p2, p1);
            free(p2);
        }
    }

    #[test]
    fn test_allocation_modes() {
        assert_eq!(
            set_allocation_mode(AllocationMode::HugeSizeThreshold(32 * 1024 * 1024)),
            CommandStatus::Ok
        );
        assert_eq!(
            set_allocation_mode(AllocationMode::SoftHeapLimit(0)),
            CommandStatus::Ok
        );
    }

    #[test]
    fn test_cleanup_commands() {
        unsafe {
            // Populate the thread's caches, then ask for their release.
            let mut ptrs = [ptr::null_mut(); 64];
            for p in ptrs.iter_mut() {
                *p = malloc(128);
            }
            for p in ptrs {
                free(p);
            }
        }
        // Either something was cached and released, or there was
        // nothing to do; both are legal outcomes here.
        let status = allocation_command(CleanupCommand::CleanThreadBuffers);
        assert!(status == CommandStatus::Ok || status == CommandStatus::NoEffect);
    }
}
