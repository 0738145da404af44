//! Windows virtual memory implementation using VirtualAlloc/VirtualFree.
//!
//! Huge (large) pages and remapping are not provided here; callers fall
//! back to regular mappings and allocate-and-copy.

use super::{HugePageInfo, PageKind};
use core::ffi::c_void;
use core::ptr;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_READWRITE: u32 = 0x04;

// Windows allocation granularity (VirtualAlloc regions).
const GRANULARITY: usize = 64 * 1024;

unsafe extern "system" {
    fn VirtualAlloc(addr: *mut c_void, size: usize, alloc_type: u32, protect: u32) -> *mut c_void;
    fn VirtualFree(addr: *mut c_void, size: usize, free_type: u32) -> i32;
    fn GetCurrentThreadId() -> u32;
    fn SwitchToThread() -> i32;
}

pub unsafe fn map_memory(size: usize, _kind: PageKind) -> *mut u8 {
    let ptr = unsafe {
        VirtualAlloc(
            ptr::null_mut(),
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    ptr as *mut u8
}

pub unsafe fn unmap_memory(ptr: *mut u8, _size: usize) -> bool {
    unsafe { VirtualFree(ptr as *mut c_void, 0, MEM_RELEASE) != 0 }
}

pub unsafe fn remap_memory(_ptr: *mut u8, _old_size: usize, _new_size: usize) -> *mut u8 {
    ptr::null_mut()
}

pub fn allocation_granularity() -> usize {
    GRANULARITY
}

pub fn probe_huge_pages() -> HugePageInfo {
    HugePageInfo::default()
}

#[inline]
pub fn thread_id() -> usize {
    unsafe { GetCurrentThreadId() as usize }
}

#[inline]
pub fn yield_now() {
    unsafe {
        SwitchToThread();
    }
}

#[inline]
pub fn set_errno(_err: i32) {}

pub fn env_bytes<T>(_name: &core::ffi::CStr, _f: impl FnOnce(&[u8]) -> T) -> Option<T> {
    None
}
