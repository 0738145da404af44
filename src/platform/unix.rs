//! Unix virtual memory and process services through libc.

use super::{HugePageInfo, PageKind};
use core::ffi::CStr;
use core::ptr;

pub unsafe fn map_memory(size: usize, kind: PageKind) -> *mut u8 {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    #[cfg(target_os = "linux")]
    if kind == PageKind::PreallocatedHuge {
        flags |= libc::MAP_HUGETLB;
    }
    #[cfg(not(target_os = "linux"))]
    if kind == PageKind::PreallocatedHuge {
        return ptr::null_mut();
    }

    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return ptr::null_mut();
    }

    #[cfg(target_os = "linux")]
    if kind == PageKind::TransparentHuge {
        // Best effort; the mapping is usable either way.
        unsafe { libc::madvise(raw, size, libc::MADV_HUGEPAGE) };
    }

    raw as *mut u8
}

pub unsafe fn unmap_memory(ptr: *mut u8, size: usize) -> bool {
    unsafe { libc::munmap(ptr as *mut libc::c_void, size) == 0 }
}

#[cfg(target_os = "linux")]
pub unsafe fn remap_memory(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    let res = unsafe {
        libc::mremap(
            ptr as *mut libc::c_void,
            old_size,
            new_size,
            libc::MREMAP_MAYMOVE,
        )
    };
    if res == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        res as *mut u8
    }
}

#[cfg(not(target_os = "linux"))]
pub unsafe fn remap_memory(_ptr: *mut u8, _old_size: usize, _new_size: usize) -> *mut u8 {
    ptr::null_mut()
}

pub fn allocation_granularity() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as usize } else { 4096 }
}

/// Read a whole file into `buf` without allocating. Returns bytes read.
#[cfg(target_os = "linux")]
fn read_file(path: &CStr, buf: &mut [u8]) -> usize {
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDONLY);
        if fd < 0 {
            return 0;
        }
        let mut total = 0usize;
        while total < buf.len() {
            let n = libc::read(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - total,
            );
            if n <= 0 {
                break;
            }
            total += n as usize;
        }
        libc::close(fd);
        total
    }
}

#[cfg(target_os = "linux")]
pub fn probe_huge_pages() -> HugePageInfo {
    use super::parse_value_after;

    let mut info = HugePageInfo::default();
    let mut buf = [0u8; 4096];

    let n = read_file(c"/proc/meminfo", &mut buf);
    let meminfo = &buf[..n];
    // Hugepagesize is reported in KiB.
    if let Some(kb) = parse_value_after(meminfo, b"Hugepagesize:") {
        info.page_size = kb * 1024;
    }
    let mut total = parse_value_after(meminfo, b"HugePages_Total:").unwrap_or(0);
    if total == 0 {
        let mut small = [0u8; 64];
        let n = read_file(c"/proc/sys/vm/nr_hugepages", &mut small);
        total = super::parse_usize(&small[..n]).unwrap_or(0);
    }
    info.preallocated = info.page_size != 0 && total > 0;

    let n = read_file(c"/sys/kernel/mm/transparent_hugepage/enabled", &mut buf);
    let thp = &buf[..n];
    info.transparent =
        info.page_size != 0 && thp.windows(8).any(|w| w == b"[always]");

    info
}

#[cfg(not(target_os = "linux"))]
pub fn probe_huge_pages() -> HugePageInfo {
    HugePageInfo::default()
}

#[inline]
pub fn thread_id() -> usize {
    unsafe { libc::pthread_self() as usize }
}

#[inline]
pub fn yield_now() {
    unsafe {
        libc::sched_yield();
    }
}

#[inline]
pub fn set_errno(err: i32) {
    unsafe {
        #[cfg(target_os = "linux")]
        {
            *libc::__errno_location() = err;
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            *libc::__error() = err;
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
        {
            let _ = err;
        }
    }
}

pub fn env_bytes<T>(name: &CStr, f: impl FnOnce(&[u8]) -> T) -> Option<T> {
    unsafe {
        let val = libc::getenv(name.as_ptr());
        if val.is_null() {
            return None;
        }
        Some(f(CStr::from_ptr(val).to_bytes()))
    }
}
