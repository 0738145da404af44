//! OS abstraction: virtual memory mapping, huge page probing, thread
//! identity, errno and environment access.
//!
//! Everything here must be callable from inside an allocation path, so
//! nothing may allocate: file probing reads into fixed stack buffers and
//! string handling works on byte slices.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as imp;
#[cfg(windows)]
use windows as imp;

/// Kind of pages to request from the OS for one region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    /// Default pages at the platform granularity.
    Regular,
    /// Preallocated huge pages (`MAP_HUGETLB` pool on Linux).
    PreallocatedHuge,
    /// Transparent huge pages, advised after a regular mapping.
    TransparentHuge,
}

/// What the OS reports about huge page support.
#[derive(Clone, Copy, Default, Debug)]
pub struct HugePageInfo {
    /// System huge page size in bytes; 0 when unknown.
    pub page_size: usize,
    /// Preallocated huge pages exist.
    pub preallocated: bool,
    /// Transparent huge pages are enabled system-wide.
    pub transparent: bool,
}

/// Map `size` bytes of zero-initialized memory. Returns null on failure.
///
/// # Safety
/// The caller must eventually pass the pointer and the same `size` to
/// [`unmap_memory`].
#[inline]
pub unsafe fn map_memory(size: usize, kind: PageKind) -> *mut u8 {
    unsafe { imp::map_memory(size, kind) }
}

/// Unmap memory previously returned by [`map_memory`].
///
/// # Safety
/// `ptr`/`size` must denote exactly one prior mapping.
#[inline]
pub unsafe fn unmap_memory(ptr: *mut u8, size: usize) -> bool {
    unsafe { imp::unmap_memory(ptr, size) }
}

/// Grow or shrink a mapping in place or by moving it (Linux `mremap`).
/// Returns null when the platform cannot remap; callers fall back to
/// allocate-and-copy.
///
/// # Safety
/// `ptr` must be the start of a mapping of `old_size` bytes.
#[inline]
pub unsafe fn remap_memory(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    unsafe { imp::remap_memory(ptr, old_size, new_size) }
}

/// Mapping granularity of the platform (page size, or 64 KiB on Windows).
#[inline]
pub fn allocation_granularity() -> usize {
    imp::allocation_granularity()
}

/// Probe the OS for huge page availability. Called once at startup.
pub fn probe_huge_pages() -> HugePageInfo {
    imp::probe_huge_pages()
}

/// Identifier of the calling thread, unique among live threads.
#[inline]
pub fn thread_id() -> usize {
    imp::thread_id()
}

/// Give up the rest of the time slice.
#[inline]
pub fn yield_now() {
    imp::yield_now()
}

pub const ENOMEM: i32 = 12;
pub const EINVAL: i32 = 22;

/// Store into the calling thread's `errno`.
#[inline]
pub fn set_errno(err: i32) {
    imp::set_errno(err)
}

/// Read an environment variable as an unsigned integer.
pub fn env_usize(name: &core::ffi::CStr) -> Option<usize> {
    imp::env_bytes(name, |bytes| parse_usize(bytes))?
}

/// True when an environment variable is set to exactly `"1"`.
pub fn env_flag(name: &core::ffi::CStr) -> Option<bool> {
    imp::env_bytes(name, |bytes| Some(bytes == b"1"))?
}

/// Parse leading decimal digits from a byte slice.
pub(crate) fn parse_usize(bytes: &[u8]) -> Option<usize> {
    let mut val: usize = 0;
    let mut seen = false;
    for &b in bytes {
        if b.is_ascii_digit() {
            val = val.checked_mul(10)?.checked_add((b - b'0') as usize)?;
            seen = true;
        } else {
            break;
        }
    }
    seen.then_some(val)
}

/// Find `key` in `buf` and parse the first decimal number after it.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_value_after(buf: &[u8], key: &[u8]) -> Option<usize> {
    let pos = buf.windows(key.len()).position(|w| w == key)?;
    let rest = &buf[pos + key.len()..];
    let digits = rest.iter().position(|b| b.is_ascii_digit())?;
    parse_usize(&rest[digits..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_unmap() {
        unsafe {
            let size = 64 * 1024;
            let ptr = map_memory(size, PageKind::Regular);
            assert!(!ptr.is_null());
            // The OS must hand out zeroed pages.
            for i in (0..size).step_by(4096) {
                assert_eq!(*ptr.add(i), 0);
            }
            *ptr = 0xA5;
            assert_eq!(*ptr, 0xA5);
            assert!(unmap_memory(ptr, size));
        }
    }

    #[test]
    fn test_parse_value_after() {
        let buf = b"HugePages_Total:       4\nHugepagesize:    2048 kB\n";
        assert_eq!(parse_value_after(buf, b"HugePages_Total:"), Some(4));
        assert_eq!(parse_value_after(buf, b"Hugepagesize:"), Some(2048));
        assert_eq!(parse_value_after(buf, b"NoSuchKey:"), None);
    }

    #[test]
    fn test_parse_usize() {
        assert_eq!(parse_usize(b"123abc"), Some(123));
        assert_eq!(parse_usize(b"abc"), None);
        assert_eq!(parse_usize(b"0"), Some(0));
    }

    #[test]
    fn test_thread_id_distinct() {
        let main_id = thread_id();
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main_id, 0);
        assert_ne!(main_id, other);
    }
}
