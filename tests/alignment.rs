//! Alignment guarantees across the allocation surface: the GlobalAlloc
//! adapter, the aligned malloc entry points, and realloc preserving
//! alignment.

use scmalloc::ScMalloc;
use scmalloc::api;
use std::alloc::{GlobalAlloc, Layout};

static ALLOC: ScMalloc = ScMalloc;

#[test]
fn global_alloc_respects_layout_alignment() {
    let aligns: &[usize] = &[1, 2, 4, 8, 16, 32, 64, 128, 4096, 16384, 65536];
    let sizes: &[usize] = &[1, 7, 24, 100, 1000, 5000, 10_000, 300_000];

    for &align in aligns {
        for &size in sizes {
            let layout = Layout::from_size_align(size, align).unwrap();
            let ptr = unsafe { ALLOC.alloc(layout) };
            assert!(!ptr.is_null(), "alloc failed: size {size} align {align}");
            assert_eq!(
                ptr as usize % align,
                0,
                "misaligned: size {size} align {align}"
            );
            // The whole extent must be writable.
            unsafe {
                std::ptr::write_bytes(ptr, 0xAB, size);
                assert_eq!(*ptr, 0xAB);
                assert_eq!(*ptr.add(size - 1), 0xAB);
                ALLOC.dealloc(ptr, layout);
            }
        }
    }
}

#[test]
fn small_objects_are_word_aligned() {
    for size in 1..=64usize {
        let p = api::malloc(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % 8, 0, "size {size} not word aligned");
        unsafe { api::free(p) };
    }
}

#[test]
fn sixteen_byte_alignment_above_smallest_bin() {
    // Every class except the 8-byte one keeps 16-byte alignment.
    for size in [16usize, 24, 32, 48, 64, 80, 128, 1024] {
        let p = api::malloc(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0, "size {size} not 16-byte aligned");
        unsafe { api::free(p) };
    }
}

#[test]
fn large_objects_are_cache_line_aligned() {
    for size in [9000usize, 100_000, 1_000_000, 10_000_000] {
        let p = api::malloc(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0, "size {size} not cache-line aligned");
        unsafe { api::free(p) };
    }
}

#[test]
fn aligned_realloc_preserves_alignment_and_content() {
    unsafe {
        let align = 1024usize;
        let p = api::aligned_malloc(3000, align);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0);
        std::ptr::write_bytes(p, 0x3C, 3000);

        let q = api::aligned_realloc(p, 50_000, align);
        assert!(!q.is_null());
        assert_eq!(q as usize % align, 0);
        for i in (0..3000).step_by(97) {
            assert_eq!(*q.add(i), 0x3C, "content lost at {i}");
        }
        api::free(q);
    }
}

#[test]
fn realloc_through_global_alloc() {
    unsafe {
        let layout = Layout::from_size_align(128, 32).unwrap();
        let p = ALLOC.alloc(layout);
        assert!(!p.is_null());
        std::ptr::write_bytes(p, 0x11, 128);

        let q = ALLOC.realloc(p, layout, 4096);
        assert!(!q.is_null());
        assert_eq!(q as usize % 32, 0);
        for i in 0..128 {
            assert_eq!(*q.add(i), 0x11);
        }
        ALLOC.dealloc(q, Layout::from_size_align(4096, 32).unwrap());
    }
}

#[test]
fn zero_size_layout_is_harmless() {
    unsafe {
        let layout = Layout::from_size_align(0, 16).unwrap();
        let p = ALLOC.alloc(layout);
        // A dangling, aligned pointer; dealloc must be a no-op.
        assert_eq!(p as usize, 16);
        ALLOC.dealloc(p, layout);
    }
}
