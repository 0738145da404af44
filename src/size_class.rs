//! Size classes for small objects living inside slab blocks.
//!
//! Three tiers share one index space:
//! - 8 bins of 8-byte strides covering 8..=64 bytes (on 64-bit targets
//!   every bin except bin 0 is kept 16-byte aligned, so bins 2/4/6 are
//!   unused),
//! - 16 segregated bins, four per power of two, covering 80..=1024,
//! - 5 "fitting" bins whose sizes are chosen so that exactly 9, 6, 4, 3
//!   and 2 objects fill a slab body.
//!
//! Anything above the last fitting size is a large object and never
//! touches a slab.

use crate::config::{CACHE_LINE, SLAB_HEADER_SIZE, SLAB_SIZE};

pub const NUM_SMALL_BINS: usize = 8;
pub const MAX_SMALL_OBJECT_SIZE: usize = 64;

pub const MIN_SEGREGATED_INDEX: usize = NUM_SMALL_BINS;
pub const NUM_SEGREGATED_BINS: usize = 16;
pub const MAX_SEGREGATED_OBJECT_SIZE: usize = 1024;

pub const MIN_FITTING_INDEX: usize = MIN_SEGREGATED_INDEX + NUM_SEGREGATED_BINS;
pub const NUM_FITTING_BINS: usize = 5;
pub const FITTING_ALIGNMENT: usize = CACHE_LINE;

const fn fitting_size(n: usize) -> usize {
    ((SLAB_SIZE - SLAB_HEADER_SIZE) / n) & !(FITTING_ALIGNMENT - 1)
}

pub const FITTING_SIZE_1: usize = fitting_size(9);
pub const FITTING_SIZE_2: usize = fitting_size(6);
pub const FITTING_SIZE_3: usize = fitting_size(4);
pub const FITTING_SIZE_4: usize = fitting_size(3);
pub const FITTING_SIZE_5: usize = fitting_size(2);

/// Total number of per-thread slab bins.
pub const NUM_SLAB_BINS: usize = MIN_FITTING_INDEX + NUM_FITTING_BINS;

/// Objects of this size and above are large objects.
pub const MIN_LARGE_OBJECT_SIZE: usize = FITTING_SIZE_5 + 1;

const _: () = assert!(FITTING_SIZE_1 > MAX_SEGREGATED_OBJECT_SIZE);
const _: () = assert!(FITTING_SIZE_5 < SLAB_SIZE - SLAB_HEADER_SIZE);

#[inline]
fn highest_bit_pos(n: usize) -> usize {
    debug_assert!(n >= MAX_SMALL_OBJECT_SIZE && n < MAX_SEGREGATED_OBJECT_SIZE);
    usize::BITS as usize - 1 - n.leading_zeros() as usize
}

#[inline]
fn small_object_index(size: usize) -> usize {
    let index = (size - 1) >> 3;
    // 16-byte alignment for everything but bin 0 on 64-bit targets.
    if core::mem::size_of::<usize>() == 8 && index != 0 {
        index | 1
    } else {
        index
    }
}

/// Map an allocation size to its slab bin index.
#[inline]
pub fn index(size: usize) -> usize {
    debug_assert!(size > 0 && size < MIN_LARGE_OBJECT_SIZE);
    if size <= MAX_SMALL_OBJECT_SIZE {
        small_object_index(size)
    } else if size <= MAX_SEGREGATED_OBJECT_SIZE {
        // Four bins per power of two between 64 and 1024.
        let order = highest_bit_pos(size - 1);
        MIN_SEGREGATED_INDEX - (4 * 6) - 4 + (4 * order) + ((size - 1) >> (order - 2))
    } else if size <= FITTING_SIZE_3 {
        if size <= FITTING_SIZE_2 {
            if size <= FITTING_SIZE_1 {
                MIN_FITTING_INDEX
            } else {
                MIN_FITTING_INDEX + 1
            }
        } else {
            MIN_FITTING_INDEX + 2
        }
    } else if size <= FITTING_SIZE_4 {
        MIN_FITTING_INDEX + 3
    } else {
        MIN_FITTING_INDEX + 4
    }
}

/// Map an allocation size to the object size actually carved for it.
#[inline]
pub fn object_size(size: usize) -> usize {
    debug_assert!(size > 0 && size < MIN_LARGE_OBJECT_SIZE);
    if size <= MAX_SMALL_OBJECT_SIZE {
        (small_object_index(size) + 1) << 3
    } else if size <= MAX_SEGREGATED_OBJECT_SIZE {
        let order = highest_bit_pos(size - 1);
        let alignment = 128 >> (9 - order);
        (size + alignment - 1) & !(alignment - 1)
    } else if size <= FITTING_SIZE_3 {
        if size <= FITTING_SIZE_2 {
            if size <= FITTING_SIZE_1 {
                FITTING_SIZE_1
            } else {
                FITTING_SIZE_2
            }
        } else {
            FITTING_SIZE_3
        }
    } else if size <= FITTING_SIZE_4 {
        FITTING_SIZE_4
    } else {
        FITTING_SIZE_5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fitting_sizes() {
        // With 16 KiB slabs and 128-byte headers these are fixed.
        assert_eq!(FITTING_SIZE_1, 1792);
        assert_eq!(FITTING_SIZE_2, 2688);
        assert_eq!(FITTING_SIZE_3, 4032);
        assert_eq!(FITTING_SIZE_4, 5376);
        assert_eq!(FITTING_SIZE_5, 8128);
        assert_eq!(MIN_LARGE_OBJECT_SIZE, 8129);
    }

    #[test]
    fn test_small_sizes() {
        assert_eq!(object_size(1), 8);
        assert_eq!(object_size(8), 8);
        if core::mem::size_of::<usize>() == 8 {
            // 16-byte alignment skips odd strides above bin 0.
            assert_eq!(object_size(9), 16);
            assert_eq!(object_size(24), 32);
            assert_eq!(object_size(33), 48);
        }
        assert_eq!(object_size(64), 64);
    }

    #[test]
    fn test_segregated_sizes() {
        assert_eq!(object_size(65), 80);
        assert_eq!(object_size(80), 80);
        assert_eq!(object_size(81), 96);
        assert_eq!(object_size(128), 128);
        assert_eq!(object_size(129), 160);
        assert_eq!(object_size(512), 512);
        assert_eq!(object_size(513), 640);
        assert_eq!(object_size(1024), 1024);
        assert_eq!(index(80), MIN_SEGREGATED_INDEX);
        assert_eq!(index(1024), MIN_SEGREGATED_INDEX + NUM_SEGREGATED_BINS - 1);
    }

    #[test]
    fn test_fitting_index_boundaries() {
        assert_eq!(index(1025), MIN_FITTING_INDEX);
        assert_eq!(index(FITTING_SIZE_1), MIN_FITTING_INDEX);
        assert_eq!(index(FITTING_SIZE_1 + 1), MIN_FITTING_INDEX + 1);
        assert_eq!(index(FITTING_SIZE_5), MIN_FITTING_INDEX + 4);
        assert_eq!(index(FITTING_SIZE_5), NUM_SLAB_BINS - 1);
    }

    #[test]
    fn test_object_size_covers_request() {
        for size in 1..MIN_LARGE_OBJECT_SIZE {
            let obj = object_size(size);
            assert!(obj >= size, "object_size({}) = {} too small", size, obj);
            assert!(obj < MIN_LARGE_OBJECT_SIZE);
            // index and object_size must agree on the bin.
            assert_eq!(index(size), index(obj));
        }
    }

    #[test]
    fn test_index_monotonic() {
        let mut last = 0;
        for size in 1..MIN_LARGE_OBJECT_SIZE {
            let idx = index(size);
            assert!(idx >= last, "index must not decrease at size {}", size);
            assert!(idx < NUM_SLAB_BINS);
            last = idx;
        }
    }

    #[test]
    fn test_objects_fit_slab_body() {
        let body = SLAB_SIZE - SLAB_HEADER_SIZE;
        for (n, size) in [
            (9, FITTING_SIZE_1),
            (6, FITTING_SIZE_2),
            (4, FITTING_SIZE_3),
            (3, FITTING_SIZE_4),
            (2, FITTING_SIZE_5),
        ] {
            assert!(n * size <= body);
            assert!((n + 1) * size > body);
        }
    }
}
