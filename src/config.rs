//! Numeric parameters controlling the allocator.
//!
//! The primary constants are generated by build.rs from `scmalloc.toml`
//! (or the file named by `SCMALLOC_CONFIG`); everything else here is
//! derived from them.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Slab block headers span two cache lines; the body starts right after.
pub const SLAB_HEADER_SIZE: usize = 2 * CACHE_LINE;

/// Alignment of large objects (and of the user-visible part of them).
pub const LARGE_OBJECT_ALIGNMENT: usize = CACHE_LINE;

/// Default huge page size assumed before the OS is probed.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Number of backend bins; the last one is the huge catch-all.
pub const FREE_BINS_NUM: usize = (MAX_BINNED_HUGE - MIN_BINNED_SIZE) / FREE_BINS_STEP + 1;

/// Catch-all bin for blocks of at least `MAX_BINNED_HUGE` bytes.
pub const HUGE_BIN: usize = FREE_BINS_NUM - 1;

/// Bins in the arithmetic large-object cache tier.
pub const LARGE_CACHE_NUM_BINS: usize =
    (LARGE_CACHE_MAX_SIZE - LARGE_CACHE_MIN_SIZE) / FREE_BINS_STEP;

/// Upper bound of the huge cache tier: 1 TiB on 64-bit, 2 GiB on 32-bit.
#[cfg(target_pointer_width = "64")]
pub const MAX_HUGE_SIZE: usize = 1 << 40;
#[cfg(target_pointer_width = "32")]
pub const MAX_HUGE_SIZE: usize = 1 << 31;

const fn log2(v: usize) -> usize {
    usize::BITS as usize - 1 - v.leading_zeros() as usize
}

/// Bins in the geometric huge tier: HUGE_STEP_FACTOR per power of two.
pub const HUGE_CACHE_NUM_BINS: usize =
    (log2(MAX_HUGE_SIZE) - log2(LARGE_CACHE_MAX_SIZE)) * HUGE_STEP_FACTOR;

/// Words needed for an atomic bitmask over `n` bits.
pub const fn bitmask_words(n: usize) -> usize {
    (n + usize::BITS as usize - 1) / usize::BITS as usize
}

const _: () = assert!(MIN_BINNED_SIZE == LARGE_CACHE_MIN_SIZE);
const _: () = assert!(HUGE_BIN == FREE_BINS_NUM - 1);
const _: () = assert!(LARGE_CACHE_MAX_SIZE.is_power_of_two());
const _: () = assert!(MAX_HUGE_SIZE.is_power_of_two());
const _: () = assert!(SLAB_SIZE.is_power_of_two());
