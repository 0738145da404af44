#![no_std]

//! scmalloc: a scalable, concurrent general-purpose memory allocator.
//!
//! Three tiers cooperate:
//! - per-thread slab bins serve small objects out of 16 KiB slab blocks
//!   with no synchronization on the hot path; foreign frees go through
//!   per-slab public free lists,
//! - an exact-fit large object cache with adaptive ageing keeps recently
//!   freed large blocks,
//! - a coalescing backend acquires regions from the OS (or a user
//!   callback) and recombines freed spans without a global lock.
//!
//! Named pools over user-supplied raw allocators are available in
//! [`pool`]; the default pool backs the `malloc`-style API in [`api`]
//! and the [`ScMalloc`] global allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: scmalloc::ScMalloc = scmalloc::ScMalloc;
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod api;
mod aggregator;
mod backend;
mod backref;
mod bitmask;
mod bootstrap;
mod config;
mod free_block;
mod large_cache;
mod macros;
mod platform;
pub mod pool;
mod size_class;
pub mod stats;
mod slab;
mod sync;
mod tls;

pub use api::{AllocationMode, CleanupCommand, CommandStatus, ScMalloc};
pub use pool::{
    POOL_POLICY_VERSION, PoolError, PoolHandle, PoolPolicy, RawAlloc, RawFree, pool_create,
    pool_destroy, pool_identify,
};

/// Slab blocks are this large and this aligned.
pub const SLAB_SIZE: usize = config::SLAB_SIZE;

/// Sizes from here on are served as large objects.
pub const MIN_LARGE_OBJECT_SIZE: usize = size_class::MIN_LARGE_OBJECT_SIZE;

#[inline]
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[inline]
pub(crate) const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

#[inline]
pub(crate) const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}
