//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and
//! never used for synchronization; the allocator's own locks and CASes
//! provide the ordering that matters for correctness.
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads
//! are atomic but the snapshot as a whole is not globally consistent.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Request counts ----
    /// Calls into the small-object (slab) allocation path.
    pub small_allocs: AtomicU64,
    /// Calls into the large-object allocation path.
    pub large_allocs: AtomicU64,
    /// Frees routed to a slab owned by the calling thread.
    pub own_frees: AtomicU64,
    /// Frees pushed onto a foreign slab's public free list.
    pub foreign_frees: AtomicU64,

    // ---- Cache tiers ----
    /// Large allocations satisfied by the per-thread cache.
    pub local_cache_hits: AtomicU64,
    /// Large allocations satisfied by the shared large object cache.
    pub large_cache_hits: AtomicU64,
    /// Large allocations that had to go to the backend.
    pub large_cache_misses: AtomicU64,
    /// Public free lists privatized by their owner.
    pub privatizations: AtomicU64,
    /// Orphaned slabs adopted by a new thread.
    pub orphans_adopted: AtomicU64,

    // ---- Backend / OS ----
    /// Regions mapped from the OS (or the user raw-alloc callback).
    pub regions_mapped: AtomicU64,
    /// Regions returned whole to the OS.
    pub regions_released: AtomicU64,
    /// Free blocks merged with a neighbor during coalescing.
    pub coalesce_merges: AtomicU64,
    /// Blocks deferred to the delayed-coalesce queue.
    pub coalesce_deferred: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            small_allocs: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            own_frees: AtomicU64::new(0),
            foreign_frees: AtomicU64::new(0),
            local_cache_hits: AtomicU64::new(0),
            large_cache_hits: AtomicU64::new(0),
            large_cache_misses: AtomicU64::new(0),
            privatizations: AtomicU64::new(0),
            orphans_adopted: AtomicU64::new(0),
            regions_mapped: AtomicU64::new(0),
            regions_released: AtomicU64::new(0),
            coalesce_merges: AtomicU64::new(0),
            coalesce_deferred: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time copy of all counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub small_allocs: u64,
    pub large_allocs: u64,
    pub own_frees: u64,
    pub foreign_frees: u64,
    pub local_cache_hits: u64,
    pub large_cache_hits: u64,
    pub large_cache_misses: u64,
    pub privatizations: u64,
    pub orphans_adopted: u64,
    pub regions_mapped: u64,
    pub regions_released: u64,
    pub coalesce_merges: u64,
    pub coalesce_deferred: u64,
}

/// Load all counters with `Relaxed` ordering.
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        small_allocs: s.small_allocs.load(Ordering::Relaxed),
        large_allocs: s.large_allocs.load(Ordering::Relaxed),
        own_frees: s.own_frees.load(Ordering::Relaxed),
        foreign_frees: s.foreign_frees.load(Ordering::Relaxed),
        local_cache_hits: s.local_cache_hits.load(Ordering::Relaxed),
        large_cache_hits: s.large_cache_hits.load(Ordering::Relaxed),
        large_cache_misses: s.large_cache_misses.load(Ordering::Relaxed),
        privatizations: s.privatizations.load(Ordering::Relaxed),
        orphans_adopted: s.orphans_adopted.load(Ordering::Relaxed),
        regions_mapped: s.regions_mapped.load(Ordering::Relaxed),
        regions_released: s.regions_released.load(Ordering::Relaxed),
        coalesce_merges: s.coalesce_merges.load(Ordering::Relaxed),
        coalesce_deferred: s.coalesce_deferred.load(Ordering::Relaxed),
    }
}
