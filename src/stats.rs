//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The allocator's own spinlocks provide
//! the ordering guarantees for correctness; these counters are purely for
//! monitoring.
//!
//! # Usage
//!
//! ```ignore
//! let snap = hoardalloc::stats::snapshot();
//! println!("allocs: {}", snap.alloc_count);
//! ```
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Global allocation stats ----
    /// Total calls to alloc with size > 0.
    pub alloc_count: AtomicU64,
    /// Total calls to dealloc with size > 0.
    pub dealloc_count: AtomicU64,
    /// Total calls to realloc (after null/zero-size guards).
    pub realloc_count: AtomicU64,
    /// Sum of all requested byte sizes passed to alloc.
    pub alloc_bytes: AtomicU64,

    // ---- Tier breakdown ----
    /// Allocations served from a thread's TLAB (fast path, no lock).
    pub tlab_hits: AtomicU64,
    /// Allocations that fell through to a LocalHeap or further (slow path).
    pub tlab_misses: AtomicU64,
    /// Allocations served by a LocalHeap (superblock already on hand).
    pub local_heap_hits: AtomicU64,
    /// Times a superblock was handed from the GlobalHeap to a LocalHeap,
    /// whether reused from the idle cache or freshly grown from the OS.
    pub global_heap_allocs: AtomicU64,
    /// Allocations satisfied through the bootstrap arena (pre-TLS).
    pub bootstrap_allocs: AtomicU64,
    /// Allocations satisfied through the big-block registry.
    pub big_block_allocs: AtomicU64,

    // ---- PageSource / OS ----
    /// Calls to `platform::page_alloc`.
    pub os_alloc_count: AtomicU64,
    /// Bytes requested from the OS via `platform::page_alloc`.
    pub os_alloc_bytes: AtomicU64,
    /// Times the GlobalHeap returned a fully-empty superblock to the OS.
    pub page_source_releases: AtomicU64,
    /// Times a LocalHeap evicted a mostly-empty superblock to the GlobalHeap.
    pub superblock_evictions: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            realloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            tlab_hits: AtomicU64::new(0),
            tlab_misses: AtomicU64::new(0),
            local_heap_hits: AtomicU64::new(0),
            global_heap_allocs: AtomicU64::new(0),
            bootstrap_allocs: AtomicU64::new(0),
            big_block_allocs: AtomicU64::new(0),
            os_alloc_count: AtomicU64::new(0),
            os_alloc_bytes: AtomicU64::new(0),
            page_source_releases: AtomicU64::new(0),
            superblock_evictions: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent — concurrent allocations may race between loads.
/// For monitoring purposes this is always sufficient.
///
/// Obtain a snapshot with [`snapshot()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub realloc_count: u64,
    pub alloc_bytes: u64,
    pub tlab_hits: u64,
    pub tlab_misses: u64,
    pub local_heap_hits: u64,
    pub global_heap_allocs: u64,
    pub bootstrap_allocs: u64,
    pub big_block_allocs: u64,
    pub os_alloc_count: u64,
    pub os_alloc_bytes: u64,
    pub page_source_releases: u64,
    pub superblock_evictions: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        realloc_count: s.realloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        tlab_hits: s.tlab_hits.load(Ordering::Relaxed),
        tlab_misses: s.tlab_misses.load(Ordering::Relaxed),
        local_heap_hits: s.local_heap_hits.load(Ordering::Relaxed),
        global_heap_allocs: s.global_heap_allocs.load(Ordering::Relaxed),
        bootstrap_allocs: s.bootstrap_allocs.load(Ordering::Relaxed),
        big_block_allocs: s.big_block_allocs.load(Ordering::Relaxed),
        os_alloc_count: s.os_alloc_count.load(Ordering::Relaxed),
        os_alloc_bytes: s.os_alloc_bytes.load(Ordering::Relaxed),
        page_source_releases: s.page_source_releases.load(Ordering::Relaxed),
        superblock_evictions: s.superblock_evictions.load(Ordering::Relaxed),
    }
}
