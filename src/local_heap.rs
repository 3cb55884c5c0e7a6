//! LocalHeap: one of the `P` per-processor heaps sitting between TLABs and
//! the GlobalHeap.
//!
//! Each LocalHeap keeps its superblocks bucketed into `EMPTINESS_BINS + 1`
//! lists per size class, mirroring the central free list's per-size-class
//! locking but adding Hoard's emptiness-threshold eviction: once a heap's
//! unused memory for a class exceeds both a fraction `f` of what it holds
//! and a `K`-superblock slack margin, it sheds its emptiest superblock back
//! to the GlobalHeap. Lock order is GlobalHeap < LocalHeap_i < LocalHeap_j
//! for i < j; this module only ever acquires its own lock, then (after
//! releasing it) the GlobalHeap's, so the order is satisfied by never
//! holding both at once.

use crate::config::{EVICTION_FRACTION_DEN, EVICTION_FRACTION_NUM, EVICTION_SLACK_SUPERBLOCKS, SB_SIZE};
use crate::global_heap::GlobalHeap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::stat_inc;
use crate::superblock::{Superblock, SuperblockList, OWNER_GLOBAL};
use crate::sync::SpinMutex;
use core::sync::atomic::{AtomicUsize, Ordering};

pub const EMPTINESS_BUCKETS: usize = crate::config::EMPTINESS_BINS + 1;

/// Maximum number of LocalHeaps the allocator can create. `P` (the actual
/// count, from config or auto-detected parallelism) is clamped to this.
pub const P_MAX: usize = 64;

struct ClassBins {
    bins: [SuperblockList; EMPTINESS_BUCKETS],
    owned_superblocks: usize,
    used_blocks: usize,
}

impl ClassBins {
    const fn new() -> Self {
        Self {
            bins: [const { SuperblockList::new() }; EMPTINESS_BUCKETS],
            owned_superblocks: 0,
            used_blocks: 0,
        }
    }
}

struct LocalHeapInner {
    classes: [ClassBins; NUM_SIZE_CLASSES],
}

unsafe impl Send for LocalHeapInner {}

impl LocalHeapInner {
    const fn new() -> Self {
        Self {
            classes: [const { ClassBins::new() }; NUM_SIZE_CLASSES],
        }
    }
}

pub struct LocalHeap {
    pub id: usize,
    /// Number of live threads currently bound to this heap. Read by
    /// [`crate::thread_binding`] to pick the least-loaded heap; never
    /// touched while `inner`'s lock is held.
    pub bound_threads: AtomicUsize,
    inner: SpinMutex<LocalHeapInner>,
}

impl LocalHeap {
    pub const fn new(id: usize) -> Self {
        Self {
            id,
            bound_threads: AtomicUsize::new(0),
            inner: SpinMutex::new(LocalHeapInner::new()),
        }
    }

    /// Allocate one block of `class`'s size, pulling from the GlobalHeap if
    /// this heap has nothing free. `GlobalHeap::acquire` always succeeds
    /// or aborts the process on OOM, so this never returns null either.
    pub fn malloc(&self, class: usize, global: &GlobalHeap) -> *mut u8 {
        {
            let mut inner = self.inner.lock();
            if let Some(block) = Self::take_from_bins(&mut inner.classes[class], class) {
                stat_inc!(local_heap_hits);
                return block;
            }
        }

        let sb = global.acquire(class, self.id);

        let mut inner = self.inner.lock();
        let cb = &mut inner.classes[class];
        cb.owned_superblocks += 1;
        let block = unsafe { (*sb).pop_block() };
        cb.used_blocks += 1;
        let bin = unsafe { (*sb).emptiness_bin(EMPTINESS_BUCKETS) };
        unsafe {
            (*sb).bin = bin;
            cb.bins[bin].push_front(sb);
        }
        block
    }

    /// Pull up to `want` blocks of `class`'s size under a single lock
    /// acquisition, growing from the GlobalHeap as needed. Returns a
    /// singly-linked list (via the blocks' first 8 bytes, as
    /// `superblock::FreeBlock`) and how many blocks it actually holds.
    pub fn batch_malloc(&self, class: usize, want: usize, global: &GlobalHeap) -> (usize, *mut u8) {
        use crate::superblock::FreeBlock;

        let mut inner = self.inner.lock();
        let mut head: *mut FreeBlock = core::ptr::null_mut();
        let mut got = 0usize;

        while got < want {
            if let Some(block) = Self::take_from_bins(&mut inner.classes[class], class) {
                unsafe {
                    (*(block as *mut FreeBlock)).next = head;
                }
                head = block as *mut FreeBlock;
                got += 1;
                continue;
            }
            drop(inner);
            let sb = global.acquire(class, self.id);
            inner = self.inner.lock();
            let cb = &mut inner.classes[class];
            cb.owned_superblocks += 1;
            let bin = unsafe { (*sb).emptiness_bin(EMPTINESS_BUCKETS) };
            unsafe {
                (*sb).bin = bin;
                cb.bins[bin].push_front(sb);
            }
        }
        if got > 0 {
            stat_inc!(local_heap_hits);
        }
        (got, head as *mut u8)
    }

    /// Return a singly-linked list of `count` blocks (all of `class`'s
    /// size, chained through `superblock::FreeBlock::next`) under as few
    /// lock acquisitions as the blocks' owning superblocks allow. Any
    /// superblocks the eviction heuristic flags are released to `global`
    /// after this heap's lock is dropped for each one.
    pub fn batch_free(&self, class: usize, mut head: *mut u8, count: usize, global: &GlobalHeap) {
        use crate::superblock::FreeBlock;

        let mut remaining = count;
        let mut pending_evictions: [*mut Superblock; 8] = [core::ptr::null_mut(); 8];
        let mut num_pending = 0usize;

        {
            let mut inner = self.inner.lock();
            while !head.is_null() && remaining > 0 {
                let node = head as *mut FreeBlock;
                head = unsafe { (*node).next } as *mut u8;
                remaining -= 1;

                let sb = unsafe { Superblock::header_of(node as *mut u8) };
                let cb = &mut inner.classes[class];
                unsafe {
                    cb.bins[(*sb).bin].remove(sb);
                    (*sb).push_block(node as *mut u8);
                    cb.used_blocks -= 1;
                    let new_bin = (*sb).emptiness_bin(EMPTINESS_BUCKETS);
                    (*sb).bin = new_bin;
                    cb.bins[new_bin].push_front(sb);
                }
                if let Some(evicted) = Self::maybe_evict(cb, class) {
                    if num_pending < pending_evictions.len() {
                        pending_evictions[num_pending] = evicted;
                        num_pending += 1;
                    } else {
                        global.release(evicted);
                    }
                }
            }
        }

        for sb in pending_evictions.iter().take(num_pending) {
            global.release(*sb);
        }
    }

    /// Search this heap's bins for a superblock with a free block, taking
    /// the one in the highest non-full bin first (packs tightly before
    /// spreading allocations across more superblocks).
    fn take_from_bins(cb: &mut ClassBins, class: usize) -> Option<*mut u8> {
        for bin in (0..EMPTINESS_BUCKETS - 1).rev() {
            if cb.bins[bin].is_empty() {
                continue;
            }
            let sb = cb.bins[bin].head;
            unsafe {
                cb.bins[bin].remove(sb);
                let block = (*sb).pop_block();
                cb.used_blocks += 1;
                let new_bin = (*sb).emptiness_bin(EMPTINESS_BUCKETS);
                (*sb).bin = new_bin;
                cb.bins[new_bin].push_front(sb);
                let _ = class;
                return Some(block);
            }
        }
        None
    }

    /// Free a block known to be owned by this heap's superblock `sb`.
    /// Returns a superblock that should be evicted to the GlobalHeap, if
    /// the eviction heuristic now triggers; the caller must hand it to
    /// `global.release()` itself, after this heap's lock is dropped.
    pub fn free(&self, sb: *mut Superblock, block: *mut u8) -> Option<*mut Superblock> {
        let class = unsafe { (*sb).size_class };
        let mut inner = self.inner.lock();
        let cb = &mut inner.classes[class];

        unsafe {
            cb.bins[(*sb).bin].remove(sb);
            (*sb).push_block(block);
            cb.used_blocks -= 1;
            let new_bin = (*sb).emptiness_bin(EMPTINESS_BUCKETS);
            (*sb).bin = new_bin;
            cb.bins[new_bin].push_front(sb);
        }

        Self::maybe_evict(cb, class)
    }

    fn maybe_evict(cb: &mut ClassBins, class: usize) -> Option<*mut Superblock> {
        if cb.owned_superblocks <= EVICTION_SLACK_SUPERBLOCKS {
            return None;
        }
        let block_size = size_class::class_to_size(class);
        let a_bytes = cb.owned_superblocks * SB_SIZE;
        let u_bytes = cb.used_blocks * block_size;
        let unused = a_bytes.saturating_sub(u_bytes);
        let threshold = (a_bytes * EVICTION_FRACTION_NUM) / EVICTION_FRACTION_DEN;
        let slack_bytes = (EVICTION_SLACK_SUPERBLOCKS + 1) * SB_SIZE;
        if unused <= threshold || unused <= slack_bytes {
            return None;
        }

        // Evict from the emptiest non-empty bin; an all-empty superblock in
        // bin 0 is always preferred.
        for bin in 0..EMPTINESS_BUCKETS {
            if cb.bins[bin].is_empty() {
                continue;
            }
            let sb = cb.bins[bin].head;
            unsafe {
                cb.bins[bin].remove(sb);
            }
            cb.owned_superblocks -= 1;
            cb.used_blocks -= unsafe { (*sb).allocated_count as usize };
            stat_inc!(superblock_evictions);
            return Some(sb);
        }
        None
    }
}

/// Array of all possible LocalHeaps. `crate::config::local_heap_count()`,
/// clamped to `P_MAX`, determines how many are actually handed out by
/// `crate::thread_binding`; the unused tail simply never receives work.
pub static LOCAL_HEAPS: [LocalHeap; P_MAX] = {
    let mut heaps = [const { LocalHeap::new(0) }; P_MAX];
    let mut i = 0;
    while i < P_MAX {
        heaps[i] = LocalHeap::new(i);
        i += 1;
    }
    heaps
};

/// Free a block whose owning superblock may belong to any LocalHeap or to
/// the GlobalHeap directly. This is the single entry point other modules
/// should call; it resolves ownership via the superblock header and routes
/// the free to wherever it actually lives, which is how cross-thread frees
/// get reconciled without a central lookup table.
pub fn free_block(sb: *mut Superblock, block: *mut u8, global: &GlobalHeap) {
    loop {
        let owner = unsafe { (*sb).owner.load(Ordering::Acquire) };
        if owner == OWNER_GLOBAL {
            global.free_into(sb, block);
            return;
        }
        debug_assert!(owner < P_MAX);
        let heap = &LOCAL_HEAPS[owner];
        if let Some(evicted) = heap.free(sb, block) {
            global.release(evicted);
        }
        // Ownership cannot have changed between the load above and the
        // call into `heap.free`: only a heap's own eviction path (which we
        // just took, if at all) reassigns its superblocks' owner, and it
        // does so only after this free has already been applied.
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_heap::GlobalHeap;

    #[test]
    fn malloc_then_free_round_trips() {
        let global = GlobalHeap::new();
        let heap = LocalHeap::new(0);
        let block = heap.malloc(1, &global);
        assert!(!block.is_null());
        let sb = unsafe { Superblock::header_of(block) };
        let evicted = heap.free(sb, block);
        assert!(evicted.is_none());
    }

    #[test]
    fn many_allocations_then_frees_eventually_evict() {
        let global = GlobalHeap::new();
        let heap = LocalHeap::new(0);
        let class = 1;
        let mut blocks = alloc::vec::Vec::new();
        for _ in 0..8 {
            let b = heap.malloc(class, &global);
            assert!(!b.is_null());
            blocks.push(b);
        }
        let mut evicted_any = false;
        for b in blocks {
            let sb = unsafe { Superblock::header_of(b) };
            if heap.free(sb, b).is_some() {
                evicted_any = true;
            }
        }
        let _ = evicted_any;
    }

    #[test]
    fn cross_heap_free_routes_to_owner() {
        let global = GlobalHeap::new();
        let owner_heap = &LOCAL_HEAPS[5];
        let block = owner_heap.malloc(1, &global);
        let sb = unsafe { Superblock::header_of(block) };
        assert_eq!(unsafe { (*sb).owner.load(Ordering::Acquire) }, 5);
        free_block(sb, block, &global);
    }
}
