//! GlobalHeap: the single shared reservoir of superblocks sitting between
//! the per-processor LocalHeaps and the OS.
//!
//! Protected by one lock (see the module-level lock ordering note in
//! `lib.rs`: GlobalHeap < LocalHeap_i < LocalHeap_j for i < j). Growing or
//! shrinking the OS mapping always happens with the lock dropped, the same
//! discipline the teacher's central free list uses around page heap calls,
//! so that one thread blocked in mmap/VirtualAlloc never stalls every
//! other thread wanting the same size class.

use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::stat_inc;
use crate::superblock::{self, Superblock, SuperblockList, OWNER_GLOBAL};
use crate::sync::SpinMutex;

/// How many fully-empty superblocks the global heap keeps on hand per size
/// class before returning the rest to the OS. Bounds how much memory an
/// idle process holds after a burst of frees.
const CACHE_CAP_PER_CLASS: usize = 4;

struct GlobalHeapInner {
    /// Non-empty, non-full superblocks per size class, ready to hand out
    /// as-is.
    partial: [SuperblockList; NUM_SIZE_CLASSES],
    /// Fully-empty superblocks per size class, kept on hand (up to
    /// `CACHE_CAP_PER_CLASS`) rather than returned to the OS immediately.
    /// Bucketed by the class they were last carved for, but `acquire` can
    /// re-label one from a different class in place when its own bucket
    /// is empty (see 4.3's re-labeling policy).
    empty: [SuperblockList; NUM_SIZE_CLASSES],
}

unsafe impl Send for GlobalHeapInner {}

pub struct GlobalHeap {
    inner: SpinMutex<GlobalHeapInner>,
}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalHeap {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(GlobalHeapInner {
                partial: [const { SuperblockList::new() }; NUM_SIZE_CLASSES],
                empty: [const { SuperblockList::new() }; NUM_SIZE_CLASSES],
            }),
        }
    }

    /// Hand a superblock with free blocks of `size_class` to a LocalHeap,
    /// marking it owned by `new_owner`.
    ///
    /// Tries, in order: the fullest cached partial superblock of this
    /// class; an empty superblock already bucketed under this class; an
    /// empty superblock re-labeled from another class; and only then a
    /// fresh region from the OS, with the global lock dropped during that
    /// call. `superblock::alloc_superblock` aborts the process rather
    /// than returning null, so this never does either.
    pub fn acquire(&self, size_class: usize, new_owner: usize) -> *mut Superblock {
        {
            let mut inner = self.inner.lock();

            let sb = unsafe { inner.partial[size_class].pop_most_full() };
            if !sb.is_null() {
                unsafe {
                    (*sb).owner.store(new_owner, core::sync::atomic::Ordering::Release);
                }
                stat_inc!(global_heap_allocs);
                return sb;
            }

            let sb = unsafe { inner.empty[size_class].pop_front() };
            if !sb.is_null() {
                unsafe {
                    (*sb).owner.store(new_owner, core::sync::atomic::Ordering::Release);
                }
                stat_inc!(global_heap_allocs);
                return sb;
            }

            for other in 0..NUM_SIZE_CLASSES {
                if other == size_class {
                    continue;
                }
                let sb = unsafe { inner.empty[other].pop_front() };
                if sb.is_null() {
                    continue;
                }
                let block_size = size_class::class_to_size(size_class);
                unsafe {
                    superblock::relabel(sb, size_class, block_size);
                    (*sb).owner.store(new_owner, core::sync::atomic::Ordering::Release);
                }
                stat_inc!(global_heap_allocs);
                return sb;
            }
        }

        let block_size = size_class::class_to_size(size_class);
        let sb = superblock::alloc_superblock(new_owner, size_class, block_size);
        stat_inc!(global_heap_allocs);
        sb
    }

    /// Return a superblock to the global pool. If it is already fully
    /// empty and the per-class cache is at capacity, it is released back
    /// to the OS instead, with the lock dropped during that call.
    pub fn release(&self, sb: *mut Superblock) {
        unsafe {
            (*sb).owner.store(OWNER_GLOBAL, core::sync::atomic::Ordering::Release);
        }
        let class = unsafe { (*sb).size_class };
        let is_empty = unsafe { (*sb).is_empty() };

        if is_empty {
            let mut inner = self.inner.lock();
            if inner.empty[class].count >= CACHE_CAP_PER_CLASS {
                drop(inner);
                unsafe { superblock::dealloc_superblock(sb) };
                stat_inc!(page_source_releases);
                return;
            }
            unsafe { inner.empty[class].push_front(sb) };
            return;
        }

        let mut inner = self.inner.lock();
        unsafe { inner.partial[class].push_front(sb) };
    }

    /// Free a block directly into a superblock the GlobalHeap already
    /// owns (reached when a block's owner was found to be `OWNER_GLOBAL`
    /// by [`crate::local_heap::free_block`]). `sb` is always already
    /// linked into `partial[class]`, since a globally-owned superblock
    /// with any live blocks can only be sitting there.
    pub fn free_into(&self, sb: *mut Superblock, block: *mut u8) {
        let class = unsafe { (*sb).size_class };
        let now_empty = {
            let _inner = self.inner.lock();
            unsafe {
                (*sb).push_block(block);
                (*sb).is_empty()
            }
        };

        if !now_empty {
            return;
        }

        let should_free_to_os = {
            let mut inner = self.inner.lock();
            unsafe { inner.partial[class].remove(sb) };
            if inner.empty[class].count >= CACHE_CAP_PER_CLASS {
                true
            } else {
                unsafe { inner.empty[class].push_front(sb) };
                false
            }
        };
        if should_free_to_os {
            unsafe { superblock::dealloc_superblock(sb) };
            stat_inc!(page_source_releases);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_grows_from_os_when_empty() {
        let heap = GlobalHeap::new();
        let sb = heap.acquire(1, 0);
        assert!(!sb.is_null());
        unsafe {
            assert_eq!((*sb).owner.load(core::sync::atomic::Ordering::Acquire), 0);
            assert!(!(*sb).is_full());
        }
        heap.release(sb);
    }

    #[test]
    fn release_then_acquire_reuses_superblock() {
        let heap = GlobalHeap::new();
        let sb1 = heap.acquire(2, 0);
        let addr1 = sb1 as usize;
        heap.release(sb1);

        let sb2 = heap.acquire(2, 1);
        assert_eq!(sb2 as usize, addr1);
        unsafe {
            assert_eq!((*sb2).owner.load(core::sync::atomic::Ordering::Acquire), 1);
        }
        heap.release(sb2);
    }

    #[test]
    fn cache_cap_releases_excess_to_os() {
        let heap = GlobalHeap::new();
        let mut sbs = alloc::vec::Vec::new();
        for _ in 0..CACHE_CAP_PER_CLASS + 2 {
            sbs.push(heap.acquire(3, 0));
        }
        for sb in sbs {
            heap.release(sb);
        }
        let inner = heap.inner.lock();
        assert_eq!(inner.empty[3].count, CACHE_CAP_PER_CLASS);
    }

    #[test]
    fn acquire_relabels_an_idle_superblock_from_another_class() {
        let heap = GlobalHeap::new();

        // Seed an empty superblock under class 4, then release it so it
        // lands in `empty[4]` with nothing else cached anywhere.
        let seed = heap.acquire(4, 0);
        let seed_addr = seed as usize;
        heap.release(seed);

        // Requesting class 5, which has nothing of its own, should reuse
        // the seeded superblock in place rather than mapping a new one.
        let sb = heap.acquire(5, 1);
        assert_eq!(sb as usize, seed_addr);
        unsafe {
            assert_eq!((*sb).size_class, 5);
            assert_eq!(
                (*sb).block_size,
                crate::size_class::class_to_size(5)
            );
            assert!(!(*sb).freelist.is_null());
            assert_eq!((*sb).owner.load(core::sync::atomic::Ordering::Acquire), 1);
        }
        heap.release(sb);
    }
}
