//! TLAB (thread-local allocation buffer): per-thread free lists that make
//! the common allocate/free path lock-free.
//!
//! Mirrors the teacher's thread cache almost exactly — slow-start growth
//! on fetch, overage-tracked shrink on release, low-water-mark scavenging
//! — but fetches from and releases to a bound `LocalHeap` instead of a
//! transfer cache/central free list/page heap stack. A block whose owning
//! superblock turns out not to belong to this thread's heap (freed here
//! but allocated while the pointer's owner was a different heap) never
//! enters the TLAB's own list: it is routed straight to its real owner via
//! [`crate::local_heap::free_block`], the same way a "remote free" is
//! handled in comparable allocators.

use crate::config::TLAB_BUDGET_BYTES;
use crate::global_heap::GlobalHeap;
use crate::local_heap::{self, LocalHeap, LOCAL_HEAPS};
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::stat_inc;
use crate::superblock::{FreeBlock, Superblock};
use crate::thread_binding::{self, DefaultLifecycle, ThreadLifecycle};
use core::ptr;
use core::sync::atomic::{AtomicIsize, Ordering};

const MAX_OVERAGES: u32 = 3;
const MAX_LIST_LENGTH: u32 = 8192;
const STEAL_AMOUNT: usize = 16 * 1024;

/// Global pool new threads draw their initial budget from, bounding total
/// TLAB memory across the process the same way the teacher's
/// `UNCLAIMED_CACHE_SPACE` bounds total thread-cache memory.
static UNCLAIMED_TLAB_SPACE: AtomicIsize = AtomicIsize::new(64 * TLAB_BUDGET_BYTES as isize);

struct FreeList {
    head: *mut FreeBlock,
    length: u32,
    max_length: u32,
    length_overages: u32,
    low_water_mark: u32,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            length: 0,
            max_length: 1,
            length_overages: 0,
            low_water_mark: 0,
        }
    }

    #[inline]
    fn pop(&mut self) -> *mut FreeBlock {
        let obj = self.head;
        if !obj.is_null() {
            self.head = unsafe { (*obj).next };
            self.length -= 1;
            if self.length < self.low_water_mark {
                self.low_water_mark = self.length;
            }
        }
        obj
    }

    #[inline]
    fn push(&mut self, obj: *mut FreeBlock) {
        unsafe {
            (*obj).next = self.head;
        }
        self.head = obj;
        self.length += 1;
    }

    fn push_list(&mut self, head: *mut FreeBlock, count: u32) {
        if head.is_null() || count == 0 {
            return;
        }
        let mut tail = head;
        for _ in 1..count {
            let next = unsafe { (*tail).next };
            if next.is_null() {
                break;
            }
            tail = next;
        }
        unsafe {
            (*tail).next = self.head;
        }
        self.head = head;
        self.length += count;
    }

    fn pop_list(&mut self, count: u32) -> (u32, *mut FreeBlock) {
        let mut head: *mut FreeBlock = ptr::null_mut();
        let mut popped = 0u32;
        while popped < count && !self.head.is_null() {
            let obj = self.head;
            self.head = unsafe { (*obj).next };
            unsafe {
                (*obj).next = head;
            }
            head = obj;
            self.length -= 1;
            popped += 1;
        }
        (popped, head)
    }
}

pub struct Tlab {
    heap_id: usize,
    lists: [FreeList; NUM_SIZE_CLASSES],
    total_size: usize,
    max_size: usize,
}

impl Tlab {
    pub const fn new_const() -> Self {
        Self {
            heap_id: usize::MAX,
            lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
            total_size: 0,
            max_size: 0,
        }
    }

    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.max_size > 0
    }

    #[cold]
    pub fn init(&mut self) {
        self.heap_id = DefaultLifecycle::on_thread_start();
        UNCLAIMED_TLAB_SPACE.fetch_sub(TLAB_BUDGET_BYTES as isize, Ordering::Relaxed);
        self.max_size = TLAB_BUDGET_BYTES;
    }

    fn heap(&self) -> &'static LocalHeap {
        &LOCAL_HEAPS[self.heap_id]
    }

    /// Flush everything cached back to this thread's LocalHeap and release
    /// its binding. Called exactly once, from the thread-exit guard.
    ///
    /// # Safety
    /// Must only be called once per TLAB lifetime.
    pub unsafe fn flush_and_destroy(&mut self, global: &GlobalHeap) {
        if !self.is_initialized() {
            return;
        }
        for cls in 1..NUM_SIZE_CLASSES {
            let list = &mut self.lists[cls];
            if list.length == 0 {
                continue;
            }
            let info = size_class::class_info(cls);
            let (count, head) = list.pop_list(list.length);
            if count > 0 {
                self.total_size -= count as usize * info.size;
                self.heap().batch_free(cls, head as *mut u8, count as usize, global);
            }
        }
        DefaultLifecycle::on_thread_exit(self.heap_id);
        UNCLAIMED_TLAB_SPACE.fetch_add(self.max_size as isize, Ordering::Relaxed);
        self.max_size = 0;
    }

    /// # Safety
    /// `class` must be a valid index in `1..NUM_SIZE_CLASSES`.
    #[inline]
    pub unsafe fn allocate(&mut self, class: usize, global: &GlobalHeap) -> *mut u8 {
        let list = &mut self.lists[class];
        let obj = list.pop();
        if !obj.is_null() {
            stat_inc!(tlab_hits);
            self.total_size -= size_class::class_to_size(class);
            return obj as *mut u8;
        }
        stat_inc!(tlab_misses);
        unsafe { self.fetch_from_local_heap(class, global) }
    }

    /// # Safety
    /// `ptr` must have been allocated for `class`-sized requests.
    #[inline]
    pub unsafe fn deallocate(&mut self, ptr: *mut u8, class: usize, global: &GlobalHeap) {
        let sb = unsafe { Superblock::header_of(ptr) };
        let owner = unsafe { (*sb).owner.load(Ordering::Acquire) };

        if owner != self.heap_id {
            local_heap::free_block(sb, ptr, global);
            return;
        }

        let list = &mut self.lists[class];
        list.push(ptr as *mut FreeBlock);
        self.total_size += size_class::class_to_size(class);

        if list.length > list.max_length {
            unsafe { self.release_to_local_heap(class, global) };
        }
        if self.total_size > self.max_size {
            unsafe { self.scavenge(global) };
        }
    }

    #[cold]
    unsafe fn fetch_from_local_heap(&mut self, class: usize, global: &GlobalHeap) -> *mut u8 {
        let info = size_class::class_info(class);
        let batch = info.batch_size;
        let list = &mut self.lists[class];
        let num_to_move = (list.max_length as usize).min(batch).max(1);

        let (count, head) = self.heap().batch_malloc(class, num_to_move, global);
        if count == 0 || head.is_null() {
            return ptr::null_mut();
        }

        let result = head;
        let node = head as *mut FreeBlock;
        let remaining_head = unsafe { (*node).next };
        let remaining_count = count - 1;

        let list = &mut self.lists[class];
        if remaining_count > 0 {
            list.push_list(remaining_head, remaining_count as u32);
            self.total_size += remaining_count * info.size;
        }
        Self::grow_max_length_on_fetch(&mut self.lists[class], batch);
        result
    }

    #[cold]
    unsafe fn release_to_local_heap(&mut self, class: usize, global: &GlobalHeap) {
        let info = size_class::class_info(class);
        let batch = info.batch_size as u32;
        let list = &mut self.lists[class];
        let to_release = batch.min(list.length);
        if to_release == 0 {
            return;
        }
        let (count, head) = list.pop_list(to_release);
        self.total_size -= count as usize * info.size;
        self.heap().batch_free(class, head as *mut u8, count as usize, global);

        let list = &mut self.lists[class];
        if list.max_length < batch {
            list.max_length += 1;
        } else if list.max_length > batch {
            list.length_overages += 1;
            if list.length_overages > MAX_OVERAGES {
                list.max_length = list.max_length.saturating_sub(batch).max(batch);
                list.length_overages = 0;
            }
        }
    }

    fn grow_max_length_on_fetch(list: &mut FreeList, batch_size: usize) {
        if (list.max_length as usize) < batch_size {
            list.max_length += 1;
        } else {
            let batch = batch_size as u32;
            let new_len = list.max_length + batch;
            let new_len = new_len - (new_len % batch);
            list.max_length = new_len.min(MAX_LIST_LENGTH);
        }
        list.length_overages = 0;
    }

    #[cold]
    unsafe fn scavenge(&mut self, global: &GlobalHeap) {
        for cls in 1..NUM_SIZE_CLASSES {
            let lwm = self.lists[cls].low_water_mark;
            if lwm > 0 {
                let to_release = if lwm > 1 { lwm / 2 } else { 1 };
                let info = size_class::class_info(cls);
                let (count, head) = self.lists[cls].pop_list(to_release);
                self.total_size -= count as usize * info.size;
                self.heap().batch_free(cls, head as *mut u8, count as usize, global);
            }
            let batch = size_class::class_info(cls).batch_size as u32;
            let list = &mut self.lists[cls];
            if list.max_length > batch {
                list.max_length = list.max_length.saturating_sub(batch).max(batch);
            }
            list.low_water_mark = list.length;
        }
        self.increase_budget();
    }

    fn increase_budget(&mut self) {
        loop {
            let current = UNCLAIMED_TLAB_SPACE.load(Ordering::Relaxed);
            if current < STEAL_AMOUNT as isize {
                return;
            }
            if UNCLAIMED_TLAB_SPACE
                .compare_exchange_weak(
                    current,
                    current - STEAL_AMOUNT as isize,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.max_size += STEAL_AMOUNT;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tlab() -> Tlab {
        let mut t = Tlab::new_const();
        t.init();
        t
    }

    #[test]
    fn allocate_and_deallocate_round_trips() {
        let global = GlobalHeap::new();
        let mut t = make_tlab();
        unsafe {
            let p = t.allocate(1, &global);
            assert!(!p.is_null());
            t.deallocate(p, 1, &global);
        }
    }

    #[test]
    fn reuses_freed_block_from_own_list() {
        let global = GlobalHeap::new();
        let mut t = make_tlab();
        unsafe {
            let p1 = t.allocate(2, &global);
            t.deallocate(p1, 2, &global);
            let p2 = t.allocate(2, &global);
            assert_eq!(p1, p2);
            t.deallocate(p2, 2, &global);
        }
    }

    #[test]
    fn flush_returns_everything_and_unbinds() {
        let global = GlobalHeap::new();
        let mut t = make_tlab();
        unsafe {
            let p = t.allocate(3, &global);
            t.deallocate(p, 3, &global);
            t.flush_and_destroy(&global);
        }
        assert!(!t.is_initialized());
    }

    #[test]
    fn cross_heap_free_does_not_enter_local_list() {
        let global = GlobalHeap::new();
        let other_heap = &LOCAL_HEAPS[thread_binding::bind_thread()];
        let p = other_heap.malloc(4, &global);
        let mut t = make_tlab();
        if t.heap_id != unsafe { (*Superblock::header_of(p)).owner.load(Ordering::Acquire) } {
            unsafe { t.deallocate(p, 4, &global) };
            assert_eq!(t.lists[4].length, 0);
        }
    }
}
