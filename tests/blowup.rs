//! Producer–consumer blowup bound.
//!
//! One thread mallocs small objects and hands them to a second thread
//! that frees them. The free lands on a different thread than the
//! malloc, so the block comes back through `local_heap::free_block`'s
//! owner lookup rather than a thread-local cache hit. Without the
//! emptiness-driven eviction recycling superblocks back to the GlobalHeap
//! and eventually the OS, this pattern grows the heap without bound.

#![cfg(feature = "stats")]

use hoardalloc::HoardMalloc;
use hoardalloc::stats;
use std::alloc::{GlobalAlloc, Layout};
use std::sync::mpsc;
use std::thread;

#[global_allocator]
static GLOBAL: HoardMalloc = HoardMalloc;

#[test]
fn producer_consumer_does_not_blow_up() {
    let layout = Layout::from_size_align(8, 8).unwrap();
    const OBJECTS: usize = 1_000_000;

    let (tx, rx) = mpsc::channel::<usize>();

    let producer = thread::spawn(move || {
        for _ in 0..OBJECTS {
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null());
            tx.send(ptr as usize).unwrap();
        }
    });

    let consumer = thread::spawn(move || {
        for addr in rx {
            unsafe { GLOBAL.dealloc(addr as *mut u8, layout) };
        }
    });

    producer.join().unwrap();
    consumer.join().unwrap();

    let snap = stats::snapshot();
    // Every superblock handed out by the GlobalHeap (fresh or recycled)
    // bumps this counter; every superblock actually returned to the OS
    // bumps the other. The difference is the number of superblocks still
    // alive somewhere in the system (owned by a LocalHeap or idling in the
    // GlobalHeap's cache) once both threads are done.
    let held = snap.global_heap_allocs.saturating_sub(snap.page_source_releases);

    // Only two threads ever touch this size class, each bound to at most
    // one LocalHeap, plus the GlobalHeap's small per-class cache. That
    // should keep the live superblock count to a handful regardless of
    // how many objects passed through, not growing with OBJECTS.
    assert!(
        held <= 32,
        "expected bounded superblock retention, held {held} superblocks \
         ({} handed out, {} released) after {OBJECTS} objects",
        snap.global_heap_allocs,
        snap.page_source_releases,
    );
}
