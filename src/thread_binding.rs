//! Binds each thread to one of the `P` LocalHeaps and keeps the binding
//! for the thread's lifetime.
//!
//! Policy is count-based: a new thread joins whichever heap currently has
//! the fewest threads bound to it, ties broken by lowest heap index. This
//! is the only binding policy implemented; a hash-of-thread-id fallback
//! was considered and rejected as needless complexity for the same load
//! distribution in the common case.

use crate::config;
use crate::local_heap::{LOCAL_HEAPS, P_MAX};
use core::sync::atomic::Ordering;

fn active_heap_count() -> usize {
    config::local_heap_count().clamp(1, P_MAX)
}

/// Pick the least-loaded LocalHeap and record one more thread bound to it.
pub fn bind_thread() -> usize {
    let active = active_heap_count();
    let mut best = 0usize;
    let mut best_count = usize::MAX;
    for i in 0..active {
        let count = LOCAL_HEAPS[i].bound_threads.load(Ordering::Relaxed);
        if count < best_count {
            best_count = count;
            best = i;
        }
    }
    LOCAL_HEAPS[best].bound_threads.fetch_add(1, Ordering::AcqRel);
    best
}

/// Release a thread's binding. Called from the TLAB's thread-exit guard.
pub fn unbind_thread(heap_id: usize) {
    LOCAL_HEAPS[heap_id].bound_threads.fetch_sub(1, Ordering::AcqRel);
}

/// Abstracts the two thread-lifecycle callbacks the TLAB needs: something to
/// call on first allocation (bind to a heap) and something to call on thread
/// exit (release the binding). The crate depends only on this pair, not on
/// any specific mechanism for invoking them — `allocator`'s TLS destructor
/// guards are the only caller today, but a layer that interposes
/// `pthread_create`/`DllMain` directly could implement the trait instead.
pub trait ThreadLifecycle {
    /// Called the first time a thread allocates. Returns the bound heap id.
    fn on_thread_start() -> usize;
    /// Called when a thread with a bound heap exits.
    fn on_thread_exit(heap_id: usize);
}

/// The only `ThreadLifecycle` implementation this crate ships: count-based
/// binding via `bind_thread`/`unbind_thread` above, invoked lazily from
/// `Tlab::init`/`Tlab::flush_and_destroy` rather than from a true
/// thread-creation hook.
pub struct DefaultLifecycle;

impl ThreadLifecycle for DefaultLifecycle {
    fn on_thread_start() -> usize {
        bind_thread()
    }

    fn on_thread_exit(heap_id: usize) {
        unbind_thread(heap_id);
    }
}
