#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]
#![cfg_attr(feature = "nightly", feature(allocator_api))]

//! hoardalloc: a Hoard-style multi-tier concurrent allocator for Rust.
//!
//! Four tiers, fastest to slowest:
//! - TLAB: per-thread free lists, lock-free (requires `nightly` or `std`)
//! - LocalHeap: one of `P` per-processor heaps, superblocks bucketed by
//!   emptiness
//! - GlobalHeap: the single shared reservoir of superblocks
//! - PageSource: the OS, reached through `platform`
//!
//! Two side paths bypass the tiers entirely: the bootstrap arena serves
//! allocations made before a thread's TLAB exists, and the big-block
//! registry serves allocations above the large-object threshold.
//!
//! Lock ordering: `GlobalHeap < LocalHeap_i < LocalHeap_j` for `i < j`.
//! Every module that touches more than one of these locks releases the
//! finer-grained one before acquiring the coarser one, so the order is
//! never actually tested by holding two at once.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: hoardalloc::HoardMalloc = hoardalloc::HoardMalloc;
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod big_block;
pub mod bootstrap;
pub mod config;
#[cfg(feature = "ffi")]
pub mod ffi;
#[cfg(feature = "alloc-histogram")]
pub mod histogram;
pub mod global_heap;
pub mod local_heap;
pub mod platform;
pub mod size_class;
#[cfg(feature = "stats")]
pub mod stats;
pub mod superblock;
pub mod sync;
pub mod thread_binding;
pub mod tlab;

#[macro_use]
mod macros;

// Re-export the allocator at crate root for convenience.
pub use allocator::HoardMalloc;

/// Abort the process with `msg` on stderr (when `std` is available) or
/// silently otherwise. Used both for invariant violations severe enough
/// that continuing would only produce a more confusing failure later
/// (corrupted heap metadata discovered at runtime) and for OOM: once a
/// request has missed every faster tier and PageSource itself has nothing
/// left to give, there is no fallback left to return null *to* — the
/// error taxonomy calls for abort with a diagnostic, not a null return,
/// matching the "abort on OOM" contract `malloc`/`aligned_alloc` document.
#[cold]
#[inline(never)]
pub(crate) fn fatal_abort(msg: &str) -> ! {
    #[cfg(feature = "std")]
    {
        std::eprintln!("hoardalloc: fatal: {}", msg);
    }
    let _ = msg;
    #[cfg(any(feature = "std", test))]
    {
        std::process::abort();
    }
    #[cfg(not(any(feature = "std", test)))]
    {
        unsafe extern "C" {
            fn abort() -> !;
        }
        unsafe { abort() }
    }
}

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
