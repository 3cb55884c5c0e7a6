//! Top-level allocator: ties all tiers together and implements GlobalAlloc.
//!
//! Static state lives here. The `HoardMalloc` struct is zero-sized; all
//! mutable state is in module-level statics protected by spinlocks or
//! atomics.
//!
//! Cache strategy (fastest to slowest):
//! - `nightly` feature: `#[thread_local]` TLAB with const-init (single TLS
//!   read, no branches)
//! - `std` feature: `std::thread_local!` TLAB with const-init (no lazy init
//!   overhead)
//! - neither: no thread-local cache — every allocation goes straight to
//!   `LOCAL_HEAPS[0]`, the same heap every thread shares
//!
//! Below the TLAB sits the tiered heap proper: `LocalHeap` -> `GlobalHeap`
//! -> the OS, plus two side paths that never touch a superblock at all —
//! the bootstrap arena for pre-TLS allocations, and the big-block registry
//! for anything above `S_MAX`.

use crate::big_block::{self, BigBlockInfo};
use crate::bootstrap;
use crate::config::SB_SIZE;
use crate::global_heap::GlobalHeap;
use crate::local_heap;
use crate::platform;
use crate::size_class;
use crate::superblock::{Superblock, HEADER_SIZE};
use crate::tlab::Tlab;
use crate::{hist_record, stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

/// The single GlobalHeap shared by every LocalHeap, process-wide.
pub(crate) static GLOBAL_HEAP: GlobalHeap = GlobalHeap::new();

/// Flips to `true` the first time this process serves an allocation.
/// Until then, `alloc` routes through the bootstrap arena instead of the
/// tiered heap — nothing guarantees the thread-local machinery a TLAB
/// needs is safe to touch from the very first allocation call a process
/// ever makes (this crate is commonly installed as `#[global_allocator]`,
/// so that first call can come from Rust runtime startup, before any of
/// this crate's own code has run). Mirrors `libhoard.cpp`'s
/// `isCustomHeapInitialized()` gate around `xxmalloc`.
static PROCESS_BOOTSTRAPPED: AtomicBool = AtomicBool::new(false);

/// Test-only hook: reopen the first-allocation bootstrap window so a test
/// can exercise it deterministically, without depending on being the
/// literal first allocation the process makes (plenty of runtime startup
/// machinery allocates before any test body runs).
#[cfg(feature = "testing")]
pub fn reset_bootstrap_gate_for_test() {
    PROCESS_BOOTSTRAPPED.store(false, Ordering::SeqCst);
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[derive(Clone, Copy, PartialEq)]
        #[repr(u8)]
        enum TlsState {
            Uninitialized = 0,
            Active = 1,
            Destroyed = 2,
        }

        struct TlsSlot<T> {
            state: TlsState,
            content: T,
        }

        /// Get a raw mutable pointer to the thread-local Tlab.
        #[inline(always)]
        unsafe fn tlab_ptr() -> *mut Tlab {
            unsafe { core::ptr::addr_of_mut!(TLAB.content) }
        }

        #[thread_local]
        static mut TLAB: TlsSlot<Tlab> = TlsSlot {
            state: TlsState::Uninitialized,
            content: Tlab::new_const(),
        };

        /// Flush the Tlab and mark it Destroyed (reentrancy-safe).
        #[cold]
        #[allow(dead_code)] // Only called from cleanup modules (std feature)
        unsafe fn tlab_destroy() {
            unsafe {
                if TLAB.state == TlsState::Active {
                    TLAB.state = TlsState::Destroyed;
                    (*tlab_ptr()).flush_and_destroy(&GLOBAL_HEAP);
                }
            }
        }

        /// Initialize the thread-local Tlab.
        #[cold]
        #[inline(never)]
        unsafe fn tlab_init() {
            unsafe { (*tlab_ptr()).init() };
            // Set BEFORE cleanup registration — if register() triggers allocation,
            // the reentrant call sees TLAB as Active and uses it normally.
            unsafe { TLAB.state = TlsState::Active };
            tlab_cleanup::register();
        }

        // -- Cleanup: nightly + std --
        #[cfg(feature = "std")]
        mod tlab_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    if unsafe { super::TLAB.state } == super::TlsState::Active {
                        unsafe { super::tlab_destroy() };
                    }
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // Use try_with: if std's TLS is already destroyed (rare edge case
                // during thread shutdown), silently skip — the Tlab leaks.
                let _ = GUARD.try_with(|_| {});
            }
        }

        // -- Cleanup: nightly, no std --
        #[cfg(not(feature = "std"))]
        mod tlab_cleanup {
            pub(super) fn register() {}
        }
    } else if #[cfg(feature = "std")] {
        struct TlabCell(core::cell::UnsafeCell<Tlab>);

        unsafe impl Sync for TlabCell {}

        impl Drop for TlabCell {
            fn drop(&mut self) {
                unsafe { (*self.0.get()).flush_and_destroy(&GLOBAL_HEAP) };
            }
        }

        std::thread_local! {
            static TLAB_CELL: TlabCell = const {
                TlabCell(core::cell::UnsafeCell::new(Tlab::new_const()))
            };
        }
    }
}

/// Hoard-style tiered allocator for Rust.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: hoardalloc::HoardMalloc = hoardalloc::HoardMalloc;
/// ```
pub struct HoardMalloc;

unsafe impl GlobalAlloc for HoardMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        if !PROCESS_BOOTSTRAPPED.swap(true, Ordering::AcqRel) {
            return bootstrap::alloc(size, layout.align());
        }

        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);
        hist_record!(size);

        let align = layout.align();

        if align <= 8 {
            if !size_class::is_large(size) {
                let (class, _) = size_class::class_of(size);
                return unsafe { self.alloc_small(class) };
            }
        } else if align <= HEADER_SIZE {
            // A block's address is `data_start + k*block_size`, and
            // `data_start` is only guaranteed aligned to `HEADER_SIZE`
            // (the superblock base is SB_SIZE-aligned, but the header
            // itself need not be a multiple of every larger `align`). So
            // this path is only sound when `align` divides the header size
            // too, which every power-of-two `align <= HEADER_SIZE` does.
            let effective_size = size.max(align);
            if !size_class::is_large(effective_size) {
                let (class, block_size) = size_class::class_of(effective_size);
                if block_size.is_multiple_of(align) {
                    return unsafe { self.alloc_small(class) };
                }
            }
        }

        unsafe { self.alloc_large(size, align) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        stat_inc!(dealloc_count);

        // Never trust layout.size() for routing: realloc may have kept the
        // same block for a shrink that didn't cross a size-class boundary,
        // so the caller's layout can carry a smaller size than the block's
        // real home. Ask the pointer itself instead, the same way the
        // teacher's dealloc distrusts its layout argument and asks the
        // page map.
        if bootstrap::owns(ptr) {
            bootstrap::dealloc(ptr, layout.size());
            return;
        }

        if let Some(info) = big_block::BIG_BLOCKS.remove(ptr) {
            unsafe { self.dealloc_large(info) };
            return;
        }

        let sb = unsafe { Superblock::header_of(ptr) };
        let class = unsafe { (*sb).size_class };
        unsafe { self.dealloc_small(ptr, class) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }

        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        stat_inc!(realloc_count);

        if bootstrap::owns(ptr) {
            // The arena never tracks individual allocation sizes, only the
            // bump offset; fall back to the caller's layout for how much to
            // copy, matching the teacher's defensive fallback when metadata
            // for a pointer isn't available.
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            let new_ptr = unsafe { self.alloc(new_layout) };
            if !new_ptr.is_null() {
                unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
            }
            return new_ptr;
        }

        if let Some(info) = big_block::BIG_BLOCKS.remove(ptr) {
            let new_layout =
                unsafe { Layout::from_size_align_unchecked(new_size, info.align.max(layout.align())) };
            let new_ptr = unsafe { self.alloc(new_layout) };
            if !new_ptr.is_null() {
                unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, info.size.min(new_size)) };
                unsafe { self.dealloc_large(info) };
            } else {
                // Allocation failed: put the entry back so `ptr` is still valid.
                big_block::BIG_BLOCKS.insert(
                    ptr,
                    info.size,
                    info.align,
                    info.alloc_base as *mut u8,
                    info.alloc_size,
                );
            }
            return new_ptr;
        }

        // Look up the REAL usable size from the superblock header, like
        // tcmalloc looks it up from span metadata: a prior realloc may have
        // returned this same pointer for an in-place shrink, so the
        // caller's layout can be smaller than the block's actual size class.
        let sb = unsafe { Superblock::header_of(ptr) };
        let class = unsafe { (*sb).size_class };
        let old_usable = size_class::class_to_size(class);

        // Fits in the current block — return the same pointer.
        if new_size <= old_usable {
            return ptr;
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
            unsafe { self.dealloc_small(ptr, class) };
        }
        new_ptr
    }
}

impl HoardMalloc {
    cfg_if::cfg_if! {
        if #[cfg(feature = "nightly")] {
            #[inline(always)]
            unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
                if unsafe { TLAB.state } == TlsState::Active {
                    return unsafe { (*tlab_ptr()).allocate(class, &GLOBAL_HEAP) };
                }
                unsafe { self.alloc_small_slow(class) }
            }

            #[cold]
            #[inline(never)]
            unsafe fn alloc_small_slow(&self, class: usize) -> *mut u8 {
                if unsafe { TLAB.state } == TlsState::Uninitialized {
                    unsafe { tlab_init() };
                    return unsafe { (*tlab_ptr()).allocate(class, &GLOBAL_HEAP) };
                }
                // TLAB.state == Destroyed: this thread's cache was already
                // flushed and unbound during shutdown, and there is
                // nothing to reinitialize this late. Serve from the
                // bootstrap arena, same as any other allocation with no
                // live TLAB behind it.
                let size = size_class::class_to_size(class);
                bootstrap::alloc(size, size)
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
                if unsafe { TLAB.state } == TlsState::Active {
                    unsafe { (*tlab_ptr()).deallocate(ptr, class, &GLOBAL_HEAP) };
                    return;
                }
                unsafe { self.dealloc_to_fallback(ptr, class) };
            }
        } else if #[cfg(feature = "std")] {
            #[inline(always)]
            unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
                match TLAB_CELL.try_with(|cell| unsafe {
                    (*cell.0.get()).allocate(class, &GLOBAL_HEAP)
                }) {
                    Ok(ptr) => ptr,
                    Err(_) => {
                        // This thread's TLS is already torn down
                        // (shutdown): there is no TLAB to allocate from
                        // and none can be created this late, so fall back
                        // to the bootstrap arena.
                        let size = size_class::class_to_size(class);
                        bootstrap::alloc(size, size)
                    }
                }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
                if TLAB_CELL
                    .try_with(|cell| unsafe { (*cell.0.get()).deallocate(ptr, class, &GLOBAL_HEAP) })
                    .is_err()
                {
                    unsafe { self.dealloc_to_fallback(ptr, class) };
                }
            }
        } else {
            #[inline(always)]
            unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
                unsafe { self.alloc_from_fallback(class) }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
                unsafe { self.dealloc_to_fallback(ptr, class) };
            }
        }
    }

    /// Routes directly through `LOCAL_HEAPS[0]` with no TLAB involved.
    /// Taken only when no TLS feature is enabled at all — this crate's
    /// permanent no-TLAB mode, not a transient TLS-unavailable case (those
    /// go through the bootstrap arena instead, see `alloc_small_slow`).
    unsafe fn alloc_from_fallback(&self, class: usize) -> *mut u8 {
        local_heap::LOCAL_HEAPS[0].malloc(class, &GLOBAL_HEAP)
    }

    unsafe fn dealloc_to_fallback(&self, ptr: *mut u8, class: usize) {
        let _ = class;
        let sb = unsafe { Superblock::header_of(ptr) };
        local_heap::free_block(sb, ptr, &GLOBAL_HEAP);
    }

    /// Allocate a big block (either `> S_MAX`, or over-aligned beyond what a
    /// superblock's size class can satisfy) directly from the OS, bypassing
    /// every heap tier, and register it in the big-block registry.
    unsafe fn alloc_large(&self, size: usize, align: usize) -> *mut u8 {
        stat_inc!(big_block_allocs);

        // `platform::page_alloc` already guarantees SB_SIZE alignment, so
        // requests at or below that need no further trimming. For anything
        // more aligned, over-allocate by a full `align` and carve the
        // aligned pointer out of it; the registry's alloc_base/alloc_size
        // remember the untrimmed region so dealloc can release it whole.
        let (alloc_size, raw) = if align <= SB_SIZE {
            (size, unsafe { platform::page_alloc(size) })
        } else {
            let total = size + align;
            (total, unsafe { platform::page_alloc(total) })
        };
        if raw.is_null() {
            crate::fatal_abort("out of memory: PageSource exhausted");
        }

        let raw_addr = raw as usize;
        let aligned_addr = (raw_addr + align - 1) & !(align - 1);
        let user_ptr = aligned_addr as *mut u8;

        if !big_block::BIG_BLOCKS.insert(user_ptr, size, align, raw, alloc_size) {
            unsafe { platform::page_dealloc(raw, alloc_size) };
            return ptr::null_mut();
        }
        user_ptr
    }

    unsafe fn dealloc_large(&self, info: BigBlockInfo) {
        unsafe { platform::page_dealloc(info.alloc_base as *mut u8, info.alloc_size) };
    }

    /// `aligned_alloc(align, size)`: like `alloc`, but named and typed the
    /// way a C caller expects, and rejecting the invalid-layout case with a
    /// null return instead of a panic.
    ///
    /// # Safety
    /// Same contract as `GlobalAlloc::alloc`.
    pub unsafe fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8 {
        match Layout::from_size_align(size, align) {
            Ok(layout) => unsafe { self.alloc(layout) },
            Err(_) => ptr::null_mut(),
        }
    }

    /// `usable_size(p)`: the real capacity backing `p`, which may exceed the
    /// size originally requested since allocations are rounded up to a size
    /// class or page.
    ///
    /// # Safety
    /// `p` must be a pointer currently live in this allocator (i.e. returned
    /// by `alloc`/`alloc_zeroed`/`realloc` and not yet freed).
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if bootstrap::owns(ptr) {
            // The bump arena never records individual allocation sizes, only
            // the running offset, so there is nothing to report here; callers
            // querying a bootstrap-arena pointer only ever do so before a
            // thread's TLAB exists, which is not where usable_size matters.
            return 0;
        }
        if let Some(info) = big_block::BIG_BLOCKS.lookup(ptr) {
            return info.size;
        }
        let sb = unsafe { Superblock::header_of(ptr) };
        let class = unsafe { (*sb).size_class };
        size_class::class_to_size(class)
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for HoardMalloc {
    fn allocate(
        &self,
        layout: Layout,
    ) -> Result<core::ptr::NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        if ptr.is_null() {
            Err(core::alloc::AllocError)
        } else {
            let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
            Ok(unsafe { core::ptr::NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}
