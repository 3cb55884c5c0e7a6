//! C-ABI exports for external linking (e.g., from bench via build.rs).
//!
//! Gated behind `features = ["ffi"]`. Built as part of the staticlib.
//! With `testing` feature, export names are prefixed by variant:
//!   - `nightly` → `hoardalloc_nightly_*`
//!   - `std`     → `hoardalloc_std_*`
//!   - neither   → `hoardalloc_nostd_*`
//! Without `testing`, exports plain `hoardalloc_*` names.

use crate::allocator::HoardMalloc;
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: HoardMalloc = HoardMalloc;

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "hoardalloc_nightly_alloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "hoardalloc_std_alloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "hoardalloc_nostd_alloc")
)]
pub unsafe extern "C" fn hoardalloc_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.alloc(layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "hoardalloc_nightly_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "hoardalloc_std_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "hoardalloc_nostd_dealloc")
)]
pub unsafe extern "C" fn hoardalloc_dealloc(ptr: *mut u8, size: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.dealloc(ptr, layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "hoardalloc_nightly_realloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "hoardalloc_std_realloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "hoardalloc_nostd_realloc")
)]
pub unsafe extern "C" fn hoardalloc_realloc(
    ptr: *mut u8,
    size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.realloc(ptr, layout, new_size) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "hoardalloc_nightly_aligned_alloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "hoardalloc_std_aligned_alloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "hoardalloc_nostd_aligned_alloc")
)]
pub unsafe extern "C" fn hoardalloc_aligned_alloc(align: usize, size: usize) -> *mut u8 {
    unsafe { ALLOC.aligned_alloc(align, size) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "hoardalloc_nightly_usable_size")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "hoardalloc_std_usable_size")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "hoardalloc_nostd_usable_size")
)]
pub unsafe extern "C" fn hoardalloc_usable_size(ptr: *mut u8) -> usize {
    unsafe { ALLOC.usable_size(ptr) }
}
