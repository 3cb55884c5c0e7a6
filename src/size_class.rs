//! Size class table: maps a requested allocation size to a size class
//! index and the block size actually handed out for that class.
//!
//! Classes are generated at build time from `hoardalloc.toml` into
//! `SIZE_CLASSES` (see `build.rs`). Class 0 is an unused sentinel so that
//! index 0 can mean "no class" where useful.

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

use crate::config::S_MAX;

pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

#[derive(Clone, Copy, Debug)]
pub struct SizeClassInfo {
    pub size: usize,
    pub batch_size: usize,
}

const SMALL_LOOKUP_MAX: usize = 1024;

/// `SMALL_LOOKUP[i]` is the class index for requests in
/// `((i-1)*8, i*8]` bytes, for `i` in `1..=128`. Built once at startup
/// since `SIZE_CLASSES` is itself generated data, not a `const` array we
/// can evaluate in a `const fn`.
struct SmallLookup([u8; SMALL_LOOKUP_MAX / 8 + 1]);

fn build_small_lookup() -> SmallLookup {
    let mut table = [0u8; SMALL_LOOKUP_MAX / 8 + 1];
    let mut class = 1usize;
    for (i, slot) in table.iter_mut().enumerate().skip(1) {
        let bytes = i * 8;
        while class < SIZE_CLASSES.len() && SIZE_CLASSES[class].size < bytes {
            class += 1;
        }
        *slot = class.min(u8::MAX as usize) as u8;
    }
    SmallLookup(table)
}

#[cfg(feature = "std")]
fn small_lookup() -> &'static SmallLookup {
    use std::sync::OnceLock;
    static TABLE: OnceLock<SmallLookup> = OnceLock::new();
    TABLE.get_or_init(build_small_lookup)
}

#[cfg(not(feature = "std"))]
fn small_lookup() -> &'static SmallLookup {
    use crate::sync::SpinLock;
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicBool, Ordering};

    struct Lazy {
        lock: SpinLock,
        init: AtomicBool,
        value: UnsafeCell<Option<SmallLookup>>,
    }
    unsafe impl Sync for Lazy {}

    static LAZY: Lazy = Lazy {
        lock: SpinLock::new(),
        init: AtomicBool::new(false),
        value: UnsafeCell::new(None),
    };

    if !LAZY.init.load(Ordering::Acquire) {
        LAZY.lock.lock();
        if !LAZY.init.load(Ordering::Acquire) {
            unsafe {
                *LAZY.value.get() = Some(build_small_lookup());
            }
            LAZY.init.store(true, Ordering::Release);
        }
        LAZY.lock.unlock();
    }
    unsafe { (*LAZY.value.get()).as_ref().unwrap() }
}

/// Returns `true` if `size` should bypass size classes entirely and go
/// through the big-block registry instead.
#[inline]
pub fn is_large(size: usize) -> bool {
    size > S_MAX
}

/// Maps a requested size to `(class_index, block_size)`. Callers must
/// have already checked `!is_large(size)`.
#[inline]
pub fn class_of(size: usize) -> (usize, usize) {
    debug_assert!(!is_large(size), "class_of called on a large allocation");
    let idx = if size == 0 {
        1
    } else if size <= SMALL_LOOKUP_MAX {
        small_lookup().0[(size + 7) / 8] as usize
    } else {
        // Linear scan for the handful of classes above the lookup table's
        // range; there are never more than a few dozen classes.
        let mut cls = 1;
        while cls < SIZE_CLASSES.len() && SIZE_CLASSES[cls].size < size {
            cls += 1;
        }
        cls
    };
    debug_assert!(idx > 0 && idx < SIZE_CLASSES.len(), "size {} has no class", size);
    (idx, SIZE_CLASSES[idx].size)
}

#[inline]
pub fn class_to_size(class: usize) -> usize {
    SIZE_CLASSES[class].size
}

#[inline]
pub fn class_info(class: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[class]
}

/// Number of blocks of `class`'s size that fit in one superblock, after
/// the superblock header.
#[inline]
pub fn blocks_per_superblock(class: usize) -> usize {
    let usable = crate::config::SB_SIZE - crate::superblock::HEADER_SIZE;
    usable / SIZE_CLASSES[class].size
}
