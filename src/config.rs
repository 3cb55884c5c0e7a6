//! Compile-time configuration, generated by `build.rs` from
//! `hoardalloc.toml` (or the file named by `HOARDALLOC_CONFIG`).

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Bitmask for extracting the offset within a superblock from an address
/// (`addr & SB_MASK`) or the base (`addr & !SB_MASK`).
pub const SB_MASK: usize = SB_SIZE - 1;

/// Round a size up to a multiple of the superblock size.
pub const fn round_up_to_sb(size: usize) -> usize {
    (size + SB_MASK) & !SB_MASK
}

/// Resolve the number of LocalHeaps to create: the configured value, or
/// 2x the available parallelism if `DEFAULT_LOCAL_HEAP_COUNT` is 0.
pub fn local_heap_count() -> usize {
    if DEFAULT_LOCAL_HEAP_COUNT != 0 {
        return DEFAULT_LOCAL_HEAP_COUNT;
    }
    #[cfg(feature = "std")]
    {
        std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(8)
    }
    #[cfg(not(feature = "std"))]
    {
        8
    }
}
