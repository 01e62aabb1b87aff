pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_SIZE_64K: u64 = 0x10000;
pub const CACHE_LINE_SIZE: u64 = 64;

/// Bytes the command streamer may prefetch past the last executed command.
pub const CS_OVERFETCH_SIZE: u64 = PAGE_SIZE;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0. Overflowing inputs saturate to the largest aligned value.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value / alignment * alignment
}

pub fn is_aligned(value: u64, alignment: u64) -> bool {
    alignment != 0 && value % alignment == 0
}
