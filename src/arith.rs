//! Checked page arithmetic shared by the parser, the fault path and the
//! stack builder. Every helper takes the alignment explicitly so tests can
//! exercise page sizes other than the host's.

pub fn is_pow2(align: usize) -> bool {
    align != 0 && (align & (align - 1)) == 0
}

pub fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(is_pow2(align), "alignment is not power-of-two: {align}");
    value & !(align - 1)
}

pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(is_pow2(align), "alignment is not power-of-two: {align}");
    let add = align - 1;
    value.checked_add(add).map(|sum| sum & !add)
}

/// Offset of `value` inside its `align`-sized block.
pub fn align_offset(value: usize, align: usize) -> usize {
    debug_assert!(is_pow2(align), "alignment is not power-of-two: {align}");
    value & (align - 1)
}

/// `ceil(len / page_size)`.
pub fn page_count(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size)
}

pub fn checked_usize(value: u64) -> Option<usize> {
    usize::try_from(value).ok()
}
