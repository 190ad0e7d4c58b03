//! Offsets on the wire are aligned to the natural size of the value that
//! follows: 1, 2, 4 or 8 bytes.

/// Rounds `offset` up to a multiple of `alignment`, a power of two.
pub(crate) fn align(offset: usize, alignment: usize) -> usize {
    offset + padding(offset, alignment)
}

/// The number of zero bytes needed after `offset` to reach `alignment`.
pub(crate) fn padding(offset: usize, alignment: usize) -> usize {
    debug_assert!(
        alignment.is_power_of_two() && alignment <= 8,
        "{} is not a D-Bus alignment",
        alignment
    );
    offset.wrapping_neg() & (alignment - 1)
}
