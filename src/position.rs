//! Stream position arithmetic
//!
//! A position is a 63-bit non-negative logical byte offset into an
//! unbounded stream. It decomposes into a (term id, term offset) pair
//! relative to the stream's initial term id, with the term length a power
//! of two so the split is a shift and a mask:
//!
//! ```text
//! position = ((termId - initialTermId) << positionBitsToShift) + termOffset
//! ```

/// Number of bits to shift when converting between positions and term ids.
///
/// The term length must be a power of two (validated at log-buffer
/// construction).
#[inline]
pub const fn position_bits_to_shift(term_length: i32) -> i32 {
    term_length.trailing_zeros() as i32
}

/// Compute the stream position for a (term id, term offset) pair.
#[inline]
pub const fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: i32,
    initial_term_id: i32,
) -> i64 {
    compute_term_begin_position(term_id, position_bits_to_shift, initial_term_id)
        + term_offset as i64
}

/// Compute the stream position at which a term begins.
#[inline]
pub const fn compute_term_begin_position(
    term_id: i32,
    position_bits_to_shift: i32,
    initial_term_id: i32,
) -> i64 {
    // The term count may exceed i32 range once scaled, so widen first.
    ((term_id as i64) - (initial_term_id as i64)) << position_bits_to_shift
}

/// Recover the term id containing a stream position.
#[inline]
pub const fn compute_term_id_from_position(
    position: i64,
    position_bits_to_shift: i32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) + initial_term_id as i64) as i32
}

/// Recover the offset within its term of a stream position.
#[inline]
pub const fn compute_term_offset_from_position(position: i64, position_bits_to_shift: i32) -> i32 {
    (position & ((1i64 << position_bits_to_shift) - 1)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERM_LENGTH: i32 = 64 * 1024;

    #[test]
    fn test_bits_for_term_length() {
        assert_eq!(position_bits_to_shift(64 * 1024), 16);
        assert_eq!(position_bits_to_shift(1 << 30), 30);
    }

    #[test]
    fn test_position_round_trip() {
        let bits = position_bits_to_shift(TERM_LENGTH);
        let initial_term_id = -776;

        for term_delta in [0, 1, 5, 1000] {
            let term_id = initial_term_id + term_delta;
            for term_offset in [0, 64, TERM_LENGTH - 32] {
                let position = compute_position(term_id, term_offset, bits, initial_term_id);
                assert_eq!(
                    compute_term_id_from_position(position, bits, initial_term_id),
                    term_id
                );
                assert_eq!(compute_term_offset_from_position(position, bits), term_offset);
            }
        }
    }

    #[test]
    fn test_term_begin_position_grows_by_term_length() {
        let bits = position_bits_to_shift(TERM_LENGTH);
        let base = compute_term_begin_position(10, bits, 10);
        assert_eq!(base, 0);
        assert_eq!(
            compute_term_begin_position(11, bits, 10),
            TERM_LENGTH as i64
        );
        assert_eq!(
            compute_term_begin_position(12, bits, 10),
            2 * TERM_LENGTH as i64
        );
    }

    #[test]
    fn test_position_spans_past_i32_terms() {
        let bits = position_bits_to_shift(1 << 30);
        let position = compute_position(i32::MAX, 0, bits, 0);
        assert!(position > 0);
    }
}
