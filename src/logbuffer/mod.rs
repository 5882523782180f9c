//! Term log buffer layout and rotation
//!
//! A log buffer file holds three equal term partitions, one 64-byte tail
//! block per term, and a shared metadata trailer:
//!
//! ```text
//! [ term 0 ][ term 1 ][ term 2 ]
//! [ tail block 0 ][ tail block 1 ][ tail block 2 ]
//! [ log metadata trailer ]
//! ```
//!
//! Each tail block carries a packed `(termId << 32) | termOffset` counter
//! that writers advance to reserve space. The trailer carries the
//! active-term-count, initial term id, MTU, term length, connected flag and
//! the default frame header bytes. All fields are little-endian; the layout
//! is a compatibility contract with the driver.

pub mod appender;
pub mod assembler;
pub mod exclusive;
pub mod frame;
pub mod reader;

use crate::buffer::AtomicBuffer;
use crate::error::{ClientError, Result};

/// Number of term partitions in a log.
pub const PARTITION_COUNT: usize = 3;

/// Minimum term length in bytes.
pub const TERM_MIN_LENGTH: i32 = 64 * 1024;

/// Maximum term length in bytes.
pub const TERM_MAX_LENGTH: i32 = 1 << 30;

/// Length of one per-term tail block (a cache line of headroom around the
/// packed tail counter).
pub const TERM_TAIL_BLOCK_LENGTH: i32 = 64;

/// Offset of the packed raw tail within a tail block.
pub const TERM_TAIL_COUNTER_OFFSET: i32 = 0;

/// Length of the log metadata trailer.
pub const LOG_META_DATA_LENGTH: i32 = 256;

/// Trailer offset: active term count (i32, ordered).
pub const LOG_ACTIVE_TERM_COUNT_OFFSET: i32 = 0;
/// Trailer offset: connected flag written by the driver (i32).
pub const LOG_IS_CONNECTED_OFFSET: i32 = 4;
/// Trailer offset: initial term id (i32).
pub const LOG_INITIAL_TERM_ID_OFFSET: i32 = 8;
/// Trailer offset: MTU length (i32).
pub const LOG_MTU_LENGTH_OFFSET: i32 = 12;
/// Trailer offset: term length (i32).
pub const LOG_TERM_LENGTH_OFFSET: i32 = 16;
/// Trailer offset: time of last status message, epoch ms (i64).
pub const LOG_TIME_OF_LAST_SM_OFFSET: i32 = 24;
/// Trailer offset: default frame header bytes.
pub const LOG_DEFAULT_FRAME_HEADER_OFFSET: i32 = 64;

/// Validate a term length: power of two within [64 KiB, 1 GiB].
pub fn check_term_length(term_length: i32) -> Result<()> {
    if term_length < TERM_MIN_LENGTH
        || term_length > TERM_MAX_LENGTH
        || !(term_length as u32).is_power_of_two()
    {
        return Err(ClientError::InvalidBuffer(format!(
            "term length {} must be a power of 2 in [{}, {}]",
            term_length, TERM_MIN_LENGTH, TERM_MAX_LENGTH
        )));
    }
    Ok(())
}

/// Total file length for a log with the given term length.
pub const fn compute_log_length(term_length: i32) -> u64 {
    (PARTITION_COUNT as u64) * (term_length as u64)
        + (PARTITION_COUNT as u64) * (TERM_TAIL_BLOCK_LENGTH as u64)
        + LOG_META_DATA_LENGTH as u64
}

/// Partition index active for a given term count.
#[inline]
pub const fn index_by_term_count(term_count: i32) -> usize {
    (term_count as usize) % PARTITION_COUNT
}

/// Partition index containing a given stream position.
#[inline]
pub const fn index_by_position(position: i64, position_bits_to_shift: i32) -> usize {
    (((position >> position_bits_to_shift) as u64) % (PARTITION_COUNT as u64)) as usize
}

/// Pack a (term id, term offset) pair into a raw tail value.
#[inline]
pub const fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as i64 & 0xFFFF_FFFF)
}

/// Term id half of a raw tail.
#[inline]
pub const fn term_id_from_raw_tail(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Term offset half of a raw tail, clamped to the term length. Concurrent
/// writers can push the raw offset arbitrarily past the end of the term.
#[inline]
pub fn term_offset_from_raw_tail(raw_tail: i64, term_length: i32) -> i32 {
    let offset = raw_tail & 0xFFFF_FFFF;
    offset.min(term_length as i64) as i32
}

/// Highest stream position representable with the given term length.
#[inline]
pub const fn max_possible_position(term_length: i32) -> i64 {
    (term_length as i64) << 31
}

/// Volatile read of the active term count.
#[inline]
pub fn active_term_count(meta: &AtomicBuffer) -> i32 {
    meta.get_i32_volatile(LOG_ACTIVE_TERM_COUNT_OFFSET)
}

/// Initial term id recorded at log creation.
#[inline]
pub fn initial_term_id(meta: &AtomicBuffer) -> i32 {
    meta.get_i32(LOG_INITIAL_TERM_ID_OFFSET)
}

/// MTU length recorded at log creation.
#[inline]
pub fn mtu_length(meta: &AtomicBuffer) -> i32 {
    meta.get_i32(LOG_MTU_LENGTH_OFFSET)
}

/// Whether the driver has observed a connected subscriber.
#[inline]
pub fn is_connected(meta: &AtomicBuffer) -> bool {
    meta.get_i32_volatile(LOG_IS_CONNECTED_OFFSET) == 1
}

/// Driver-side setter for the connected flag.
#[inline]
pub fn set_is_connected(meta: &AtomicBuffer, connected: bool) {
    meta.put_i32_ordered(LOG_IS_CONNECTED_OFFSET, if connected { 1 } else { 0 });
}

/// Rotate the log to the next term.
///
/// The next partition's tail is initialised to `(termId + 1, 0)` with a CAS
/// from its expected stale value, then the active term count is advanced so
/// new writers pick up the fresh partition. Safe to race from multiple
/// writers: losers observe the already-updated tail or term count and their
/// CASes become no-ops.
pub fn rotate_log(
    tail_blocks: &[AtomicBuffer; PARTITION_COUNT],
    meta: &AtomicBuffer,
    current_term_count: i32,
    current_term_id: i32,
) {
    let next_term_id = current_term_id + 1;
    let next_term_count = current_term_count + 1;
    let next_index = index_by_term_count(next_term_count);
    let expected_term_id = next_term_id - PARTITION_COUNT as i32;
    let tail = &tail_blocks[next_index];

    loop {
        let raw_tail = tail.get_i64_volatile(TERM_TAIL_COUNTER_OFFSET);
        if term_id_from_raw_tail(raw_tail) != expected_term_id {
            break;
        }
        if tail.compare_and_set_i64(
            TERM_TAIL_COUNTER_OFFSET,
            raw_tail,
            pack_tail(next_term_id, 0),
        ) {
            break;
        }
    }

    meta.compare_and_set_i32(
        LOG_ACTIVE_TERM_COUNT_OFFSET,
        current_term_count,
        next_term_count,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_length_validation() {
        assert!(check_term_length(64 * 1024).is_ok());
        assert!(check_term_length(1 << 30).is_ok());
        assert!(check_term_length(64 * 1024 + 1).is_err());
        assert!(check_term_length(32 * 1024).is_err());
        assert!(check_term_length(0).is_err());
    }

    #[test]
    fn test_tail_packing() {
        let raw = pack_tail(77, 4096);
        assert_eq!(term_id_from_raw_tail(raw), 77);
        assert_eq!(term_offset_from_raw_tail(raw, 64 * 1024), 4096);

        // Overshoot past the term end is clamped.
        let overshoot = pack_tail(77, 64 * 1024 + 512);
        assert_eq!(term_offset_from_raw_tail(overshoot, 64 * 1024), 64 * 1024);

        // Negative term ids survive the round trip.
        let negative = pack_tail(-5, 128);
        assert_eq!(term_id_from_raw_tail(negative), -5);
        assert_eq!(term_offset_from_raw_tail(negative, 64 * 1024), 128);
    }

    #[test]
    fn test_partition_indexing() {
        assert_eq!(index_by_term_count(0), 0);
        assert_eq!(index_by_term_count(1), 1);
        assert_eq!(index_by_term_count(2), 2);
        assert_eq!(index_by_term_count(3), 0);

        let bits = crate::position::position_bits_to_shift(64 * 1024);
        assert_eq!(index_by_position(0, bits), 0);
        assert_eq!(index_by_position(64 * 1024, bits), 1);
        assert_eq!(index_by_position(3 * 64 * 1024, bits), 0);
    }

    #[test]
    fn test_rotate_log() {
        let mut tail_backing: Vec<Vec<u8>> = (0..PARTITION_COUNT).map(|_| vec![0u8; 64]).collect();
        let mut meta_backing = vec![0u8; LOG_META_DATA_LENGTH as usize];
        let meta = AtomicBuffer::wrap_slice(&mut meta_backing);

        let initial_term_id = 100;
        let tails: Vec<AtomicBuffer> = tail_backing
            .iter_mut()
            .map(|b| AtomicBuffer::wrap_slice(b))
            .collect();
        let tails: [AtomicBuffer; PARTITION_COUNT] = [tails[0], tails[1], tails[2]];

        tails[0].put_i64(0, pack_tail(initial_term_id, 512));
        tails[1].put_i64(0, pack_tail(initial_term_id + 1 - 3, 0));
        tails[2].put_i64(0, pack_tail(initial_term_id + 2 - 3, 0));
        meta.put_i32(LOG_INITIAL_TERM_ID_OFFSET, initial_term_id);

        rotate_log(&tails, &meta, 0, initial_term_id);

        assert_eq!(active_term_count(&meta), 1);
        let next_raw = tails[1].get_i64(0);
        assert_eq!(term_id_from_raw_tail(next_raw), initial_term_id + 1);
        assert_eq!(term_offset_from_raw_tail(next_raw, TERM_MIN_LENGTH), 0);

        // Rotating again with stale arguments must not double-advance.
        rotate_log(&tails, &meta, 0, initial_term_id);
        assert_eq!(active_term_count(&meta), 1);
    }
}
