//! Broadcast channel: single writer, many independent readers
//!
//! The driver publishes asynchronous events to every connected client over
//! a fixed-capacity ring with a trailer of three counters:
//!
//! ```text
//! [ data section : power-of-two capacity ]
//! [ tail-intent : i64 ][ tail : i64 ][ latest record : i64 ]
//! ```
//!
//! The tail-intent counter leads the published tail and marks the region
//! the writer is about to overwrite; readers compare their private cursor
//! against it to detect being lapped. Records are `[length:i32][type:i32]`
//! headers plus payload, 8-byte aligned, with a dedicated padding type
//! marking a forced wrap to the start of the ring.

pub mod copy_receiver;
pub mod receiver;
pub mod transmitter;

pub use copy_receiver::CopyBroadcastReceiver;
pub use receiver::BroadcastReceiver;
pub use transmitter::BroadcastTransmitter;

use crate::error::{ClientError, Result};

/// Trailer offset of the tail-intent counter, relative to the data section end.
pub const TAIL_INTENT_COUNTER_OFFSET: i32 = 0;
/// Trailer offset of the published tail counter.
pub const TAIL_COUNTER_OFFSET: i32 = 8;
/// Trailer offset of the latest-record pointer.
pub const LATEST_COUNTER_OFFSET: i32 = 16;
/// Total trailer length appended after the data section.
pub const TRAILER_LENGTH: i32 = 128;

/// Record offset of the length field.
pub const RECORD_LENGTH_OFFSET: i32 = 0;
/// Record offset of the type id field.
pub const RECORD_TYPE_OFFSET: i32 = 4;
/// Record header length.
pub const RECORD_HEADER_LENGTH: i32 = 8;
/// Record alignment.
pub const RECORD_ALIGNMENT: i32 = 8;
/// Type id of padding records marking a forced wraparound.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Validate a broadcast buffer: power-of-two data section plus trailer.
pub fn check_capacity(total_length: i32) -> Result<i32> {
    let capacity = total_length - TRAILER_LENGTH;
    if capacity <= 0 || !(capacity as u32).is_power_of_two() {
        return Err(ClientError::InvalidBuffer(format!(
            "broadcast buffer data section must be a positive power of two, got {}",
            capacity
        )));
    }
    Ok(capacity)
}
