//! Broadcast receiver: one reader's private cursor over the event channel
//!
//! Each reader owns its cursor state outright; nothing in the shared ring
//! is ever mutated by a reader. A reader that stalls long enough for the
//! writer to advance a full capacity past its cursor has been lapped: the
//! bytes under the cursor may already be overwritten, so the cursor jumps
//! forward to the writer's latest record and a loss counter increments.

use crate::broadcast::{
    check_capacity, LATEST_COUNTER_OFFSET, PADDING_MSG_TYPE_ID, RECORD_ALIGNMENT,
    RECORD_HEADER_LENGTH, RECORD_LENGTH_OFFSET, RECORD_TYPE_OFFSET, TAIL_COUNTER_OFFSET,
    TAIL_INTENT_COUNTER_OFFSET,
};
use crate::buffer::{align, AtomicBuffer};
use crate::error::Result;
use std::sync::atomic;

/// A reader over a broadcast buffer. Confine to one thread; clone state is
/// deliberately not shareable.
pub struct BroadcastReceiver {
    buffer: AtomicBuffer,
    capacity: i32,
    mask: i64,
    tail_intent_index: i32,
    tail_index: i32,
    latest_index: i32,
    cursor: i64,
    next_record: i64,
    record_offset: i32,
    lapped_count: u64,
}

impl BroadcastReceiver {
    /// Attach to a broadcast buffer, starting at the current tail
    /// (only records transmitted after attach are observed).
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let capacity = check_capacity(buffer.capacity())?;
        let tail_index = capacity + TAIL_COUNTER_OFFSET;
        let cursor = buffer.get_i64_volatile(tail_index);
        Ok(Self {
            buffer,
            capacity,
            mask: capacity as i64 - 1,
            tail_intent_index: capacity + TAIL_INTENT_COUNTER_OFFSET,
            tail_index,
            latest_index: capacity + LATEST_COUNTER_OFFSET,
            cursor,
            next_record: cursor,
            record_offset: (cursor & (capacity as i64 - 1)) as i32,
            lapped_count: 0,
        })
    }

    /// Number of times this receiver has been lapped by the writer.
    pub fn lapped_count(&self) -> u64 {
        self.lapped_count
    }

    /// Advance to the next available record, if any.
    pub fn receive_next(&mut self) -> bool {
        let tail = self.buffer.get_i64_volatile(self.tail_index);
        let mut cursor = self.next_record;

        if tail <= cursor {
            return false;
        }

        let mut record_offset = (cursor & self.mask) as i32;

        if !self.validate_at(cursor) {
            self.lapped_count += 1;
            cursor = self.buffer.get_i64(self.latest_index);
            record_offset = (cursor & self.mask) as i32;
        }

        self.cursor = cursor;
        self.next_record = cursor
            + align(
                self.buffer.get_i32(record_offset + RECORD_LENGTH_OFFSET),
                RECORD_ALIGNMENT,
            ) as i64;

        if self.buffer.get_i32(record_offset + RECORD_TYPE_OFFSET) == PADDING_MSG_TYPE_ID {
            record_offset = 0;
            self.cursor = self.next_record;
            self.next_record += align(
                self.buffer.get_i32(RECORD_LENGTH_OFFSET),
                RECORD_ALIGNMENT,
            ) as i64;
        }

        self.record_offset = record_offset;
        true
    }

    /// Type id of the current record.
    pub fn type_id(&self) -> i32 {
        self.buffer.get_i32(self.record_offset + RECORD_TYPE_OFFSET)
    }

    /// Payload length of the current record.
    pub fn length(&self) -> i32 {
        self.buffer.get_i32(self.record_offset + RECORD_LENGTH_OFFSET) - RECORD_HEADER_LENGTH
    }

    /// Copy the current record's payload out of the ring.
    pub fn copy_out(&self, dst: &mut [u8]) {
        self.buffer
            .get_bytes(self.record_offset + RECORD_HEADER_LENGTH, dst);
    }

    /// Re-validate that the current record has not been overwritten.
    ///
    /// The fence keeps the validation load from reordering before any copy
    /// the caller just performed.
    pub fn validate(&self) -> bool {
        atomic::fence(atomic::Ordering::Acquire);
        self.validate_at(self.cursor)
    }

    fn validate_at(&self, cursor: i64) -> bool {
        cursor + self.capacity as i64
            > self.buffer.get_i64_volatile(self.tail_intent_index)
    }
}
