//! Broadcast transmitter: the single-writer half of the event channel
//!
//! Owned by the driver; carried here for the in-process driver used by
//! tests and tooling, and because the record layout is one contract shared
//! by both halves. The writer signals its intent (tail-intent counter)
//! before touching any record bytes so readers can always detect a
//! concurrent overwrite, then publishes the new tail last.

use crate::broadcast::{
    check_capacity, LATEST_COUNTER_OFFSET, PADDING_MSG_TYPE_ID, RECORD_HEADER_LENGTH,
    RECORD_LENGTH_OFFSET, RECORD_TYPE_OFFSET, RECORD_ALIGNMENT, TAIL_COUNTER_OFFSET,
    TAIL_INTENT_COUNTER_OFFSET,
};
use crate::buffer::{align, AtomicBuffer};
use crate::error::Result;

/// Single-writer transmitter over a broadcast buffer (data section plus
/// trailer).
pub struct BroadcastTransmitter {
    buffer: AtomicBuffer,
    capacity: i32,
    mask: i64,
    max_msg_length: i32,
    tail_intent_index: i32,
    tail_index: i32,
    latest_index: i32,
}

impl BroadcastTransmitter {
    /// Wrap a broadcast buffer, validating its capacity.
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let capacity = check_capacity(buffer.capacity())?;
        Ok(Self {
            buffer,
            capacity,
            mask: capacity as i64 - 1,
            max_msg_length: capacity / 8,
            tail_intent_index: capacity + TAIL_INTENT_COUNTER_OFFSET,
            tail_index: capacity + TAIL_COUNTER_OFFSET,
            latest_index: capacity + LATEST_COUNTER_OFFSET,
        })
    }

    /// Data-section capacity in bytes.
    pub fn capacity(&self) -> i32 {
        self.capacity
    }

    /// Largest message this ring accepts.
    pub fn max_msg_length(&self) -> i32 {
        self.max_msg_length
    }

    /// Transmit one message to all attached readers.
    pub fn transmit(&self, msg_type_id: i32, msg: &[u8]) {
        assert!(
            msg_type_id != PADDING_MSG_TYPE_ID && msg_type_id > 0,
            "invalid message type id {}",
            msg_type_id
        );
        assert!(
            msg.len() as i32 <= self.max_msg_length,
            "message of {} bytes exceeds broadcast max of {}",
            msg.len(),
            self.max_msg_length
        );

        let record_length = msg.len() as i32 + RECORD_HEADER_LENGTH;
        let aligned_length = align(record_length, RECORD_ALIGNMENT);

        let mut tail = self.buffer.get_i64(self.tail_index);
        let mut record_offset = (tail & self.mask) as i32;
        let to_end = self.capacity - record_offset;

        if to_end < aligned_length {
            // Forced wrap: pad to the end, record goes at the start.
            self.buffer.put_i64_ordered(
                self.tail_intent_index,
                tail + (to_end + aligned_length) as i64,
            );
            self.buffer
                .put_i32(record_offset + RECORD_LENGTH_OFFSET, to_end);
            self.buffer
                .put_i32(record_offset + RECORD_TYPE_OFFSET, PADDING_MSG_TYPE_ID);
            tail += to_end as i64;
            record_offset = 0;
        } else {
            self.buffer
                .put_i64_ordered(self.tail_intent_index, tail + aligned_length as i64);
        }

        self.buffer
            .put_i32(record_offset + RECORD_LENGTH_OFFSET, record_length);
        self.buffer
            .put_i32(record_offset + RECORD_TYPE_OFFSET, msg_type_id);
        self.buffer
            .put_bytes(record_offset + RECORD_HEADER_LENGTH, msg);

        self.buffer.put_i64(self.latest_index, tail);
        self.buffer
            .put_i64_ordered(self.tail_index, tail + aligned_length as i64);
    }
}
