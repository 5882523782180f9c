//! Many-to-one command ring: clients write, the driver reads
//!
//! A power-of-two data section followed by a trailer of cache-line-spaced
//! counters:
//!
//! ```text
//! [ data section ]
//! [ tail @0 ][ head-cache @128 ][ head @256 ]
//! [ correlation counter @384 ][ consumer heartbeat @512 ]  (768 total)
//! ```
//!
//! Writers race on the tail with a CAS claim loop; a record's length field
//! is release-stored last (negative while in flight) so the consumer never
//! observes a half-written command. Records never straddle the end of the
//! ring; a padding record fills the gap and the real record starts at zero.
//!
//! Insufficient capacity is not back-pressure here: a full command ring
//! means the driver is not draining it, which the caller must treat as a
//! fault rather than spin on.

use crate::buffer::{align, AtomicBuffer};
use crate::error::{ClientError, Result};

/// Trailer offset of the producer tail counter.
pub const TAIL_POSITION_OFFSET: i32 = 0;
/// Trailer offset of the producers' cached view of the head.
pub const HEAD_CACHE_POSITION_OFFSET: i32 = 128;
/// Trailer offset of the consumer head counter.
pub const HEAD_POSITION_OFFSET: i32 = 256;
/// Trailer offset of the correlation-id counter.
pub const CORRELATION_COUNTER_OFFSET: i32 = 384;
/// Trailer offset of the consumer heartbeat timestamp.
pub const CONSUMER_HEARTBEAT_OFFSET: i32 = 512;
/// Total trailer length appended after the data section.
pub const TRAILER_LENGTH: i32 = 768;

/// Record offset of the length field.
pub const RECORD_LENGTH_OFFSET: i32 = 0;
/// Record offset of the type id field.
pub const RECORD_TYPE_OFFSET: i32 = 4;
/// Record header length.
pub const RECORD_HEADER_LENGTH: i32 = 8;
/// Record alignment.
pub const RECORD_ALIGNMENT: i32 = 8;
/// Type id of padding records filling the gap before a forced wrap.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

fn make_header(length: i32, msg_type_id: i32) -> i64 {
    ((msg_type_id as i64) << 32) | (length as u32 as i64)
}

fn record_length(header: i64) -> i32 {
    header as i32
}

fn message_type_id(header: i64) -> i32 {
    (header >> 32) as i32
}

/// Multi-producer single-consumer ring buffer carrying driver commands.
pub struct ManyToOneRingBuffer {
    buffer: AtomicBuffer,
    capacity: i32,
    mask: i64,
    max_msg_length: i32,
    tail_index: i32,
    head_cache_index: i32,
    head_index: i32,
    correlation_index: i32,
    heartbeat_index: i32,
}

impl ManyToOneRingBuffer {
    /// Wrap a command ring buffer, validating its capacity.
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let capacity = buffer.capacity() - TRAILER_LENGTH;
        if capacity <= 0 || !(capacity as u32).is_power_of_two() {
            return Err(ClientError::InvalidBuffer(format!(
                "command ring data section must be a positive power of two, got {}",
                capacity
            )));
        }
        Ok(Self {
            buffer,
            capacity,
            mask: capacity as i64 - 1,
            max_msg_length: capacity / 8,
            tail_index: capacity + TAIL_POSITION_OFFSET,
            head_cache_index: capacity + HEAD_CACHE_POSITION_OFFSET,
            head_index: capacity + HEAD_POSITION_OFFSET,
            correlation_index: capacity + CORRELATION_COUNTER_OFFSET,
            heartbeat_index: capacity + CONSUMER_HEARTBEAT_OFFSET,
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

    /// Write one message into the ring.
    ///
    /// Safe to call from any number of producer threads concurrently.
    pub fn write(&self, msg_type_id: i32, msg: &[u8]) -> Result<()> {
        assert!(
            msg_type_id != PADDING_MSG_TYPE_ID && msg_type_id > 0,
            "invalid message type id {}",
            msg_type_id
        );
        assert!(
            msg.len() as i32 <= self.max_msg_length,
            "command of {} bytes exceeds ring max of {}",
            msg.len(),
            self.max_msg_length
        );

        let record_length = msg.len() as i32 + RECORD_HEADER_LENGTH;
        let record_index = self.claim_capacity(align(record_length, RECORD_ALIGNMENT))?;

        // Negative length marks the record in-flight until the final
        // release store below flips it positive.
        self.buffer
            .put_i64_ordered(record_index, make_header(-record_length, msg_type_id));
        self.buffer
            .put_bytes(record_index + RECORD_HEADER_LENGTH, msg);
        self.buffer
            .put_i32_ordered(record_index + RECORD_LENGTH_OFFSET, record_length);

        Ok(())
    }

    /// Read messages from the ring; single consumer only.
    ///
    /// Consumed bytes are zeroed before the head advances so producers can
    /// rely on unclaimed space reading as vacant.
    pub fn read(
        &self,
        handler: &mut dyn FnMut(i32, &[u8]),
        message_count_limit: usize,
    ) -> usize {
        let head = self.buffer.get_i64(self.head_index);
        let head_offset = (head & self.mask) as i32;
        let contiguous = self.capacity - head_offset;

        let mut bytes_read: i32 = 0;
        let mut messages_read: usize = 0;

        while bytes_read < contiguous && messages_read < message_count_limit {
            let record_index = head_offset + bytes_read;
            let header = self.buffer.get_i64_volatile(record_index);
            let record_length = record_length(header);
            if record_length <= 0 {
                break;
            }

            bytes_read += align(record_length, RECORD_ALIGNMENT);

            let msg_type_id = message_type_id(header);
            if msg_type_id == PADDING_MSG_TYPE_ID {
                continue;
            }

            handler(
                msg_type_id,
                self.buffer.slice(
                    record_index + RECORD_HEADER_LENGTH,
                    record_length - RECORD_HEADER_LENGTH,
                ),
            );
            messages_read += 1;
        }

        if bytes_read > 0 {
            self.buffer.set_memory(head_offset, bytes_read as usize, 0);
            self.buffer
                .put_i64_ordered(self.head_index, head + bytes_read as i64);
        }

        messages_read
    }

    /// Draw the next correlation id; unique across every producer.
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer.get_and_add_i64(self.correlation_index, 1)
    }

    /// Timestamp last stored by the consumer.
    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.buffer.get_i64_volatile(self.heartbeat_index)
    }

    /// Store the consumer heartbeat timestamp.
    pub fn set_consumer_heartbeat_time(&self, time_ms: i64) {
        self.buffer.put_i64_ordered(self.heartbeat_index, time_ms);
    }

    /// Bytes currently enqueued but unconsumed.
    pub fn size(&self) -> i32 {
        let head = self.buffer.get_i64_volatile(self.head_index);
        let tail = self.buffer.get_i64_volatile(self.tail_index);
        (tail - head) as i32
    }

    fn claim_capacity(&self, required: i32) -> Result<i32> {
        let mut head = self.buffer.get_i64_volatile(self.head_cache_index);

        loop {
            let tail = self.buffer.get_i64_volatile(self.tail_index);
            let available = self.capacity - (tail - head) as i32;

            if required > available {
                head = self.buffer.get_i64_volatile(self.head_index);
                if required > self.capacity - (tail - head) as i32 {
                    return Err(ClientError::InsufficientCapacity);
                }
                self.buffer.put_i64_ordered(self.head_cache_index, head);
            }

            let tail_offset = (tail & self.mask) as i32;
            let to_end = self.capacity - tail_offset;
            let mut padding: i32 = 0;

            if required > to_end {
                // Record would straddle the end; pad to it and start over,
                // provided the start of the ring is free.
                let mut head_offset = (head & self.mask) as i32;
                if required > head_offset {
                    head = self.buffer.get_i64_volatile(self.head_index);
                    head_offset = (head & self.mask) as i32;
                    if required > head_offset {
                        return Err(ClientError::InsufficientCapacity);
                    }
                    self.buffer.put_i64_ordered(self.head_cache_index, head);
                }
                padding = to_end;
            }

            if self.buffer.compare_and_set_i64(
                self.tail_index,
                tail,
                tail + (required + padding) as i64,
            ) {
                if padding != 0 {
                    self.buffer.put_i64_ordered(
                        tail_offset,
                        make_header(padding, PADDING_MSG_TYPE_ID),
                    );
                    return Ok(0);
                }
                return Ok(tail_offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: i32 = 1024;

    fn ring(backing: &mut Vec<u8>) -> ManyToOneRingBuffer {
        let buffer = AtomicBuffer::wrap_slice(backing);
        ManyToOneRingBuffer::new(buffer).unwrap()
    }

    fn backing() -> Vec<u8> {
        vec![0u8; (CAPACITY + TRAILER_LENGTH) as usize]
    }

    #[test]
    fn test_rejects_non_power_of_two_capacity() {
        let mut backing = vec![0u8; 1000 + TRAILER_LENGTH as usize];
        let buffer = AtomicBuffer::wrap_slice(&mut backing);
        assert!(ManyToOneRingBuffer::new(buffer).is_err());
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut backing = backing();
        let ring = ring(&mut backing);

        ring.write(0x01, b"add publication").unwrap();
        ring.write(0x06, b"").unwrap();

        let mut seen = Vec::new();
        let count = ring.read(&mut |type_id, msg| seen.push((type_id, msg.to_vec())), 10);

        assert_eq!(count, 2);
        assert_eq!(seen[0], (0x01, b"add publication".to_vec()));
        assert_eq!(seen[1], (0x06, Vec::new()));
        assert_eq!(ring.size(), 0);
    }

    #[test]
    fn test_read_honors_message_count_limit() {
        let mut backing = backing();
        let ring = ring(&mut backing);

        for _ in 0..5 {
            ring.write(2, b"cmd").unwrap();
        }

        let mut seen = 0;
        assert_eq!(ring.read(&mut |_, _| seen += 1, 3), 3);
        assert_eq!(seen, 3);
        assert_eq!(ring.read(&mut |_, _| seen += 1, 10), 2);
        assert_eq!(seen, 5);
    }

    #[test]
    fn test_wrap_inserts_padding_record() {
        let mut backing = backing();
        let ring = ring(&mut backing);

        // Fill most of the ring, drain it, then write a record that cannot
        // fit in the bytes remaining before the end.
        let chunk = vec![7u8; 100];
        for _ in 0..9 {
            ring.write(1, &chunk).unwrap();
        }
        assert_eq!(ring.read(&mut |_, _| {}, 20), 9);

        ring.write(1, &chunk).unwrap();
        let mut seen = Vec::new();
        assert_eq!(ring.read(&mut |t, m| seen.push((t, m.len())), 20), 1);
        assert_eq!(seen, vec![(1, 100)]);
    }

    #[test]
    fn test_full_ring_reports_insufficient_capacity() {
        let mut backing = backing();
        let ring = ring(&mut backing);

        let chunk = vec![0u8; 100];
        let mut wrote = 0;
        loop {
            match ring.write(1, &chunk) {
                Ok(()) => wrote += 1,
                Err(ClientError::InsufficientCapacity) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(wrote > 0);
        // Draining frees the space again.
        assert!(ring.read(&mut |_, _| {}, 100) > 0);
        ring.write(1, &chunk).unwrap();
    }

    #[test]
    fn test_correlation_ids_are_monotonic() {
        let mut backing = backing();
        let ring = ring(&mut backing);

        assert_eq!(ring.next_correlation_id(), 0);
        assert_eq!(ring.next_correlation_id(), 1);
        assert_eq!(ring.next_correlation_id(), 2);
    }

    #[test]
    fn test_consumer_heartbeat_round_trip() {
        let mut backing = backing();
        let ring = ring(&mut backing);

        assert_eq!(ring.consumer_heartbeat_time(), 0);
        ring.set_consumer_heartbeat_time(1_234_567);
        assert_eq!(ring.consumer_heartbeat_time(), 1_234_567);
    }
}
