//! Term append protocol, exclusive (single-writer) variant
//!
//! With a single writer there is no need for an atomic read-modify-write on
//! the hot path: the writer tracks its own term offset locally and only the
//! published tail is release-stored so readers (and the driver) observe a
//! consistent reservation. Not safe for concurrent writers; the caller must
//! confine the owning publication to one thread.

use crate::buffer::{align, AtomicBuffer};
use crate::logbuffer::appender::{BufferClaim, ReservedValueSupplier, FAILED};
use crate::logbuffer::frame::{self, HeaderTemplate};
use crate::logbuffer::{pack_tail, TERM_TAIL_COUNTER_OFFSET};

/// Single-writer appender for one term partition.
///
/// The caller supplies the cached `(term_id, term_offset)` pair on every
/// call and owns keeping it current; the appender publishes the tail for
/// readers but never reads it back.
pub struct ExclusiveTermAppender {
    term_buffer: AtomicBuffer,
    tail_block: AtomicBuffer,
    template: HeaderTemplate,
}

impl ExclusiveTermAppender {
    /// Wrap one term partition and its tail block.
    pub fn new(term_buffer: AtomicBuffer, tail_block: AtomicBuffer, template: HeaderTemplate) -> Self {
        Self {
            term_buffer,
            tail_block,
            template,
        }
    }

    fn publish_tail(&self, term_id: i32, term_offset: i32) {
        self.tail_block.put_i64_ordered(
            TERM_TAIL_COUNTER_OFFSET,
            pack_tail(term_id, term_offset),
        );
    }

    /// Append a whole message that fits in a single frame.
    pub fn append_unfragmented(
        &self,
        term_id: i32,
        term_offset: i32,
        msg: &[u8],
        reserved_value_supplier: Option<ReservedValueSupplier>,
    ) -> i32 {
        let frame_length = msg.len() as i32 + frame::HEADER_LENGTH;
        let aligned_length = align(frame_length, frame::FRAME_ALIGNMENT);
        let term_length = self.term_buffer.capacity();

        let resulting_offset = term_offset + aligned_length;
        self.publish_tail(term_id, resulting_offset);

        if resulting_offset > term_length {
            self.handle_end_of_log(term_offset, term_length, term_id);
            return FAILED;
        }

        frame::write_header(
            &self.term_buffer,
            term_offset,
            &self.template,
            frame::DATA_FRAME_TYPE,
            frame::UNFRAGMENTED,
            term_id,
        );
        self.term_buffer
            .put_bytes(term_offset + frame::HEADER_LENGTH, msg);

        if let Some(supplier) = reserved_value_supplier {
            let value = supplier(&self.term_buffer, term_offset, frame_length);
            frame::set_reserved_value(&self.term_buffer, term_offset, value);
        }

        frame::length_ordered(&self.term_buffer, term_offset, frame_length);
        resulting_offset
    }

    /// Append a message as a run of fragments reserved in one tail advance.
    pub fn append_fragmented(
        &self,
        term_id: i32,
        term_offset: i32,
        msg: &[u8],
        max_payload_length: i32,
        reserved_value_supplier: Option<ReservedValueSupplier>,
    ) -> i32 {
        let length = msg.len() as i32;
        let num_max_payloads = length / max_payload_length;
        let remaining_payload = length % max_payload_length;
        let last_frame_length = if remaining_payload > 0 {
            align(remaining_payload + frame::HEADER_LENGTH, frame::FRAME_ALIGNMENT)
        } else {
            0
        };
        let required_length =
            num_max_payloads * (max_payload_length + frame::HEADER_LENGTH) + last_frame_length;
        let term_length = self.term_buffer.capacity();

        let resulting_offset = term_offset + required_length;
        self.publish_tail(term_id, resulting_offset);

        if resulting_offset > term_length {
            self.handle_end_of_log(term_offset, term_length, term_id);
            return FAILED;
        }

        let mut flags = frame::BEGIN_FRAG_FLAG;
        let mut remaining = length;
        let mut frame_offset = term_offset;

        loop {
            let bytes_to_write = remaining.min(max_payload_length);
            let frame_length = bytes_to_write + frame::HEADER_LENGTH;
            let aligned_length = align(frame_length, frame::FRAME_ALIGNMENT);

            if remaining <= max_payload_length {
                flags |= frame::END_FRAG_FLAG;
            }

            frame::write_header(
                &self.term_buffer,
                frame_offset,
                &self.template,
                frame::DATA_FRAME_TYPE,
                flags,
                term_id,
            );
            let msg_offset = (length - remaining) as usize;
            self.term_buffer.put_bytes(
                frame_offset + frame::HEADER_LENGTH,
                &msg[msg_offset..msg_offset + bytes_to_write as usize],
            );

            if let Some(supplier) = reserved_value_supplier {
                let value = supplier(&self.term_buffer, frame_offset, frame_length);
                frame::set_reserved_value(&self.term_buffer, frame_offset, value);
            }

            frame::length_ordered(&self.term_buffer, frame_offset, frame_length);

            flags = 0;
            frame_offset += aligned_length;
            remaining -= bytes_to_write;

            if remaining == 0 {
                break;
            }
        }

        resulting_offset
    }

    /// Reserve a frame for zero-copy population by the caller.
    pub fn claim(&self, term_id: i32, term_offset: i32, length: i32) -> (i32, Option<BufferClaim>) {
        let frame_length = length + frame::HEADER_LENGTH;
        let aligned_length = align(frame_length, frame::FRAME_ALIGNMENT);
        let term_length = self.term_buffer.capacity();

        let resulting_offset = term_offset + aligned_length;
        self.publish_tail(term_id, resulting_offset);

        if resulting_offset > term_length {
            self.handle_end_of_log(term_offset, term_length, term_id);
            return (FAILED, None);
        }

        frame::write_header(
            &self.term_buffer,
            term_offset,
            &self.template,
            frame::DATA_FRAME_TYPE,
            frame::UNFRAGMENTED,
            term_id,
        );

        (
            resulting_offset,
            Some(BufferClaim::new(self.term_buffer, term_offset, frame_length)),
        )
    }

    fn handle_end_of_log(&self, term_offset: i32, term_length: i32, term_id: i32) {
        if term_offset < term_length {
            frame::write_padding(
                &self.term_buffer,
                term_offset,
                &self.template,
                term_id,
                term_length - term_offset,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbuffer::term_id_from_raw_tail;

    const TERM_LENGTH: i32 = 4096;
    const TERM_ID: i32 = 3;

    fn appender(term_backing: &mut Vec<u8>, tail_backing: &mut Vec<u8>) -> ExclusiveTermAppender {
        ExclusiveTermAppender::new(
            AtomicBuffer::wrap_slice(term_backing),
            AtomicBuffer::wrap_slice(tail_backing),
            HeaderTemplate {
                session_id: 1,
                stream_id: 2,
            },
        )
    }

    #[test]
    fn test_append_publishes_tail_for_readers() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let resulting = appender.append_unfragmented(TERM_ID, 0, b"abcdef", None);
        assert_eq!(resulting, 64);

        let tail = AtomicBuffer::wrap_slice(&mut tail_backing);
        let raw = tail.get_i64(TERM_TAIL_COUNTER_OFFSET);
        assert_eq!(term_id_from_raw_tail(raw), TERM_ID);
        assert_eq!((raw & 0xFFFF_FFFF) as i32, 64);
    }

    #[test]
    fn test_sequential_offsets_are_caller_supplied() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let first = appender.append_unfragmented(TERM_ID, 0, &[1u8; 10], None);
        let second = appender.append_unfragmented(TERM_ID, first, &[2u8; 10], None);
        assert_eq!(second, 128);

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert_eq!(frame::length_volatile(&term, 64), 42);
    }

    #[test]
    fn test_end_of_log_pads_and_fails() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let resulting = appender.append_unfragmented(TERM_ID, TERM_LENGTH - 32, &[9u8; 64], None);
        assert_eq!(resulting, FAILED);

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert!(frame::is_padding(&term, TERM_LENGTH - 32));
        assert_eq!(frame::length_volatile(&term, TERM_LENGTH - 32), 32);
    }

    #[test]
    fn test_exclusive_claim() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let (resulting, claim) = appender.claim(TERM_ID, 0, 20);
        assert_eq!(resulting, 64);
        let mut claim = claim.unwrap();
        claim.data_mut().fill(0x5A);
        claim.commit();

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert_eq!(frame::length_volatile(&term, 0), 52);
        assert_eq!(term.slice(frame::HEADER_LENGTH, 20), &[0x5A; 20]);
    }
}
