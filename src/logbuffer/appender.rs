//! Term append protocol, concurrent variant
//!
//! Writers reserve space by advancing the term's packed tail counter with an
//! atomic fetch-and-add, so concurrent writers never overlap their reserved
//! ranges. A frame write then follows the reserve-write-publish pattern: the
//! header and payload land first, and the frame length is release-stored
//! last as the readiness signal for readers.
//!
//! When a reservation's end crosses the term boundary the writer whose
//! reservation straddled the end pads the remainder of the term with a
//! single padding frame and reports failure; the publication layer turns
//! that into a term rotation.

use crate::buffer::{align, AtomicBuffer};
use crate::logbuffer::frame::{self, HeaderTemplate};
use crate::logbuffer::{
    pack_tail, term_id_from_raw_tail, TERM_TAIL_COUNTER_OFFSET,
};

/// Sentinel returned by append operations when the term has been exhausted.
pub const FAILED: i32 = -1;

/// Supplies the application-defined reserved value for a frame, invoked with
/// `(term_buffer, frame_offset, frame_length)` before the frame is published.
pub type ReservedValueSupplier<'a> = &'a dyn Fn(&AtomicBuffer, i32, i32) -> i64;

/// A zero-copy reservation of one frame within a term.
///
/// Exactly one of [`commit`](BufferClaim::commit) or
/// [`abort`](BufferClaim::abort) finalises the claim. Dropping an
/// unfinalised claim aborts it so readers are never wedged behind an
/// unpublished frame.
pub struct BufferClaim {
    term_buffer: AtomicBuffer,
    frame_offset: i32,
    frame_length: i32,
    finalized: bool,
}

impl BufferClaim {
    pub(crate) fn new(term_buffer: AtomicBuffer, frame_offset: i32, frame_length: i32) -> Self {
        Self {
            term_buffer,
            frame_offset,
            frame_length,
            finalized: false,
        }
    }

    /// Offset of the payload within the term buffer.
    pub fn offset(&self) -> i32 {
        self.frame_offset + frame::HEADER_LENGTH
    }

    /// Payload length in bytes.
    pub fn length(&self) -> i32 {
        self.frame_length - frame::HEADER_LENGTH
    }

    /// Mutable view of the claimed payload range.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // The tail reservation gives this claim exclusive ownership of the range.
        unsafe { self.term_buffer.slice_mut(self.offset(), self.length()) }
    }

    /// Stamp the reserved value field before committing.
    pub fn set_reserved_value(&mut self, value: i64) {
        frame::set_reserved_value(&self.term_buffer, self.frame_offset, value);
    }

    /// Publish the frame to readers.
    pub fn commit(mut self) {
        frame::length_ordered(&self.term_buffer, self.frame_offset, self.frame_length);
        self.finalized = true;
    }

    /// Rewrite the frame as padding so readers skip it.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        self.term_buffer
            .put_u16(self.frame_offset + frame::TYPE_OFFSET, frame::PADDING_FRAME_TYPE);
        frame::length_ordered(&self.term_buffer, self.frame_offset, self.frame_length);
        self.finalized = true;
    }
}

impl Drop for BufferClaim {
    fn drop(&mut self) {
        if !self.finalized {
            self.abort_in_place();
        }
    }
}

/// Multi-writer-safe appender for one term partition.
pub struct TermAppender {
    term_buffer: AtomicBuffer,
    tail_block: AtomicBuffer,
    template: HeaderTemplate,
}

impl TermAppender {
    /// Wrap one term partition and its tail block.
    pub fn new(term_buffer: AtomicBuffer, tail_block: AtomicBuffer, template: HeaderTemplate) -> Self {
        Self {
            term_buffer,
            tail_block,
            template,
        }
    }

    /// Volatile read of the packed raw tail.
    pub fn raw_tail_volatile(&self) -> i64 {
        self.tail_block.get_i64_volatile(TERM_TAIL_COUNTER_OFFSET)
    }

    fn reserve(&self, aligned_length: i32) -> i64 {
        self.tail_block
            .get_and_add_i64(TERM_TAIL_COUNTER_OFFSET, aligned_length as i64)
    }

    /// Append a whole message that fits in a single frame.
    ///
    /// Returns the resulting term offset past the frame, or [`FAILED`] at
    /// end of log.
    pub fn append_unfragmented(
        &self,
        msg: &[u8],
        reserved_value_supplier: Option<ReservedValueSupplier>,
    ) -> i32 {
        let frame_length = msg.len() as i32 + frame::HEADER_LENGTH;
        let aligned_length = align(frame_length, frame::FRAME_ALIGNMENT);

        let raw_tail = self.reserve(aligned_length);
        let term_offset = raw_tail & 0xFFFF_FFFF;
        let term_id = term_id_from_raw_tail(raw_tail);
        let term_length = self.term_buffer.capacity();

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > term_length as i64 {
            self.handle_end_of_log(term_offset, term_length, term_id);
            return FAILED;
        }

        let frame_offset = term_offset as i32;
        frame::write_header(
            &self.term_buffer,
            frame_offset,
            &self.template,
            frame::DATA_FRAME_TYPE,
            frame::UNFRAGMENTED,
            term_id,
        );
        self.term_buffer
            .put_bytes(frame_offset + frame::HEADER_LENGTH, msg);

        if let Some(supplier) = reserved_value_supplier {
            let value = supplier(&self.term_buffer, frame_offset, frame_length);
            frame::set_reserved_value(&self.term_buffer, frame_offset, value);
        }

        frame::length_ordered(&self.term_buffer, frame_offset, frame_length);
        resulting_offset as i32
    }

    /// Append a message as a run of fragments.
    ///
    /// The whole run's space is reserved with one tail advance so the
    /// "does this message fit before end of log" decision is atomic with
    /// respect to other writers.
    pub fn append_fragmented(
        &self,
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

        let raw_tail = self.reserve(required_length);
        let term_offset = raw_tail & 0xFFFF_FFFF;
        let term_id = term_id_from_raw_tail(raw_tail);
        let term_length = self.term_buffer.capacity();

        let resulting_offset = term_offset + required_length as i64;
        if resulting_offset > term_length as i64 {
            self.handle_end_of_log(term_offset, term_length, term_id);
            return FAILED;
        }

        let mut flags = frame::BEGIN_FRAG_FLAG;
        let mut remaining = length;
        let mut frame_offset = term_offset as i32;

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

        resulting_offset as i32
    }

    /// Reserve a frame for zero-copy population by the caller.
    ///
    /// On success returns the resulting term offset and a claim over the
    /// payload range; on end of log returns [`FAILED`] and no claim.
    pub fn claim(&self, length: i32) -> (i32, Option<BufferClaim>) {
        let frame_length = length + frame::HEADER_LENGTH;
        let aligned_length = align(frame_length, frame::FRAME_ALIGNMENT);

        let raw_tail = self.reserve(aligned_length);
        let term_offset = raw_tail & 0xFFFF_FFFF;
        let term_id = term_id_from_raw_tail(raw_tail);
        let term_length = self.term_buffer.capacity();

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > term_length as i64 {
            self.handle_end_of_log(term_offset, term_length, term_id);
            return (FAILED, None);
        }

        let frame_offset = term_offset as i32;
        frame::write_header(
            &self.term_buffer,
            frame_offset,
            &self.template,
            frame::DATA_FRAME_TYPE,
            frame::UNFRAGMENTED,
            term_id,
        );

        (
            resulting_offset as i32,
            Some(BufferClaim::new(self.term_buffer, frame_offset, frame_length)),
        )
    }

    fn handle_end_of_log(&self, term_offset: i64, term_length: i32, term_id: i32) {
        // Only the writer whose reservation straddled the boundary sees an
        // offset inside the term; it owns the remainder.
        if term_offset < term_length as i64 {
            let frame_offset = term_offset as i32;
            frame::write_padding(
                &self.term_buffer,
                frame_offset,
                &self.template,
                term_id,
                term_length - frame_offset,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERM_LENGTH: i32 = 4096;
    const TERM_ID: i32 = 17;

    fn appender(
        term_backing: &mut Vec<u8>,
        tail_backing: &mut Vec<u8>,
    ) -> TermAppender {
        let term = AtomicBuffer::wrap_slice(term_backing);
        let tail = AtomicBuffer::wrap_slice(tail_backing);
        tail.put_i64(TERM_TAIL_COUNTER_OFFSET, pack_tail(TERM_ID, 0));
        TermAppender::new(
            term,
            tail,
            HeaderTemplate {
                session_id: 3,
                stream_id: 7,
            },
        )
    }

    #[test]
    fn test_unfragmented_append() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let resulting = appender.append_unfragmented(b"0123456789", None);
        assert_eq!(resulting, 64);

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert_eq!(frame::length_volatile(&term, 0), 42);
        assert_eq!(frame::flags(&term, 0), frame::UNFRAGMENTED);
        assert_eq!(frame::term_id(&term, 0), TERM_ID);
        assert_eq!(term.slice(frame::HEADER_LENGTH, 10), b"0123456789");
    }

    #[test]
    fn test_appends_are_contiguous_and_aligned() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let first = appender.append_unfragmented(&[7u8; 1], None);
        let second = appender.append_unfragmented(&[8u8; 33], None);
        assert_eq!(first, 32);
        assert_eq!(second, 32 + 96);
    }

    #[test]
    fn test_zero_length_payload_produces_header_only_frame() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let resulting = appender.append_unfragmented(&[], None);
        assert_eq!(resulting, frame::FRAME_ALIGNMENT);

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert_eq!(frame::length_volatile(&term, 0), frame::HEADER_LENGTH);
    }

    #[test]
    fn test_end_of_log_pads_remainder() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let tail = AtomicBuffer::wrap_slice(&mut tail_backing);
        tail.put_i64(TERM_TAIL_COUNTER_OFFSET, pack_tail(TERM_ID, TERM_LENGTH - 64));

        let resulting = appender.append_unfragmented(&[1u8; 100], None);
        assert_eq!(resulting, FAILED);

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        let pad_offset = TERM_LENGTH - 64;
        assert!(frame::is_padding(&term, pad_offset));
        assert_eq!(frame::length_volatile(&term, pad_offset), 64);
    }

    #[test]
    fn test_fragmented_append() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let max_payload = 96;
        let msg: Vec<u8> = (0u8..=199).collect(); // 200 bytes -> 3 fragments
        let resulting = appender.append_fragmented(&msg, max_payload, None);

        let expected = 2 * (96 + 32) + align(8 + 32, frame::FRAME_ALIGNMENT);
        assert_eq!(resulting, expected);

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert_eq!(frame::flags(&term, 0), frame::BEGIN_FRAG_FLAG);
        assert_eq!(frame::flags(&term, 128), 0);
        assert_eq!(frame::flags(&term, 256), frame::END_FRAG_FLAG);
        assert_eq!(frame::length_volatile(&term, 256), 8 + 32);
    }

    #[test]
    fn test_claim_commit_publishes_frame() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let (resulting, claim) = appender.claim(16);
        assert_eq!(resulting, 64);
        let mut claim = claim.unwrap();

        // Not yet visible to readers.
        {
            let term = AtomicBuffer::wrap_slice(&mut term_backing);
            assert_eq!(frame::length_volatile(&term, 0), 0);
        }

        claim.data_mut().copy_from_slice(&[0xAB; 16]);
        claim.commit();

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert_eq!(frame::length_volatile(&term, 0), 48);
        assert_eq!(term.slice(frame::HEADER_LENGTH, 16), &[0xAB; 16]);
    }

    #[test]
    fn test_claim_abort_leaves_padding() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let (_, claim) = appender.claim(16);
        claim.unwrap().abort();

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert!(frame::is_padding(&term, 0));
        assert_eq!(frame::length_volatile(&term, 0), 48);
    }

    #[test]
    fn test_dropped_claim_aborts() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        {
            let (_, claim) = appender.claim(8);
            drop(claim);
        }

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert!(frame::is_padding(&term, 0));
    }

    #[test]
    fn test_reserved_value_supplier() {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        let appender = appender(&mut term_backing, &mut tail_backing);

        let supplier = |_: &AtomicBuffer, offset: i32, length: i32| (offset + length) as i64;
        appender.append_unfragmented(b"x", Some(&supplier));

        let term = AtomicBuffer::wrap_slice(&mut term_backing);
        assert_eq!(frame::reserved_value(&term, 0), 33);
    }
}
