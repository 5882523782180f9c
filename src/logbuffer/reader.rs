//! Term consumption: frame scanning and delivery
//!
//! The read side scans a term from the consumer's last known offset. Each
//! frame's length is acquire-loaded first; a non-positive length means the
//! frame is not yet published and the scan stops. Padding frames are
//! consumed silently. Three modes are provided:
//!
//! - plain `read`: deliver every data fragment up to a limit
//! - `controlled_read`: the handler steers the scan per fragment
//!   (continue, break, abort-and-redeliver, commit-position-now)
//! - `block_scan`: measure a contiguous run of whole frames for bulk
//!   delivery as one byte range

use crate::buffer::{align, AtomicBuffer};
use crate::logbuffer::frame;
use crate::position::compute_position;

/// Read-only view over a delivered fragment's header.
pub struct Header {
    buffer: AtomicBuffer,
    frame_offset: i32,
    initial_term_id: i32,
    position_bits_to_shift: i32,
}

impl Header {
    pub(crate) fn new(
        buffer: AtomicBuffer,
        frame_offset: i32,
        initial_term_id: i32,
        position_bits_to_shift: i32,
    ) -> Self {
        Self {
            buffer,
            frame_offset,
            initial_term_id,
            position_bits_to_shift,
        }
    }

    /// Offset of the frame within its term.
    pub fn offset(&self) -> i32 {
        self.frame_offset
    }

    /// Total frame length including the header.
    pub fn frame_length(&self) -> i32 {
        self.buffer.get_i32(self.frame_offset + frame::LENGTH_OFFSET)
    }

    /// Fragmentation flags of the frame.
    pub fn flags(&self) -> u8 {
        frame::flags(&self.buffer, self.frame_offset)
    }

    /// Session id of the originating publication.
    pub fn session_id(&self) -> i32 {
        frame::session_id(&self.buffer, self.frame_offset)
    }

    /// Stream id of the originating publication.
    pub fn stream_id(&self) -> i32 {
        self.buffer.get_i32(self.frame_offset + frame::STREAM_ID_OFFSET)
    }

    /// Term id containing the frame.
    pub fn term_id(&self) -> i32 {
        frame::term_id(&self.buffer, self.frame_offset)
    }

    /// Application-defined reserved value stamped by the writer.
    pub fn reserved_value(&self) -> i64 {
        frame::reserved_value(&self.buffer, self.frame_offset)
    }

    /// Stream position just past this frame.
    pub fn position(&self) -> i64 {
        let next_offset = align(self.frame_length(), frame::FRAME_ALIGNMENT) + self.frame_offset;
        compute_position(
            self.term_id(),
            next_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }
}

/// Outcome of a term scan: the post-scan offset and fragments delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Term offset after the bytes consumed by this call.
    pub offset: i32,
    /// Number of data fragments delivered to the handler.
    pub fragments_read: usize,
}

/// Handler verdicts for a controlled scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlledAction {
    /// Keep scanning.
    Continue,
    /// Stop after consuming this fragment.
    Break,
    /// Stop without consuming this fragment; it is redelivered next call.
    Abort,
    /// Consume and make the subscriber position visible immediately, then
    /// keep scanning.
    Commit,
}

/// Scan a term and deliver each published data fragment.
pub fn read<H>(
    term: &AtomicBuffer,
    term_offset: i32,
    handler: &mut H,
    fragments_limit: usize,
    initial_term_id: i32,
    position_bits_to_shift: i32,
) -> ReadOutcome
where
    H: FnMut(&[u8], &Header),
{
    let capacity = term.capacity();
    let mut offset = term_offset;
    let mut fragments_read = 0;

    while fragments_read < fragments_limit && offset < capacity {
        let frame_length = frame::length_volatile(term, offset);
        if frame_length <= 0 {
            break;
        }

        let frame_offset = offset;
        offset += align(frame_length, frame::FRAME_ALIGNMENT);

        if !frame::is_padding(term, frame_offset) {
            let header = Header::new(*term, frame_offset, initial_term_id, position_bits_to_shift);
            handler(
                term.slice(
                    frame_offset + frame::HEADER_LENGTH,
                    frame_length - frame::HEADER_LENGTH,
                ),
                &header,
            );
            fragments_read += 1;
        }
    }

    ReadOutcome {
        offset,
        fragments_read,
    }
}

/// Scan a term under handler control.
///
/// `on_commit` is invoked with the consumed-through offset whenever the
/// handler returns [`ControlledAction::Commit`], letting the caller advance
/// its externally visible position mid-batch.
pub fn controlled_read<H>(
    term: &AtomicBuffer,
    term_offset: i32,
    handler: &mut H,
    fragments_limit: usize,
    initial_term_id: i32,
    position_bits_to_shift: i32,
    on_commit: &mut dyn FnMut(i32),
) -> ReadOutcome
where
    H: FnMut(&[u8], &Header) -> ControlledAction,
{
    let capacity = term.capacity();
    let mut offset = term_offset;
    let mut fragments_read = 0;

    while fragments_read < fragments_limit && offset < capacity {
        let frame_length = frame::length_volatile(term, offset);
        if frame_length <= 0 {
            break;
        }

        let frame_offset = offset;
        let aligned_length = align(frame_length, frame::FRAME_ALIGNMENT);

        if frame::is_padding(term, frame_offset) {
            offset += aligned_length;
            continue;
        }

        let header = Header::new(*term, frame_offset, initial_term_id, position_bits_to_shift);
        let action = handler(
            term.slice(
                frame_offset + frame::HEADER_LENGTH,
                frame_length - frame::HEADER_LENGTH,
            ),
            &header,
        );

        match action {
            ControlledAction::Abort => break,
            ControlledAction::Break => {
                offset += aligned_length;
                fragments_read += 1;
                break;
            }
            ControlledAction::Commit => {
                offset += aligned_length;
                fragments_read += 1;
                on_commit(offset);
            }
            ControlledAction::Continue => {
                offset += aligned_length;
                fragments_read += 1;
            }
        }
    }

    ReadOutcome {
        offset,
        fragments_read,
    }
}

/// Measure a contiguous block of whole frames starting at `term_offset`.
///
/// The scan stops at the first unpublished frame, at a padding frame, or
/// when the next frame would cross `limit_offset`. A padding frame at the
/// very start is consumed (its bytes are skipped) so the consumer can make
/// progress past term tail padding.
pub fn block_scan(term: &AtomicBuffer, term_offset: i32, limit_offset: i32) -> i32 {
    let mut offset = term_offset;

    while offset < limit_offset {
        let frame_length = frame::length_volatile(term, offset);
        if frame_length <= 0 {
            break;
        }

        let aligned_length = align(frame_length, frame::FRAME_ALIGNMENT);

        if frame::is_padding(term, offset) {
            if offset == term_offset {
                offset += aligned_length;
            }
            break;
        }

        if offset + aligned_length > limit_offset {
            break;
        }

        offset += aligned_length;
    }

    offset
}
