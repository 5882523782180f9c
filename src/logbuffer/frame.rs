//! Frame header codec
//!
//! Every entry in a term is a frame: a 32-byte header followed by payload,
//! aligned to 32 bytes. The header layout is a wire contract with the
//! driver:
//!
//! ```text
//! [length:i32][version:u8][flags:u8][type:u16][termOffset:i32]
//! [sessionId:i32][streamId:i32][termId:i32][reservedValue:i64]
//! ```
//!
//! The length field doubles as the reader readiness signal: it is written
//! with a release store as the last step of a frame write and must be read
//! with an acquire load before any other field is trusted.

use crate::buffer::AtomicBuffer;

/// Frame alignment boundary in bytes.
pub const FRAME_ALIGNMENT: i32 = 32;

/// Frame header length in bytes.
pub const HEADER_LENGTH: i32 = 32;

/// Offset of the frame length field.
pub const LENGTH_OFFSET: i32 = 0;
/// Offset of the protocol version byte.
pub const VERSION_OFFSET: i32 = 4;
/// Offset of the flags byte.
pub const FLAGS_OFFSET: i32 = 5;
/// Offset of the frame type field.
pub const TYPE_OFFSET: i32 = 6;
/// Offset of the term-offset field.
pub const TERM_OFFSET_OFFSET: i32 = 8;
/// Offset of the session id field.
pub const SESSION_ID_OFFSET: i32 = 12;
/// Offset of the stream id field.
pub const STREAM_ID_OFFSET: i32 = 16;
/// Offset of the term id field.
pub const TERM_ID_OFFSET: i32 = 20;
/// Offset of the application reserved value.
pub const RESERVED_VALUE_OFFSET: i32 = 24;

/// Frame type for message data.
pub const DATA_FRAME_TYPE: u16 = 0x01;
/// Frame type marking unused tail space at the end of a term.
pub const PADDING_FRAME_TYPE: u16 = 0x00;

/// Flag on the first fragment of a message.
pub const BEGIN_FRAG_FLAG: u8 = 0x80;
/// Flag on the last fragment of a message.
pub const END_FRAG_FLAG: u8 = 0x40;
/// Flags on a whole, unfragmented message.
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

/// Protocol version stamped into every header.
pub const CURRENT_VERSION: u8 = 1;

/// Session/stream identity stamped into every frame a writer produces,
/// captured from the log's default frame header.
#[derive(Debug, Clone, Copy)]
pub struct HeaderTemplate {
    /// Session id of the owning publication.
    pub session_id: i32,
    /// Stream id of the owning publication.
    pub stream_id: i32,
}

/// Acquire-load of a frame's length. Non-positive means not yet published.
#[inline]
pub fn length_volatile(term: &AtomicBuffer, frame_offset: i32) -> i32 {
    term.get_i32_volatile(frame_offset + LENGTH_OFFSET)
}

/// Release-store of a frame's length, publishing the frame to readers.
#[inline]
pub fn length_ordered(term: &AtomicBuffer, frame_offset: i32, length: i32) {
    term.put_i32_ordered(frame_offset + LENGTH_OFFSET, length);
}

#[inline]
pub fn frame_type(term: &AtomicBuffer, frame_offset: i32) -> u16 {
    term.get_u16(frame_offset + TYPE_OFFSET)
}

#[inline]
pub fn is_padding(term: &AtomicBuffer, frame_offset: i32) -> bool {
    frame_type(term, frame_offset) == PADDING_FRAME_TYPE
}

#[inline]
pub fn flags(term: &AtomicBuffer, frame_offset: i32) -> u8 {
    term.get_u8(frame_offset + FLAGS_OFFSET)
}

#[inline]
pub fn session_id(term: &AtomicBuffer, frame_offset: i32) -> i32 {
    term.get_i32(frame_offset + SESSION_ID_OFFSET)
}

#[inline]
pub fn term_id(term: &AtomicBuffer, frame_offset: i32) -> i32 {
    term.get_i32(frame_offset + TERM_ID_OFFSET)
}

#[inline]
pub fn reserved_value(term: &AtomicBuffer, frame_offset: i32) -> i64 {
    term.get_i64(frame_offset + RESERVED_VALUE_OFFSET)
}

#[inline]
pub fn set_reserved_value(term: &AtomicBuffer, frame_offset: i32, value: i64) {
    term.put_i64(frame_offset + RESERVED_VALUE_OFFSET, value);
}

/// Write every header field except the length, which the caller publishes
/// last once the payload is in place.
#[allow(clippy::too_many_arguments)]
pub fn write_header(
    term: &AtomicBuffer,
    frame_offset: i32,
    template: &HeaderTemplate,
    frame_type_id: u16,
    frame_flags: u8,
    frame_term_id: i32,
) {
    term.put_u8(frame_offset + VERSION_OFFSET, CURRENT_VERSION);
    term.put_u8(frame_offset + FLAGS_OFFSET, frame_flags);
    term.put_u16(frame_offset + TYPE_OFFSET, frame_type_id);
    term.put_i32(frame_offset + TERM_OFFSET_OFFSET, frame_offset);
    term.put_i32(frame_offset + SESSION_ID_OFFSET, template.session_id);
    term.put_i32(frame_offset + STREAM_ID_OFFSET, template.stream_id);
    term.put_i32(frame_offset + TERM_ID_OFFSET, frame_term_id);
    term.put_i64(frame_offset + RESERVED_VALUE_OFFSET, 0);
}

/// Write and publish a padding frame covering `length` bytes.
pub fn write_padding(
    term: &AtomicBuffer,
    frame_offset: i32,
    template: &HeaderTemplate,
    frame_term_id: i32,
    length: i32,
) {
    write_header(
        term,
        frame_offset,
        template,
        PADDING_FRAME_TYPE,
        UNFRAGMENTED,
        frame_term_id,
    );
    length_ordered(term, frame_offset, length);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut backing = vec![0u8; 128];
        let term = AtomicBuffer::wrap_slice(&mut backing);
        let template = HeaderTemplate {
            session_id: 9,
            stream_id: 1001,
        };

        write_header(&term, 32, &template, DATA_FRAME_TYPE, UNFRAGMENTED, 42);
        length_ordered(&term, 32, 64);

        assert_eq!(length_volatile(&term, 32), 64);
        assert_eq!(frame_type(&term, 32), DATA_FRAME_TYPE);
        assert_eq!(flags(&term, 32), UNFRAGMENTED);
        assert_eq!(session_id(&term, 32), 9);
        assert_eq!(term_id(&term, 32), 42);
        assert_eq!(term.get_i32(32 + TERM_OFFSET_OFFSET), 32);
        assert!(!is_padding(&term, 32));
    }

    #[test]
    fn test_padding_frame() {
        let mut backing = vec![0u8; 128];
        let term = AtomicBuffer::wrap_slice(&mut backing);
        let template = HeaderTemplate {
            session_id: 1,
            stream_id: 2,
        };

        write_padding(&term, 0, &template, 7, 96);
        assert!(is_padding(&term, 0));
        assert_eq!(length_volatile(&term, 0), 96);
    }
}
