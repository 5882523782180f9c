//! One publisher's stream as seen by a subscriber
//!
//! An image wraps a mapped log buffer and the subscriber position counter
//! the driver allocated for it. Polling reads published fragments from the
//! partition containing the current position and then advances the position
//! counter by exactly the bytes consumed, with an ordered store so the
//! driver's flow control observes the progress.

use crate::buffer::mapped::LogBuffers;
use crate::buffer::AtomicBuffer;
use crate::counters::CountersReader;
use crate::logbuffer::reader::{self, ControlledAction, Header};
use crate::logbuffer::{frame, index_by_position, PARTITION_COUNT};
use crate::position::{compute_term_offset_from_position, position_bits_to_shift};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A single session's term stream within a subscription.
pub struct Image {
    log: Arc<LogBuffers>,
    terms: [AtomicBuffer; PARTITION_COUNT],
    position_buffer: AtomicBuffer,
    position_offset: i32,
    initial_term_id: i32,
    position_bits_to_shift: i32,
    term_length_mask: i32,
    session_id: i32,
    correlation_id: i64,
    source_identity: String,
    closed: AtomicBool,
}

impl Image {
    /// Build an image over a mapped log.
    ///
    /// `subscriber_position_id` indexes the counter slot the driver
    /// allocated for this image's consumption position.
    pub fn new(
        log: Arc<LogBuffers>,
        counters: &CountersReader,
        subscriber_position_id: i32,
        session_id: i32,
        correlation_id: i64,
        source_identity: String,
    ) -> Self {
        let meta = log.meta_buffer();
        let initial_term_id = crate::logbuffer::initial_term_id(&meta);
        let term_length = log.term_length();
        let terms = [log.term_buffer(0), log.term_buffer(1), log.term_buffer(2)];

        Self {
            terms,
            position_buffer: counters.values_buffer(),
            position_offset: CountersReader::counter_offset(subscriber_position_id),
            initial_term_id,
            position_bits_to_shift: position_bits_to_shift(term_length),
            term_length_mask: term_length - 1,
            session_id,
            correlation_id,
            source_identity,
            closed: AtomicBool::new(false),
            log,
        }
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn log_buffers(&self) -> Arc<LogBuffers> {
        Arc::clone(&self.log)
    }

    /// Current consumption position.
    pub fn position(&self) -> i64 {
        self.position_buffer.get_i64_volatile(self.position_offset)
    }

    /// Deliver published fragments to `handler`, up to `fragments_limit`.
    ///
    /// Returns the number of fragments delivered. The subscriber position
    /// advances past everything consumed, padding included.
    pub fn poll<H>(&self, handler: &mut H, fragments_limit: usize) -> usize
    where
        H: FnMut(&[u8], &Header),
    {
        if self.is_closed() {
            return 0;
        }

        let position = self.position();
        let term_offset = (position & self.term_length_mask as i64) as i32;
        let term = &self.terms[index_by_position(position, self.position_bits_to_shift)];

        let outcome = reader::read(
            term,
            term_offset,
            handler,
            fragments_limit,
            self.initial_term_id,
            self.position_bits_to_shift,
        );

        let new_position = position + (outcome.offset - term_offset) as i64;
        if new_position > position {
            self.position_buffer
                .put_i64_ordered(self.position_offset, new_position);
        }

        outcome.fragments_read
    }

    /// Poll with per-fragment control over consumption.
    ///
    /// `Abort` leaves the fragment unconsumed for redelivery, `Break` stops
    /// after the current fragment, `Commit` makes the position visible
    /// before the scan continues.
    pub fn controlled_poll<H>(&self, handler: &mut H, fragments_limit: usize) -> usize
    where
        H: FnMut(&[u8], &Header) -> ControlledAction,
    {
        if self.is_closed() {
            return 0;
        }

        let position = self.position();
        let term_offset = compute_term_offset_from_position(position, self.position_bits_to_shift);
        let term = &self.terms[index_by_position(position, self.position_bits_to_shift)];
        let position_base = position - term_offset as i64;

        let position_buffer = self.position_buffer;
        let position_offset = self.position_offset;
        let outcome = reader::controlled_read(
            term,
            term_offset,
            handler,
            fragments_limit,
            self.initial_term_id,
            self.position_bits_to_shift,
            &mut |committed_offset| {
                position_buffer
                    .put_i64_ordered(position_offset, position_base + committed_offset as i64);
            },
        );

        let new_position = position_base + outcome.offset as i64;
        if new_position > position {
            self.position_buffer
                .put_i64_ordered(self.position_offset, new_position);
        }

        outcome.fragments_read
    }

    /// Deliver a contiguous run of whole frames as one byte range.
    ///
    /// The handler receives the raw frames (headers included), the session
    /// id and the term id of the block. Padding terminates a block; its
    /// bytes are consumed without being delivered. Returns the bytes
    /// consumed.
    pub fn block_poll<H>(&self, handler: &mut H, block_length_limit: i32) -> i32
    where
        H: FnMut(&[u8], i32, i32),
    {
        if self.is_closed() {
            return 0;
        }

        let position = self.position();
        let term_offset = (position & self.term_length_mask as i64) as i32;
        let term = &self.terms[index_by_position(position, self.position_bits_to_shift)];
        let limit_offset = (term_offset + block_length_limit).min(term.capacity());

        let resulting_offset = reader::block_scan(term, term_offset, limit_offset);
        let bytes = resulting_offset - term_offset;

        if bytes > 0 {
            if !frame::is_padding(term, term_offset) {
                let term_id = frame::term_id(term, term_offset);
                handler(term.slice(term_offset, bytes), self.session_id, term_id);
            }
            self.position_buffer
                .put_i64_ordered(self.position_offset, position + bytes as i64);
        }

        bytes
    }
}
