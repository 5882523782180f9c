//! Exclusive (single-writer) publication handle
//!
//! The handle caches its own term id, term offset and active partition so
//! the hot path runs with no atomic read-modify-write at all; only the
//! published tail is release-stored. Requires `&mut self` on every append,
//! which is exactly the confinement the protocol needs.

use crate::buffer::mapped::LogBuffers;
use crate::buffer::AtomicBuffer;
use crate::counters::CountersReader;
use crate::error::PublicationStatus;
use crate::logbuffer::appender::{BufferClaim, ReservedValueSupplier, FAILED};
use crate::logbuffer::exclusive::ExclusiveTermAppender;
use crate::logbuffer::{
    self, frame, index_by_term_count, max_possible_position, rotate_log, term_id_from_raw_tail,
    term_offset_from_raw_tail, PARTITION_COUNT,
};
use crate::position::{compute_term_begin_position, position_bits_to_shift};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const MAX_MESSAGE_BOUND: i32 = 16 * 1024 * 1024;

/// A single-writer publication onto one stream.
pub struct ExclusivePublication {
    log: Arc<LogBuffers>,
    appenders: [ExclusiveTermAppender; PARTITION_COUNT],
    tail_blocks: [AtomicBuffer; PARTITION_COUNT],
    meta: AtomicBuffer,
    channel: String,
    stream_id: i32,
    session_id: i32,
    registration_id: i64,
    initial_term_id: i32,
    position_bits_to_shift: i32,
    term_length: i32,
    max_payload_length: i32,
    max_message_length: i32,
    limit_buffer: AtomicBuffer,
    limit_offset: i32,
    closed: Arc<AtomicBool>,
    // Writer-owned cursor state.
    term_id: i32,
    term_offset: i32,
    active_index: usize,
}

impl ExclusivePublication {
    pub(crate) fn new(
        log: Arc<LogBuffers>,
        counters: &CountersReader,
        position_limit_counter_id: i32,
        channel: String,
        stream_id: i32,
        session_id: i32,
        registration_id: i64,
        closed: Arc<AtomicBool>,
    ) -> Self {
        let meta = log.meta_buffer();
        let template = log.header_template();
        let term_length = log.term_length();
        let mtu = logbuffer::mtu_length(&meta);
        let tail_blocks = log.tail_blocks();
        let appenders = [
            ExclusiveTermAppender::new(log.term_buffer(0), tail_blocks[0], template),
            ExclusiveTermAppender::new(log.term_buffer(1), tail_blocks[1], template),
            ExclusiveTermAppender::new(log.term_buffer(2), tail_blocks[2], template),
        ];

        let term_count = logbuffer::active_term_count(&meta);
        let active_index = index_by_term_count(term_count);
        let raw_tail = tail_blocks[active_index]
            .get_i64_volatile(logbuffer::TERM_TAIL_COUNTER_OFFSET);

        Self {
            appenders,
            tail_blocks,
            meta,
            channel,
            stream_id,
            session_id,
            registration_id,
            initial_term_id: logbuffer::initial_term_id(&meta),
            position_bits_to_shift: position_bits_to_shift(term_length),
            term_length,
            max_payload_length: mtu - frame::HEADER_LENGTH,
            max_message_length: MAX_MESSAGE_BOUND.min(term_length / 8),
            limit_buffer: counters.values_buffer(),
            limit_offset: CountersReader::counter_offset(position_limit_counter_id),
            closed,
            term_id: term_id_from_raw_tail(raw_tail),
            term_offset: term_offset_from_raw_tail(raw_tail, term_length),
            active_index,
            log,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn max_payload_length(&self) -> i32 {
        self.max_payload_length
    }

    pub fn max_message_length(&self) -> i32 {
        self.max_message_length
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && logbuffer::is_connected(&self.meta)
    }

    pub(crate) fn log_buffers(&self) -> Arc<LogBuffers> {
        Arc::clone(&self.log)
    }

    /// Current stream position of the writer's cursor.
    pub fn position(&self) -> i64 {
        compute_term_begin_position(
            self.term_id,
            self.position_bits_to_shift,
            self.initial_term_id,
        ) + self.term_offset as i64
    }

    pub fn position_limit(&self) -> i64 {
        self.limit_buffer.get_i64_volatile(self.limit_offset)
    }

    /// Offer a whole message, fragmenting past the MTU payload.
    pub fn offer(&mut self, msg: &[u8]) -> std::result::Result<i64, PublicationStatus> {
        self.offer_with(msg, None)
    }

    /// Offer with a reserved-value supplier.
    pub fn offer_with(
        &mut self,
        msg: &[u8],
        reserved_value_supplier: Option<ReservedValueSupplier>,
    ) -> std::result::Result<i64, PublicationStatus> {
        if self.is_closed() {
            return Err(PublicationStatus::Closed);
        }
        assert!(
            msg.len() as i32 <= self.max_message_length,
            "message of {} bytes exceeds max message length {}",
            msg.len(),
            self.max_message_length
        );

        let term_begin = self.check_flow_control()?;

        let appender = &self.appenders[self.active_index];
        let resulting = if msg.len() as i32 <= self.max_payload_length {
            appender.append_unfragmented(
                self.term_id,
                self.term_offset,
                msg,
                reserved_value_supplier,
            )
        } else {
            appender.append_fragmented(
                self.term_id,
                self.term_offset,
                msg,
                self.max_payload_length,
                reserved_value_supplier,
            )
        };

        self.resolve(resulting, term_begin)
    }

    /// Reserve a single frame for zero-copy population.
    pub fn try_claim(
        &mut self,
        length: i32,
    ) -> std::result::Result<(i64, BufferClaim), PublicationStatus> {
        if self.is_closed() {
            return Err(PublicationStatus::Closed);
        }
        assert!(
            length <= self.max_payload_length,
            "claim of {} bytes exceeds max payload length {}",
            length,
            self.max_payload_length
        );

        let term_begin = self.check_flow_control()?;

        let appender = &self.appenders[self.active_index];
        let (resulting, claim) = appender.claim(self.term_id, self.term_offset, length);
        let position = self.resolve(resulting, term_begin)?;
        Ok((position, claim.unwrap()))
    }

    fn check_flow_control(&self) -> std::result::Result<i64, PublicationStatus> {
        let term_begin = compute_term_begin_position(
            self.term_id,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let position = term_begin + self.term_offset as i64;
        if position >= self.position_limit() {
            return Err(self.back_pressure_status());
        }
        Ok(term_begin)
    }

    fn resolve(
        &mut self,
        resulting_offset: i32,
        term_begin: i64,
    ) -> std::result::Result<i64, PublicationStatus> {
        if resulting_offset == FAILED {
            if term_begin + self.term_offset as i64 + self.term_length as i64
                >= max_possible_position(self.term_length)
            {
                return Err(PublicationStatus::MaxPositionExceeded);
            }
            self.rotate_term();
            return Err(PublicationStatus::AdminAction);
        }
        self.term_offset = resulting_offset;
        Ok(term_begin + resulting_offset as i64)
    }

    fn rotate_term(&mut self) {
        let term_count = self.term_id.wrapping_sub(self.initial_term_id);
        rotate_log(&self.tail_blocks, &self.meta, term_count, self.term_id);
        self.term_id += 1;
        self.term_offset = 0;
        self.active_index = index_by_term_count(term_count + 1);
    }

    fn back_pressure_status(&self) -> PublicationStatus {
        if logbuffer::is_connected(&self.meta) {
            PublicationStatus::BackPressured
        } else {
            PublicationStatus::NotConnected
        }
    }
}
