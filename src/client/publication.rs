//! Concurrent publication handle
//!
//! Safe to share across threads: every offer races on the active term's
//! tail counter, so concurrent writers interleave without tearing. The
//! handle converts term-level append results into stream positions and
//! flow-control sentinels, and drives term rotation when a term fills.

use crate::buffer::mapped::LogBuffers;
use crate::buffer::AtomicBuffer;
use crate::counters::CountersReader;
use crate::error::PublicationStatus;
use crate::logbuffer::appender::{BufferClaim, ReservedValueSupplier, TermAppender, FAILED};
use crate::logbuffer::{
    self, frame, index_by_term_count, max_possible_position, rotate_log, term_id_from_raw_tail,
    term_offset_from_raw_tail, PARTITION_COUNT,
};
use crate::position::{compute_term_begin_position, position_bits_to_shift};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cap on a single message, independent of term length.
const MAX_MESSAGE_BOUND: i32 = 16 * 1024 * 1024;

/// A shared, multi-writer publication onto one stream.
pub struct Publication {
    log: Arc<LogBuffers>,
    appenders: [TermAppender; PARTITION_COUNT],
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
}

impl Publication {
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
            TermAppender::new(log.term_buffer(0), tail_blocks[0], template),
            TermAppender::new(log.term_buffer(1), tail_blocks[1], template),
            TermAppender::new(log.term_buffer(2), tail_blocks[2], template),
        ];

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

    /// Largest payload carried in a single frame.
    pub fn max_payload_length(&self) -> i32 {
        self.max_payload_length
    }

    /// Largest message accepted, fragmentation included.
    pub fn max_message_length(&self) -> i32 {
        self.max_message_length
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the driver has observed a connected subscriber.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && logbuffer::is_connected(&self.meta)
    }

    pub(crate) fn log_buffers(&self) -> Arc<LogBuffers> {
        Arc::clone(&self.log)
    }

    /// Current stream position of the active term's tail.
    pub fn position(&self) -> i64 {
        let term_count = logbuffer::active_term_count(&self.meta);
        let appender = &self.appenders[index_by_term_count(term_count)];
        let raw_tail = appender.raw_tail_volatile();
        compute_term_begin_position(
            term_id_from_raw_tail(raw_tail),
            self.position_bits_to_shift,
            self.initial_term_id,
        ) + term_offset_from_raw_tail(raw_tail, self.term_length) as i64
    }

    /// Position limit imposed by the slowest consumer.
    pub fn position_limit(&self) -> i64 {
        self.limit_buffer.get_i64_volatile(self.limit_offset)
    }

    /// Offer a whole message, fragmenting if it exceeds the MTU payload.
    ///
    /// Returns the stream position after the message, or a flow-control
    /// sentinel the caller should retry on (except `Closed` and
    /// `MaxPositionExceeded`, which are terminal).
    pub fn offer(&self, msg: &[u8]) -> std::result::Result<i64, PublicationStatus> {
        self.offer_with(msg, None)
    }

    /// Offer with a reserved-value supplier stamped before publication.
    pub fn offer_with(
        &self,
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

        let limit = self.position_limit();
        let term_count = logbuffer::active_term_count(&self.meta);
        let appender = &self.appenders[index_by_term_count(term_count)];
        let raw_tail = appender.raw_tail_volatile();
        let term_id = term_id_from_raw_tail(raw_tail);
        let term_offset = term_offset_from_raw_tail(raw_tail, self.term_length);

        // A rotation has happened between the term-count load and the tail
        // load; retry with fresh state.
        if term_count != term_id.wrapping_sub(self.initial_term_id) {
            return Err(PublicationStatus::AdminAction);
        }

        let term_begin = compute_term_begin_position(
            term_id,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let position = term_begin + term_offset as i64;
        if position >= limit {
            return Err(self.back_pressure_status());
        }

        let resulting = if msg.len() as i32 <= self.max_payload_length {
            appender.append_unfragmented(msg, reserved_value_supplier)
        } else {
            appender.append_fragmented(msg, self.max_payload_length, reserved_value_supplier)
        };

        self.resolve(resulting, term_begin, position, term_count, term_id)
    }

    /// Reserve a frame for zero-copy population.
    ///
    /// The claim must be committed or aborted promptly; an unfinalised claim
    /// blocks consumers at its position. Claims never fragment, so `length`
    /// must fit a single frame.
    pub fn try_claim(
        &self,
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

        let limit = self.position_limit();
        let term_count = logbuffer::active_term_count(&self.meta);
        let appender = &self.appenders[index_by_term_count(term_count)];
        let raw_tail = appender.raw_tail_volatile();
        let term_id = term_id_from_raw_tail(raw_tail);
        let term_offset = term_offset_from_raw_tail(raw_tail, self.term_length);

        if term_count != term_id.wrapping_sub(self.initial_term_id) {
            return Err(PublicationStatus::AdminAction);
        }

        let term_begin = compute_term_begin_position(
            term_id,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let position = term_begin + term_offset as i64;
        if position >= limit {
            return Err(self.back_pressure_status());
        }

        let (resulting, claim) = appender.claim(length);
        let position = self.resolve(resulting, term_begin, position, term_count, term_id)?;
        // resolve() only succeeds when the appender returned a claim.
        Ok((position, claim.unwrap()))
    }

    fn resolve(
        &self,
        resulting_offset: i32,
        term_begin: i64,
        position: i64,
        term_count: i32,
        term_id: i32,
    ) -> std::result::Result<i64, PublicationStatus> {
        if resulting_offset == FAILED {
            if position + self.term_length as i64
                >= max_possible_position(self.term_length)
            {
                return Err(PublicationStatus::MaxPositionExceeded);
            }
            rotate_log(&self.tail_blocks, &self.meta, term_count, term_id);
            return Err(PublicationStatus::AdminAction);
        }
        Ok(term_begin + resulting_offset as i64)
    }

    fn back_pressure_status(&self) -> PublicationStatus {
        if logbuffer::is_connected(&self.meta) {
            PublicationStatus::BackPressured
        } else {
            PublicationStatus::NotConnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::COUNTER_LENGTH;
    use crate::logbuffer::TERM_MIN_LENGTH;
    use tempfile::tempdir;

    const STREAM_ID: i32 = 1001;
    const SESSION_ID: i32 = 42;
    const LIMIT_COUNTER_ID: i32 = 1;

    fn publication(dir: &std::path::Path, values: &mut Vec<u8>) -> Publication {
        let log = Arc::new(
            LogBuffers::create(
                dir.join("pub.logbuffer"),
                TERM_MIN_LENGTH,
                0,
                1408,
                SESSION_ID,
                STREAM_ID,
            )
            .unwrap(),
        );
        let counters = CountersReader::new(AtomicBuffer::wrap_slice(values));
        Publication::new(
            log,
            &counters,
            LIMIT_COUNTER_ID,
            "bus://remote:4040".to_string(),
            STREAM_ID,
            SESSION_ID,
            7,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn set_limit(values: &mut Vec<u8>, limit: i64) {
        let buffer = AtomicBuffer::wrap_slice(values);
        buffer.put_i64_ordered(CountersReader::counter_offset(LIMIT_COUNTER_ID), limit);
    }

    #[test]
    fn test_offer_returns_position_after_frame() {
        let dir = tempdir().unwrap();
        let mut values = vec![0u8; 4 * COUNTER_LENGTH as usize];
        set_limit(&mut values, i64::MAX);
        let publication = publication(dir.path(), &mut values);

        let first = publication.offer(&[1u8; 10]).unwrap();
        assert_eq!(first, 64);
        let second = publication.offer(&[2u8; 10]).unwrap();
        assert_eq!(second, 128);
        assert_eq!(publication.position(), 128);
    }

    #[test]
    fn test_not_connected_until_driver_flags_it() {
        let dir = tempdir().unwrap();
        let mut values = vec![0u8; 4 * COUNTER_LENGTH as usize];
        // Limit 0 keeps every offer behind the limit.
        let publication = publication(dir.path(), &mut values);

        assert_eq!(
            publication.offer(b"x"),
            Err(PublicationStatus::NotConnected)
        );

        logbuffer::set_is_connected(&publication.meta, true);
        assert_eq!(
            publication.offer(b"x"),
            Err(PublicationStatus::BackPressured)
        );
    }

    #[test]
    fn test_term_rotation_on_full_term() {
        let dir = tempdir().unwrap();
        let mut values = vec![0u8; 4 * COUNTER_LENGTH as usize];
        set_limit(&mut values, i64::MAX);
        let publication = publication(dir.path(), &mut values);

        let payload = vec![0u8; publication.max_message_length() as usize];
        let mut rotations = 0;
        let mut offered = 0;
        while offered < 20 {
            match publication.offer(&payload) {
                Ok(position) => {
                    assert!(position > 0);
                    offered += 1;
                }
                Err(PublicationStatus::AdminAction) => rotations += 1,
                Err(status) => panic!("unexpected status {:?}", status),
            }
        }

        // 20 messages of termLength/8 (plus headers) cannot fit in two terms.
        assert!(rotations >= 2);
        assert!(publication.position() > TERM_MIN_LENGTH as i64);
    }

    #[test]
    fn test_try_claim_commit_then_poll_position() {
        let dir = tempdir().unwrap();
        let mut values = vec![0u8; 4 * COUNTER_LENGTH as usize];
        set_limit(&mut values, i64::MAX);
        let publication = publication(dir.path(), &mut values);

        let (position, mut claim) = publication.try_claim(16).unwrap();
        assert_eq!(position, 64);
        claim.data_mut().copy_from_slice(&[9u8; 16]);
        claim.commit();
        assert_eq!(publication.position(), 64);
    }

    #[test]
    fn test_closed_publication_rejects_offers() {
        let dir = tempdir().unwrap();
        let mut values = vec![0u8; 4 * COUNTER_LENGTH as usize];
        set_limit(&mut values, i64::MAX);
        let publication = publication(dir.path(), &mut values);

        publication.closed.store(true, Ordering::Release);
        assert_eq!(publication.offer(b"x"), Err(PublicationStatus::Closed));
        assert!(publication.try_claim(8).is_err());
    }

    #[test]
    fn test_large_message_fragments() {
        let dir = tempdir().unwrap();
        let mut values = vec![0u8; 4 * COUNTER_LENGTH as usize];
        set_limit(&mut values, i64::MAX);
        let publication = publication(dir.path(), &mut values);

        // Three MTU payloads' worth forces fragmentation.
        let msg = vec![5u8; (publication.max_payload_length() * 2 + 100) as usize];
        let position = publication.offer(&msg).unwrap();
        assert!(position > msg.len() as i64);
    }
}
