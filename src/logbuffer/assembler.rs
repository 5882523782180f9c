//! Fragment reassembly
//!
//! Messages larger than the MTU arrive as `BEGIN_FRAG .. END_FRAG` runs of
//! fragments, one run per session at a time. The assemblers buffer runs per
//! session into growable scratch buffers and deliver only whole messages
//! downstream, passing the final fragment's header metadata through
//! unchanged. Session buffers can be freed explicitly once a session goes
//! inactive to bound memory.

use crate::error::{ClientError, Result};
use crate::logbuffer::frame::{BEGIN_FRAG_FLAG, END_FRAG_FLAG};
use crate::logbuffer::reader::{ControlledAction, Header};
use std::collections::HashMap;

/// Initial (and minimum) reassembly buffer capacity.
pub const BUILDER_MIN_CAPACITY: usize = 4096;

/// Hard cap on reassembly buffer capacity.
pub const BUILDER_MAX_CAPACITY: usize = i32::MAX as usize - 8;

/// A growable scratch buffer for one session's in-flight message.
///
/// Grows geometrically by at least 1.5x up to [`BUILDER_MAX_CAPACITY`].
pub struct BufferBuilder {
    buffer: Vec<u8>,
    limit: usize,
}

impl Default for BufferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferBuilder {
    /// Create an empty builder; storage is allocated on first append.
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            limit: 0,
        }
    }

    /// Bytes currently assembled.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Current allocated capacity.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Roll the assembled length back to an earlier point, discarding bytes
    /// appended since.
    pub fn trim(&mut self, limit: usize) {
        assert!(limit <= self.limit, "cannot trim forwards");
        self.limit = limit;
    }

    /// Discard the assembled bytes, keeping the allocation.
    pub fn reset(&mut self) {
        self.limit = 0;
    }

    /// The assembled bytes so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.limit]
    }

    /// Append a fragment's payload.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let required = self.limit + payload.len();
        if required > BUILDER_MAX_CAPACITY {
            return Err(ClientError::ReassemblyLimit {
                required,
                max: BUILDER_MAX_CAPACITY,
            });
        }
        if required > self.buffer.len() {
            let grown = (self.buffer.len() + (self.buffer.len() >> 1))
                .max(required)
                .max(BUILDER_MIN_CAPACITY)
                .min(BUILDER_MAX_CAPACITY);
            self.buffer.resize(grown, 0);
        }
        self.buffer[self.limit..required].copy_from_slice(payload);
        self.limit = required;
        Ok(())
    }
}

/// Reassembles fragmented messages and delivers whole messages to a
/// delegate fragment handler.
pub struct FragmentAssembler<'a> {
    delegate: Box<dyn FnMut(&[u8], &Header) + 'a>,
    builders: HashMap<i32, BufferBuilder>,
}

impl<'a> FragmentAssembler<'a> {
    /// Wrap a delegate handler that receives only whole messages.
    pub fn new(delegate: impl FnMut(&[u8], &Header) + 'a) -> Self {
        Self {
            delegate: Box::new(delegate),
            builders: HashMap::new(),
        }
    }

    /// Free the reassembly buffer for a session that has gone inactive.
    pub fn free_session_buffer(&mut self, session_id: i32) {
        self.builders.remove(&session_id);
    }

    /// The per-fragment entry point to pass to a poll call.
    pub fn on_fragment(&mut self, payload: &[u8], header: &Header) {
        let flags = header.flags();

        if flags & BEGIN_FRAG_FLAG != 0 && flags & END_FRAG_FLAG != 0 {
            (self.delegate)(payload, header);
            return;
        }

        let builder = self.builders.entry(header.session_id()).or_default();

        if flags & BEGIN_FRAG_FLAG != 0 {
            builder.reset();
            if let Err(err) = builder.append(payload) {
                log::error!("dropping fragmented message: {}", err);
                builder.reset();
            }
        } else if builder.limit() > 0 {
            if let Err(err) = builder.append(payload) {
                log::error!("dropping fragmented message: {}", err);
                builder.reset();
                return;
            }
            if flags & END_FRAG_FLAG != 0 {
                (self.delegate)(builder.as_slice(), header);
                builder.reset();
            }
        }
        // A middle/end fragment with no begin on record is a stale run
        // started before this consumer attached; skip it.
    }
}

/// Controlled-mode counterpart of [`FragmentAssembler`].
///
/// The delegate's verdict on an assembled message is propagated back to the
/// scan. An `Abort` on the final fragment rolls the builder back to its
/// pre-append limit so the redelivered fragment re-appends cleanly.
pub struct ControlledFragmentAssembler<'a> {
    delegate: Box<dyn FnMut(&[u8], &Header) -> ControlledAction + 'a>,
    builders: HashMap<i32, BufferBuilder>,
}

impl<'a> ControlledFragmentAssembler<'a> {
    /// Wrap a delegate handler that receives only whole messages.
    pub fn new(delegate: impl FnMut(&[u8], &Header) -> ControlledAction + 'a) -> Self {
        Self {
            delegate: Box::new(delegate),
            builders: HashMap::new(),
        }
    }

    /// Free the reassembly buffer for a session that has gone inactive.
    pub fn free_session_buffer(&mut self, session_id: i32) {
        self.builders.remove(&session_id);
    }

    /// The per-fragment entry point to pass to a controlled poll call.
    pub fn on_fragment(&mut self, payload: &[u8], header: &Header) -> ControlledAction {
        let flags = header.flags();

        if flags & BEGIN_FRAG_FLAG != 0 && flags & END_FRAG_FLAG != 0 {
            return (self.delegate)(payload, header);
        }

        let builder = self.builders.entry(header.session_id()).or_default();

        if flags & BEGIN_FRAG_FLAG != 0 {
            builder.reset();
            if let Err(err) = builder.append(payload) {
                log::error!("dropping fragmented message: {}", err);
                builder.reset();
            }
            return ControlledAction::Continue;
        }

        if builder.limit() == 0 {
            return ControlledAction::Continue;
        }

        let limit_before_append = builder.limit();
        if let Err(err) = builder.append(payload) {
            log::error!("dropping fragmented message: {}", err);
            builder.reset();
            return ControlledAction::Continue;
        }

        if flags & END_FRAG_FLAG == 0 {
            return ControlledAction::Continue;
        }

        let action = (self.delegate)(builder.as_slice(), header);
        if action == ControlledAction::Abort {
            // The end fragment will be redelivered; unappend it.
            builder.trim(limit_before_append);
        } else {
            builder.reset();
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AtomicBuffer;
    use crate::logbuffer::appender::TermAppender;
    use crate::logbuffer::frame::HeaderTemplate;
    use crate::logbuffer::reader::{controlled_read, read};
    use crate::logbuffer::{pack_tail, TERM_TAIL_COUNTER_OFFSET};

    const TERM_LENGTH: i32 = 64 * 1024;
    const TERM_ID: i32 = 0;
    const BITS: i32 = 16;
    const MAX_PAYLOAD: i32 = 96;

    fn term_with_fragmented(msg: &[u8]) -> Vec<u8> {
        let mut term_backing = vec![0u8; TERM_LENGTH as usize];
        let mut tail_backing = vec![0u8; 64];
        {
            let term = AtomicBuffer::wrap_slice(&mut term_backing);
            let tail = AtomicBuffer::wrap_slice(&mut tail_backing);
            tail.put_i64(TERM_TAIL_COUNTER_OFFSET, pack_tail(TERM_ID, 0));
            let appender = TermAppender::new(
                term,
                tail,
                HeaderTemplate {
                    session_id: 42,
                    stream_id: 1,
                },
            );
            if msg.len() as i32 > MAX_PAYLOAD {
                appender.append_fragmented(msg, MAX_PAYLOAD, None);
            } else {
                appender.append_unfragmented(msg, None);
            }
        }
        term_backing
    }

    #[test]
    fn test_builder_growth_policy() {
        let mut builder = BufferBuilder::new();
        builder.append(&[1u8; 10]).unwrap();
        assert_eq!(builder.capacity(), BUILDER_MIN_CAPACITY);

        builder.append(&vec![2u8; BUILDER_MIN_CAPACITY]).unwrap();
        assert!(builder.capacity() >= BUILDER_MIN_CAPACITY + 10);
        assert_eq!(builder.limit(), BUILDER_MIN_CAPACITY + 10);

        builder.reset();
        assert_eq!(builder.limit(), 0);
        assert!(builder.capacity() >= BUILDER_MIN_CAPACITY);
    }

    #[test]
    fn test_assembler_reassembles_fragments() {
        let msg: Vec<u8> = (0..250u32).map(|v| v as u8).collect();
        let mut term_backing = term_with_fragmented(&msg);
        let term = AtomicBuffer::wrap_slice(&mut term_backing);

        let mut assembled: Vec<Vec<u8>> = Vec::new();
        let mut assembler =
            FragmentAssembler::new(|payload: &[u8], _: &Header| assembled.push(payload.to_vec()));

        let outcome = read(
            &term,
            0,
            &mut |p: &[u8], h: &Header| assembler.on_fragment(p, h),
            usize::MAX,
            TERM_ID,
            BITS,
        );

        drop(assembler);
        assert_eq!(outcome.fragments_read, 3);
        assert_eq!(assembled.len(), 1);
        assert_eq!(assembled[0], msg);
    }

    #[test]
    fn test_assembler_passes_whole_messages_through() {
        let mut term_backing = term_with_fragmented(b"small");
        let term = AtomicBuffer::wrap_slice(&mut term_backing);

        let mut assembled = Vec::new();
        let mut assembler =
            FragmentAssembler::new(|payload: &[u8], _: &Header| assembled.push(payload.to_vec()));

        read(
            &term,
            0,
            &mut |p: &[u8], h: &Header| assembler.on_fragment(p, h),
            usize::MAX,
            TERM_ID,
            BITS,
        );

        drop(assembler);
        assert_eq!(assembled, vec![b"small".to_vec()]);
    }

    #[test]
    fn test_assembler_skips_run_without_begin() {
        let msg: Vec<u8> = vec![7u8; 200];
        let mut term_backing = term_with_fragmented(&msg);
        let term = AtomicBuffer::wrap_slice(&mut term_backing);

        let mut assembled: Vec<Vec<u8>> = Vec::new();
        let mut assembler =
            FragmentAssembler::new(|payload: &[u8], _: &Header| assembled.push(payload.to_vec()));

        // Start the scan past the BEGIN fragment.
        read(
            &term,
            128,
            &mut |p: &[u8], h: &Header| assembler.on_fragment(p, h),
            usize::MAX,
            TERM_ID,
            BITS,
        );

        drop(assembler);
        assert!(assembled.is_empty());
    }

    #[test]
    fn test_controlled_abort_rolls_back_builder() {
        let msg: Vec<u8> = (0..200u32).map(|v| v as u8).collect();
        let mut term_backing = term_with_fragmented(&msg);
        let term = AtomicBuffer::wrap_slice(&mut term_backing);

        let mut deliveries = 0;
        let mut abort_first = true;
        let mut assembled: Vec<Vec<u8>> = Vec::new();
        let mut assembler = ControlledFragmentAssembler::new(|payload: &[u8], _: &Header| {
            deliveries += 1;
            if abort_first {
                abort_first = false;
                ControlledAction::Abort
            } else {
                assembled.push(payload.to_vec());
                ControlledAction::Continue
            }
        });

        let first = controlled_read(
            &term,
            0,
            &mut |p: &[u8], h: &Header| assembler.on_fragment(p, h),
            usize::MAX,
            TERM_ID,
            BITS,
            &mut |_| {},
        );

        // The end fragment was not consumed; rescan from where we stopped.
        let second = controlled_read(
            &term,
            first.offset,
            &mut |p: &[u8], h: &Header| assembler.on_fragment(p, h),
            usize::MAX,
            TERM_ID,
            BITS,
            &mut |_| {},
        );

        drop(assembler);
        assert_eq!(deliveries, 2);
        assert_eq!(second.fragments_read, 1);
        assert_eq!(assembled.len(), 1);
        assert_eq!(assembled[0], msg);
    }
}
