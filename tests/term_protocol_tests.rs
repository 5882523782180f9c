//! Term log protocol tests: concurrent appends, fragmentation, reassembly.

use termbus::buffer::AtomicBuffer;
use termbus::logbuffer::appender::TermAppender;
use termbus::logbuffer::frame::HeaderTemplate;
use termbus::logbuffer::reader::{self, Header};
use termbus::logbuffer::{pack_tail, TERM_TAIL_COUNTER_OFFSET};
use termbus::position::position_bits_to_shift;
use termbus::FragmentAssembler;

const TERM_LENGTH: i32 = 256 * 1024;
const TERM_ID: i32 = 1;

fn template() -> HeaderTemplate {
    HeaderTemplate {
        session_id: 1,
        stream_id: 2,
    }
}

#[test]
fn test_concurrent_appenders_never_overlap() {
    let mut term_backing = vec![0u8; TERM_LENGTH as usize];
    let mut tail_backing = vec![0u8; 64];
    let term = AtomicBuffer::wrap_slice(&mut term_backing);
    let tail = AtomicBuffer::wrap_slice(&mut tail_backing);
    tail.put_i64(TERM_TAIL_COUNTER_OFFSET, pack_tail(TERM_ID, 0));

    std::thread::scope(|scope| {
        for writer in 1..=2u8 {
            scope.spawn(move || {
                let appender = TermAppender::new(term, tail, template());
                let payload = [writer; 16];
                for _ in 0..1000 {
                    let resulting = appender.append_unfragmented(&payload, None);
                    assert!(resulting > 0, "term must not fill in this test");
                }
            });
        }
    });

    // Every frame must be whole: 16 uniform bytes from one writer.
    let mut counts = [0usize; 3];
    let outcome = reader::read(
        &term,
        0,
        &mut |payload: &[u8], _: &Header| {
            assert_eq!(payload.len(), 16);
            let writer = payload[0];
            assert!(writer == 1 || writer == 2, "corrupt payload byte {}", writer);
            assert!(payload.iter().all(|&b| b == writer), "torn frame");
            counts[writer as usize] += 1;
        },
        usize::MAX,
        TERM_ID,
        position_bits_to_shift(TERM_LENGTH),
    );

    assert_eq!(outcome.fragments_read, 2000);
    assert_eq!(counts[1], 1000);
    assert_eq!(counts[2], 1000);
    assert_eq!(outcome.offset, 2000 * 64);
}

#[test]
fn test_fragmented_message_reassembles() {
    let mut term_backing = vec![0u8; TERM_LENGTH as usize];
    let mut tail_backing = vec![0u8; 64];
    let term = AtomicBuffer::wrap_slice(&mut term_backing);
    let tail = AtomicBuffer::wrap_slice(&mut tail_backing);
    tail.put_i64(TERM_TAIL_COUNTER_OFFSET, pack_tail(TERM_ID, 0));

    let appender = TermAppender::new(term, tail, template());
    let message: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let max_payload = 1376; // 1408 MTU minus the header
    assert!(appender.append_fragmented(&message, max_payload, None) > 0);

    let mut assembled: Vec<Vec<u8>> = Vec::new();
    {
        let mut assembler =
            FragmentAssembler::new(|payload: &[u8], _: &Header| assembled.push(payload.to_vec()));
        let mut handler =
            |payload: &[u8], header: &Header| assembler.on_fragment(payload, header);
        let outcome = reader::read(
            &term,
            0,
            &mut handler,
            usize::MAX,
            TERM_ID,
            position_bits_to_shift(TERM_LENGTH),
        );
        assert_eq!(outcome.fragments_read, 4); // 3 full fragments + remainder
    }

    assert_eq!(assembled.len(), 1);
    assert_eq!(assembled[0], message);
}

#[test]
fn test_interleaved_sessions_reassemble_independently() {
    let mut term_backing = vec![0u8; TERM_LENGTH as usize];
    let mut tail_backing = vec![0u8; 64];
    let term = AtomicBuffer::wrap_slice(&mut term_backing);
    let tail = AtomicBuffer::wrap_slice(&mut tail_backing);
    tail.put_i64(TERM_TAIL_COUNTER_OFFSET, pack_tail(TERM_ID, 0));

    // Two sessions interleave their fragment runs in one term. Each run is
    // appended atomically, so interleaving happens at run granularity.
    let session_a = TermAppender::new(
        term,
        tail,
        HeaderTemplate {
            session_id: 10,
            stream_id: 2,
        },
    );
    let session_b = TermAppender::new(
        term,
        tail,
        HeaderTemplate {
            session_id: 20,
            stream_id: 2,
        },
    );

    let msg_a: Vec<u8> = vec![0xAA; 3000];
    let msg_b: Vec<u8> = vec![0xBB; 2600];
    assert!(session_a.append_fragmented(&msg_a, 1376, None) > 0);
    assert!(session_b.append_fragmented(&msg_b, 1376, None) > 0);

    let mut assembled: Vec<(i32, usize)> = Vec::new();
    {
        let mut assembler = FragmentAssembler::new(|payload: &[u8], header: &Header| {
            assembled.push((header.session_id(), payload.len()))
        });
        let mut handler =
            |payload: &[u8], header: &Header| assembler.on_fragment(payload, header);
        reader::read(
            &term,
            0,
            &mut handler,
            usize::MAX,
            TERM_ID,
            position_bits_to_shift(TERM_LENGTH),
        );
    }

    assert_eq!(assembled, vec![(10, 3000), (20, 2600)]);
}
