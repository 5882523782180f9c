//! Control plane tests: many-to-one command ring under contention and the
//! broadcast channel under overrun.

use std::sync::atomic::{AtomicBool, Ordering};
use termbus::buffer::AtomicBuffer;
use termbus::{broadcast, ringbuffer, BroadcastTransmitter, ClientError, CopyBroadcastReceiver};
use termbus::{ManyToOneRingBuffer};

#[test]
fn test_concurrent_ring_producers_deliver_everything() {
    let mut backing = vec![0u8; 16 * 1024 + ringbuffer::TRAILER_LENGTH as usize];
    let buffer = AtomicBuffer::wrap_slice(&mut backing);
    let ring = ManyToOneRingBuffer::new(buffer).unwrap();

    const PER_PRODUCER: usize = 500;
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for producer in 1..=2i32 {
            let ring = &ring;
            let done = &done;
            scope.spawn(move || {
                for seq in 0..PER_PRODUCER as i32 {
                    let mut msg = [0u8; 12];
                    msg[..4].copy_from_slice(&producer.to_le_bytes());
                    msg[4..8].copy_from_slice(&seq.to_le_bytes());
                    msg[8..].copy_from_slice(&(producer ^ seq).to_le_bytes());
                    loop {
                        match ring.write(producer, &msg) {
                            Ok(()) => break,
                            Err(ClientError::InsufficientCapacity) => {
                                assert!(!done.load(Ordering::Acquire), "consumer gone");
                                std::thread::yield_now();
                            }
                            Err(e) => panic!("unexpected ring error: {}", e),
                        }
                    }
                }
            });
        }

        // Single consumer: sequences per producer must arrive in order.
        let mut next_seq = [0i32; 3];
        let mut received = 0usize;
        while received < 2 * PER_PRODUCER {
            received += ring.read(
                &mut |msg_type_id: i32, msg: &[u8]| {
                    assert_eq!(msg.len(), 12);
                    let producer = i32::from_le_bytes(msg[..4].try_into().unwrap());
                    let seq = i32::from_le_bytes(msg[4..8].try_into().unwrap());
                    let check = i32::from_le_bytes(msg[8..].try_into().unwrap());
                    assert_eq!(msg_type_id, producer);
                    assert_eq!(check, producer ^ seq);
                    assert_eq!(seq, next_seq[producer as usize], "reordered producer stream");
                    next_seq[producer as usize] += 1;
                },
                64,
            );
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(ring.size(), 0);
}

#[test]
fn test_lapped_broadcast_receiver_resumes_at_latest() {
    let mut backing = vec![0u8; 1024 + broadcast::TRAILER_LENGTH as usize];
    let buffer = AtomicBuffer::wrap_slice(&mut backing);
    let transmitter = BroadcastTransmitter::new(buffer).unwrap();
    let mut receiver = CopyBroadcastReceiver::new(buffer).unwrap();

    // Far more data than the ring holds while the receiver is not draining.
    for round in 0..40u8 {
        transmitter.transmit(7, &[round; 100]);
    }

    // The transmitter is quiescent, so the jump-to-latest copy validates and
    // the receiver resumes with the most recent record.
    let (type_id, payload) = receiver.receive().unwrap().expect("latest record");
    assert_eq!(type_id, 7);
    assert_eq!(payload, &[39u8; 100][..]);
    assert!(receiver.lapped_count() >= 1);

    assert!(receiver.receive().unwrap().is_none());
}

#[test]
fn test_live_broadcast_stream_arrives_in_order() {
    let mut backing = vec![0u8; 4096 + broadcast::TRAILER_LENGTH as usize];
    let buffer = AtomicBuffer::wrap_slice(&mut backing);
    let transmitter = BroadcastTransmitter::new(buffer).unwrap();
    let mut receiver = CopyBroadcastReceiver::new(buffer).unwrap();

    // Interleave transmit and receive so the reader keeps up; nothing may be
    // lost or reordered even as records wrap the ring many times.
    let mut expected = 0u32;
    for batch in 0..200u32 {
        transmitter.transmit(1, &batch.to_le_bytes());
        while let Some((type_id, payload)) = receiver.receive().unwrap() {
            assert_eq!(type_id, 1);
            let value = u32::from_le_bytes(payload.try_into().unwrap());
            assert_eq!(value, expected);
            expected += 1;
        }
    }
    assert_eq!(expected, 200);
    assert_eq!(receiver.lapped_count(), 0);
}
