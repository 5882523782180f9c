//! Copying broadcast receiver
//!
//! Wraps [`BroadcastReceiver`] and snapshots each record into an owned
//! scratch buffer, re-validating after the copy. A record overwritten
//! mid-copy means the reader has lost protocol state it can never recover
//! (an event it will never see again), so that case is a hard error rather
//! than a silent skip.

use crate::broadcast::receiver::BroadcastReceiver;
use crate::buffer::AtomicBuffer;
use crate::error::{ClientError, Result};

/// Receiver that yields validated, copied-out records.
pub struct CopyBroadcastReceiver {
    receiver: BroadcastReceiver,
    scratch: Vec<u8>,
}

impl CopyBroadcastReceiver {
    /// Attach to a broadcast buffer at its current tail.
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        Ok(Self {
            receiver: BroadcastReceiver::new(buffer)?,
            scratch: Vec::new(),
        })
    }

    /// Number of times the underlying receiver has been lapped.
    pub fn lapped_count(&self) -> u64 {
        self.receiver.lapped_count()
    }

    /// Receive the next record, if one is available.
    ///
    /// Returns the record's type id and a snapshot of its payload, valid
    /// until the next call. `Ok(None)` means the channel is currently empty.
    pub fn receive(&mut self) -> Result<Option<(i32, &[u8])>> {
        if !self.receiver.receive_next() {
            return Ok(None);
        }

        let length = self.receiver.length() as usize;
        if self.scratch.len() < length {
            self.scratch.resize(length, 0);
        }
        let type_id = self.receiver.type_id();
        self.receiver.copy_out(&mut self.scratch[..length]);

        if !self.receiver.validate() {
            return Err(ClientError::BroadcastLapped);
        }

        Ok(Some((type_id, &self.scratch[..length])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastTransmitter, TRAILER_LENGTH};

    const CAPACITY: usize = 1024;

    #[test]
    fn test_receive_copies_payload() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH as usize];
        let buffer = AtomicBuffer::wrap_slice(&mut backing);
        let tx = BroadcastTransmitter::new(buffer).unwrap();
        let mut rx = CopyBroadcastReceiver::new(buffer).unwrap();

        assert!(rx.receive().unwrap().is_none());

        tx.transmit(0x0F03, b"publication ready");
        tx.transmit(0x0F01, b"unknown channel");

        let (type_id, payload) = rx.receive().unwrap().expect("first record");
        assert_eq!(type_id, 0x0F03);
        assert_eq!(payload, b"publication ready");

        let (type_id, payload) = rx.receive().unwrap().expect("second record");
        assert_eq!(type_id, 0x0F01);
        assert_eq!(payload, b"unknown channel");

        assert!(rx.receive().unwrap().is_none());
    }

    #[test]
    fn test_scratch_grows_for_larger_records() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH as usize];
        let buffer = AtomicBuffer::wrap_slice(&mut backing);
        let tx = BroadcastTransmitter::new(buffer).unwrap();
        let mut rx = CopyBroadcastReceiver::new(buffer).unwrap();

        tx.transmit(1, b"x");
        assert_eq!(rx.receive().unwrap().unwrap().1, b"x");

        let big = vec![0xAB; 100];
        tx.transmit(2, &big);
        assert_eq!(rx.receive().unwrap().unwrap().1, big.as_slice());
    }
}
