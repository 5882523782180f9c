//! Reader over the driver's counter values file
//!
//! The values file is a flat array of 64-byte slots; the counter value is
//! the `i64` at the start of its slot, read with acquire semantics because
//! the driver (or a subscriber) updates it concurrently. Counter id 0 is
//! the driver heartbeat timestamp in epoch milliseconds.

use crate::buffer::AtomicBuffer;

/// Bytes reserved per counter.
pub const COUNTER_LENGTH: i32 = 64;
/// Counter id carrying the driver heartbeat timestamp.
pub const DRIVER_HEARTBEAT_COUNTER_ID: i32 = 0;

/// Read-side view over the counter values buffer.
#[derive(Clone, Copy)]
pub struct CountersReader {
    values: AtomicBuffer,
}

impl CountersReader {
    /// Wrap the values buffer.
    pub fn new(values: AtomicBuffer) -> Self {
        Self { values }
    }

    /// Highest counter id the buffer can hold.
    pub fn max_counter_id(&self) -> i32 {
        (self.values.capacity() / COUNTER_LENGTH) - 1
    }

    /// Byte offset of a counter's value slot.
    pub fn counter_offset(counter_id: i32) -> i32 {
        counter_id * COUNTER_LENGTH
    }

    /// Current value of a counter.
    pub fn counter_value(&self, counter_id: i32) -> i64 {
        assert!(
            counter_id >= 0 && counter_id <= self.max_counter_id(),
            "counter id {} out of range 0..={}",
            counter_id,
            self.max_counter_id()
        );
        self.values
            .get_i64_volatile(Self::counter_offset(counter_id))
    }

    /// Driver heartbeat timestamp, epoch milliseconds.
    pub fn driver_heartbeat_ms(&self) -> i64 {
        self.counter_value(DRIVER_HEARTBEAT_COUNTER_ID)
    }

    /// The raw values buffer, for position counters that are written by the
    /// client side (subscriber positions, publication limits in tests).
    pub fn values_buffer(&self) -> AtomicBuffer {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_values_by_slot() {
        let mut backing = vec![0u8; 4 * COUNTER_LENGTH as usize];
        let values = AtomicBuffer::wrap_slice(&mut backing);
        let reader = CountersReader::new(values);

        assert_eq!(reader.max_counter_id(), 3);

        values.put_i64_ordered(CountersReader::counter_offset(0), 1_700_000_000_000);
        values.put_i64_ordered(CountersReader::counter_offset(2), 4096);

        assert_eq!(reader.driver_heartbeat_ms(), 1_700_000_000_000);
        assert_eq!(reader.counter_value(1), 0);
        assert_eq!(reader.counter_value(2), 4096);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_counter_id() {
        let mut backing = vec![0u8; 2 * COUNTER_LENGTH as usize];
        let reader = CountersReader::new(AtomicBuffer::wrap_slice(&mut backing));
        reader.counter_value(2);
    }
}
