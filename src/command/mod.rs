//! Control-protocol messages between client and driver
//!
//! Commands travel client → driver over the command ring; events travel
//! driver → client over the broadcast channel. Every layout is a fixed
//! little-endian contract; strings are `[len:i32][utf8]` padded to 4-byte
//! alignment.
//!
//! Each message carries both an `encode` (used by the client proxy, and by
//! the in-process driver the tests run) and a `decode` so either side can be
//! exercised against the other.

use crate::error::{ClientError, Result};

// Command type ids (client → driver).

/// Add a concurrent publication.
pub const ADD_PUBLICATION: i32 = 0x01;
/// Remove a publication by registration id.
pub const REMOVE_PUBLICATION: i32 = 0x02;
/// Add an exclusive (single-writer) publication.
pub const ADD_EXCLUSIVE_PUBLICATION: i32 = 0x03;
/// Add a subscription.
pub const ADD_SUBSCRIPTION: i32 = 0x04;
/// Remove a subscription by registration id.
pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
/// Client liveness keepalive.
pub const CLIENT_KEEPALIVE: i32 = 0x06;
/// Add a destination to a multi-destination resource.
pub const ADD_DESTINATION: i32 = 0x07;
/// Remove a destination.
pub const REMOVE_DESTINATION: i32 = 0x08;
/// Allocate a counter.
pub const ADD_COUNTER: i32 = 0x09;
/// Free a counter by registration id.
pub const REMOVE_COUNTER: i32 = 0x0A;
/// Orderly client shutdown notice.
pub const CLIENT_CLOSE: i32 = 0x0B;

// Event type ids (driver → client).

/// A command failed; payload names the offending correlation id.
pub const ON_ERROR: i32 = 0x0F01;
/// A command with no resource payload succeeded.
pub const ON_OPERATION_SUCCESS: i32 = 0x0F02;
/// A concurrent publication is ready for use.
pub const ON_PUBLICATION_READY: i32 = 0x0F03;
/// A subscription is registered.
pub const ON_SUBSCRIPTION_READY: i32 = 0x0F04;
/// A new image is available to a subscription.
pub const ON_AVAILABLE_IMAGE: i32 = 0x0F05;
/// An image has gone away.
pub const ON_UNAVAILABLE_IMAGE: i32 = 0x0F06;
/// A counter allocation completed.
pub const ON_COUNTER_READY: i32 = 0x0F07;
/// An exclusive publication is ready for use.
pub const ON_EXCLUSIVE_PUBLICATION_READY: i32 = 0x0F08;
/// A counter has been freed.
pub const ON_UNAVAILABLE_COUNTER: i32 = 0x0F09;
/// The driver has declared a client dead.
pub const ON_CLIENT_TIMEOUT: i32 = 0x0F0A;

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    put_i32(out, bytes.len() as i32);
    out.extend_from_slice(bytes);
    // Pad to 4-byte alignment.
    let pad = (4 - (bytes.len() % 4)) % 4;
    out.extend_from_slice(&[0u8; 3][..pad]);
}

/// Sequential reader over a received message payload.
struct Decoder<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.offset + count > self.buf.len() {
            return Err(ClientError::InvalidBuffer(format!(
                "truncated control message: need {} bytes at offset {}, have {}",
                count,
                self.offset,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_string(&mut self) -> Result<String> {
        let length = self.read_i32()?;
        if length < 0 {
            return Err(ClientError::InvalidBuffer(format!(
                "negative string length {} in control message",
                length
            )));
        }
        let value = String::from_utf8_lossy(self.take(length as usize)?).into_owned();
        let pad = (4 - (length as usize % 4)) % 4;
        self.take(pad)?;
        Ok(value)
    }
}

/// Header-only command: keepalive and client-close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatedCommand {
    pub client_id: i64,
    pub correlation_id: i64,
}

impl CorrelatedCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        put_i64(&mut out, self.client_id);
        put_i64(&mut out, self.correlation_id);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            client_id: d.read_i64()?,
            correlation_id: d.read_i64()?,
        })
    }
}

/// Add-publication command (concurrent or exclusive, per type id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl PublicationCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.channel.len() + 4);
        put_i64(&mut out, self.client_id);
        put_i64(&mut out, self.correlation_id);
        put_i32(&mut out, self.stream_id);
        put_string(&mut out, &self.channel);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            client_id: d.read_i64()?,
            correlation_id: d.read_i64()?,
            stream_id: d.read_i32()?,
            channel: d.read_string()?,
        })
    }
}

/// Remove a resource identified by its registration id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub registration_id: i64,
}

impl RemoveCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        put_i64(&mut out, self.client_id);
        put_i64(&mut out, self.correlation_id);
        put_i64(&mut out, self.registration_id);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            client_id: d.read_i64()?,
            correlation_id: d.read_i64()?,
            registration_id: d.read_i64()?,
        })
    }
}

/// Add-subscription command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub registration_correlation_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl SubscriptionCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.channel.len() + 4);
        put_i64(&mut out, self.client_id);
        put_i64(&mut out, self.correlation_id);
        put_i64(&mut out, self.registration_correlation_id);
        put_i32(&mut out, self.stream_id);
        put_string(&mut out, &self.channel);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            client_id: d.read_i64()?,
            correlation_id: d.read_i64()?,
            registration_correlation_id: d.read_i64()?,
            stream_id: d.read_i32()?,
            channel: d.read_string()?,
        })
    }
}

/// Add or remove a destination on an existing resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub registration_id: i64,
    pub channel: String,
}

impl DestinationCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.channel.len() + 4);
        put_i64(&mut out, self.client_id);
        put_i64(&mut out, self.correlation_id);
        put_i64(&mut out, self.registration_id);
        put_string(&mut out, &self.channel);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            client_id: d.read_i64()?,
            correlation_id: d.read_i64()?,
            registration_id: d.read_i64()?,
            channel: d.read_string()?,
        })
    }
}

/// Allocate a counter with a type id and label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub type_id: i32,
    pub label: String,
}

impl CounterCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.label.len() + 4);
        put_i64(&mut out, self.client_id);
        put_i64(&mut out, self.correlation_id);
        put_i32(&mut out, self.type_id);
        put_string(&mut out, &self.label);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            client_id: d.read_i64()?,
            correlation_id: d.read_i64()?,
            type_id: d.read_i32()?,
            label: d.read_string()?,
        })
    }
}

/// Publication-ready event, concurrent or exclusive per type id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationReadyEvent {
    pub correlation_id: i64,
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub position_limit_counter_id: i32,
    pub log_file_name: String,
}

impl PublicationReadyEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.log_file_name.len() + 4);
        put_i64(&mut out, self.correlation_id);
        put_i64(&mut out, self.registration_id);
        put_i32(&mut out, self.session_id);
        put_i32(&mut out, self.stream_id);
        put_i32(&mut out, self.position_limit_counter_id);
        put_string(&mut out, &self.log_file_name);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            correlation_id: d.read_i64()?,
            registration_id: d.read_i64()?,
            session_id: d.read_i32()?,
            stream_id: d.read_i32()?,
            position_limit_counter_id: d.read_i32()?,
            log_file_name: d.read_string()?,
        })
    }
}

/// Subscription-ready event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionReadyEvent {
    pub correlation_id: i64,
    pub channel_status_id: i32,
}

impl SubscriptionReadyEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        put_i64(&mut out, self.correlation_id);
        put_i32(&mut out, self.channel_status_id);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            correlation_id: d.read_i64()?,
            channel_status_id: d.read_i32()?,
        })
    }
}

/// Bare success acknowledgement for commands with no resource payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSuccessEvent {
    pub correlation_id: i64,
}

impl OperationSuccessEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        put_i64(&mut out, self.correlation_id);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            correlation_id: d.read_i64()?,
        })
    }
}

/// A new image joined a subscribed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableImageEvent {
    pub correlation_id: i64,
    pub session_id: i32,
    pub subscriber_position_id: i32,
    pub subscription_registration_id: i64,
    pub log_file_name: String,
    pub source_identity: String,
}

impl AvailableImageEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            24 + self.log_file_name.len() + self.source_identity.len() + 8,
        );
        put_i64(&mut out, self.correlation_id);
        put_i32(&mut out, self.session_id);
        put_i32(&mut out, self.subscriber_position_id);
        put_i64(&mut out, self.subscription_registration_id);
        put_string(&mut out, &self.log_file_name);
        put_string(&mut out, &self.source_identity);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            correlation_id: d.read_i64()?,
            session_id: d.read_i32()?,
            subscriber_position_id: d.read_i32()?,
            subscription_registration_id: d.read_i64()?,
            log_file_name: d.read_string()?,
            source_identity: d.read_string()?,
        })
    }
}

/// An image left a subscribed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableImageEvent {
    pub correlation_id: i64,
    pub subscription_registration_id: i64,
}

impl UnavailableImageEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        put_i64(&mut out, self.correlation_id);
        put_i64(&mut out, self.subscription_registration_id);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            correlation_id: d.read_i64()?,
            subscription_registration_id: d.read_i64()?,
        })
    }
}

/// Driver-side failure of a correlated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub offending_correlation_id: i64,
    pub error_code: i32,
    pub message: String,
}

impl ErrorEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.message.len() + 4);
        put_i64(&mut out, self.offending_correlation_id);
        put_i32(&mut out, self.error_code);
        put_string(&mut out, &self.message);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            offending_correlation_id: d.read_i64()?,
            error_code: d.read_i32()?,
            message: d.read_string()?,
        })
    }
}

/// Counter-ready and counter-unavailable share this payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdateEvent {
    pub correlation_id: i64,
    pub counter_id: i32,
}

impl CounterUpdateEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        put_i64(&mut out, self.correlation_id);
        put_i32(&mut out, self.counter_id);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            correlation_id: d.read_i64()?,
            counter_id: d.read_i32()?,
        })
    }
}

/// The driver timed a client out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTimeoutEvent {
    pub client_id: i64,
}

impl ClientTimeoutEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        put_i64(&mut out, self.client_id);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            client_id: d.read_i64()?,
        })
    }
}
