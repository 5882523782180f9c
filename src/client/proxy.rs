//! Command encoding toward the driver
//!
//! `DriverProxy` owns the many-to-one command ring and turns typed requests
//! into ring records. Correlation ids come from the ring's shared counter so
//! they are unique across every client attached to the driver.

use crate::command::{self, CorrelatedCommand, CounterCommand, DestinationCommand,
    PublicationCommand, RemoveCommand, SubscriptionCommand};
use crate::error::Result;
use crate::ringbuffer::ManyToOneRingBuffer;

/// Client-side writer of driver commands.
pub struct DriverProxy {
    ring: ManyToOneRingBuffer,
    client_id: i64,
}

impl DriverProxy {
    /// Attach to the command ring, drawing a fresh client id from its
    /// correlation counter.
    pub fn new(ring: ManyToOneRingBuffer) -> Self {
        let client_id = ring.next_correlation_id();
        Self { ring, client_id }
    }

    /// Identity of this client toward the driver.
    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    fn correlated(&self, correlation_id: i64) -> CorrelatedCommand {
        CorrelatedCommand {
            client_id: self.client_id,
            correlation_id,
        }
    }

    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<i64> {
        let correlation_id = self.ring.next_correlation_id();
        let cmd = PublicationCommand {
            client_id: self.client_id,
            correlation_id,
            stream_id,
            channel: channel.to_string(),
        };
        self.ring.write(command::ADD_PUBLICATION, &cmd.encode())?;
        Ok(correlation_id)
    }

    pub fn add_exclusive_publication(&self, channel: &str, stream_id: i32) -> Result<i64> {
        let correlation_id = self.ring.next_correlation_id();
        let cmd = PublicationCommand {
            client_id: self.client_id,
            correlation_id,
            stream_id,
            channel: channel.to_string(),
        };
        self.ring
            .write(command::ADD_EXCLUSIVE_PUBLICATION, &cmd.encode())?;
        Ok(correlation_id)
    }

    pub fn remove_publication(&self, registration_id: i64) -> Result<i64> {
        let correlation_id = self.ring.next_correlation_id();
        let cmd = RemoveCommand {
            client_id: self.client_id,
            correlation_id,
            registration_id,
        };
        self.ring.write(command::REMOVE_PUBLICATION, &cmd.encode())?;
        Ok(correlation_id)
    }

    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<i64> {
        let correlation_id = self.ring.next_correlation_id();
        let cmd = SubscriptionCommand {
            client_id: self.client_id,
            correlation_id,
            registration_correlation_id: -1,
            stream_id,
            channel: channel.to_string(),
        };
        self.ring.write(command::ADD_SUBSCRIPTION, &cmd.encode())?;
        Ok(correlation_id)
    }

    pub fn remove_subscription(&self, registration_id: i64) -> Result<i64> {
        let correlation_id = self.ring.next_correlation_id();
        let cmd = RemoveCommand {
            client_id: self.client_id,
            correlation_id,
            registration_id,
        };
        self.ring.write(command::REMOVE_SUBSCRIPTION, &cmd.encode())?;
        Ok(correlation_id)
    }

    pub fn add_counter(&self, type_id: i32, label: &str) -> Result<i64> {
        let correlation_id = self.ring.next_correlation_id();
        let cmd = CounterCommand {
            client_id: self.client_id,
            correlation_id,
            type_id,
            label: label.to_string(),
        };
        self.ring.write(command::ADD_COUNTER, &cmd.encode())?;
        Ok(correlation_id)
    }

    pub fn remove_counter(&self, registration_id: i64) -> Result<i64> {
        let correlation_id = self.ring.next_correlation_id();
        let cmd = RemoveCommand {
            client_id: self.client_id,
            correlation_id,
            registration_id,
        };
        self.ring.write(command::REMOVE_COUNTER, &cmd.encode())?;
        Ok(correlation_id)
    }

    pub fn add_destination(&self, registration_id: i64, channel: &str) -> Result<i64> {
        let correlation_id = self.ring.next_correlation_id();
        let cmd = DestinationCommand {
            client_id: self.client_id,
            correlation_id,
            registration_id,
            channel: channel.to_string(),
        };
        self.ring.write(command::ADD_DESTINATION, &cmd.encode())?;
        Ok(correlation_id)
    }

    pub fn remove_destination(&self, registration_id: i64, channel: &str) -> Result<i64> {
        let correlation_id = self.ring.next_correlation_id();
        let cmd = DestinationCommand {
            client_id: self.client_id,
            correlation_id,
            registration_id,
            channel: channel.to_string(),
        };
        self.ring.write(command::REMOVE_DESTINATION, &cmd.encode())?;
        Ok(correlation_id)
    }

    pub fn keepalive(&self) -> Result<()> {
        let cmd = self.correlated(self.ring.next_correlation_id());
        self.ring.write(command::CLIENT_KEEPALIVE, &cmd.encode())
    }

    pub fn client_close(&self) -> Result<()> {
        let cmd = self.correlated(self.ring.next_correlation_id());
        self.ring.write(command::CLIENT_CLOSE, &cmd.encode())
    }
}
