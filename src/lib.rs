//! termbus - a shared-memory messaging transport client
//!
//! # Overview
//!
//! termbus is the client side of a high-throughput message bus: publishers
//! append frames into memory-mapped term log buffers, subscribers poll them
//! back out, and a separately running driver owns the files and the flow
//! control. This crate speaks the shared-memory protocol:
//!
//! 1. Wait-free term appenders using the reserve-write-publish pattern
//! 2. Fragmentation and reassembly of messages larger than the MTU
//! 3. A many-to-one command ring toward the driver and a one-to-many
//!    broadcast channel back from it
//! 4. A client conductor thread handling registrations, keepalives and
//!    liveness
//!
//! # Key Features
//!
//! - Lock-free concurrent publication from multiple threads
//! - Single-writer exclusive publications with no atomic RMW on the hot path
//! - Zero-copy `try_claim` with commit/abort semantics
//! - Memory-mapped I/O throughout; no copies between client and driver
//! - Controlled polling with per-fragment consume/abort/commit decisions
//!
//! # Usage
//!
//! A client typically:
//! 1. Connects with [`Client::connect`] against a driver's control directory
//! 2. Adds publications and subscriptions by channel and stream id
//! 3. Offers messages and polls fragments on the data path
//!
//! The driver-side halves of the shared-memory contracts (log buffer
//! creation, broadcast transmission, command ring consumption) are included
//! so tests and tooling can stand in for a driver in-process.

pub mod broadcast;
pub mod buffer;
pub mod client;
pub mod command;
pub mod counters;
pub mod error;
pub mod idle;
pub mod logbuffer;
pub mod position;
pub mod ringbuffer;

pub use broadcast::{BroadcastReceiver, BroadcastTransmitter, CopyBroadcastReceiver};
pub use buffer::mapped::{LogBuffers, MappedFile};
pub use buffer::AtomicBuffer;
pub use client::exclusive_publication::ExclusivePublication;
pub use client::image::Image;
pub use client::publication::Publication;
pub use client::subscription::Subscription;
pub use client::{Client, Context, Counter};
pub use counters::CountersReader;
pub use error::{ClientError, PublicationStatus, Result};
pub use idle::{BackoffIdleStrategy, BusySpinIdleStrategy, IdleStrategy, SleepingIdleStrategy};
pub use logbuffer::assembler::{ControlledFragmentAssembler, FragmentAssembler};
pub use logbuffer::reader::{ControlledAction, Header};
pub use ringbuffer::ManyToOneRingBuffer;
