//! Error taxonomy for the client transport engine
//!
//! Errors fall into distinct classes with different propagation rules:
//!
//! - Contract violations (negative lengths, oversize messages, bad term
//!   lengths) fail fast with panics at the call site and never reach this
//!   enum.
//! - Flow conditions on the data path are not errors at all; they are
//!   returned as [`PublicationStatus`] sentinels for the caller to retry.
//! - Registration faults surface synchronously to blocking callers, or via
//!   the error handler for async commands.
//! - Liveness faults (driver timeout, stalled conductor, client timeout)
//!   are fatal to the whole client: every resource is force-closed before
//!   the fault propagates.
//! - Protocol corruption (a broadcast reader lapped mid-copy) is fatal and
//!   must never be silently retried.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Non-error flow conditions reported by publication offer/claim calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationStatus {
    /// No subscriber has ever sent a status message for this stream.
    NotConnected,
    /// The position limit has been reached; retry after the subscriber
    /// catches up.
    BackPressured,
    /// A term rotation or stale term-count race occurred; retry immediately.
    AdminAction,
    /// The publication has been closed.
    Closed,
    /// The stream has reached the maximum representable position.
    MaxPositionExceeded,
}

/// Errors raised by the client control plane.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An I/O error while creating or mapping a control or log file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A mapped file failed layout validation.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// The driver rejected a command.
    #[error("registration error {code}: {message}")]
    Registration {
        /// Driver-supplied error code.
        code: i32,
        /// Driver-supplied error message.
        message: String,
    },

    /// No correlated response arrived before the driver-timeout deadline,
    /// or the driver heartbeat went stale.
    #[error("driver timeout: {0}")]
    DriverTimeout(String),

    /// The conductor thread itself stalled past its service interval.
    #[error("conductor service interval exceeded: {0}")]
    ConductorServiceTimeout(String),

    /// The driver declared this client dead.
    #[error("client timeout from driver")]
    ClientTimeout,

    /// A client API entry point was invoked from within an event callback.
    #[error("reentrant call from within a client callback")]
    Reentrancy,

    /// A user-supplied handler panicked. The panic is contained on the
    /// thread that invoked it; the client keeps running.
    #[error("user handler panicked: {0}")]
    HandlerPanic(String),

    /// The command ring had insufficient space; the driver is not draining.
    #[error("insufficient capacity in driver command ring")]
    InsufficientCapacity,

    /// A broadcast record was overwritten while being copied out. The
    /// reader fell behind catastrophically and the snapshot is unusable.
    #[error("broadcast reader lapped mid-copy; record lost")]
    BroadcastLapped,

    /// A reassembly buffer would exceed its maximum capacity. Distinct from
    /// back-pressure: the message can never be assembled.
    #[error("reassembly buffer limit exceeded: {required} > {max}")]
    ReassemblyLimit {
        /// Bytes the assembled message would need.
        required: usize,
        /// Hard cap on reassembly buffer capacity.
        max: usize,
    },

    /// The client (or the resource) is already closed.
    #[error("client is closed")]
    Closed,
}
