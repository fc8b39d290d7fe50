//! Error kinds surfaced by the core. None of these use exceptional control
//! flow — every fallible operation returns a `Result<_, RiptideError>`.

use thiserror::Error;

/// Errors the core can report. Matches the list in the protocol's error
/// handling design: every kind is a return value or an event, never a panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RiptideError {
    /// A `get_*` read past the write cursor.
    #[error("read past end of message")]
    EndOfMessage,

    /// An `add_*` write past the buffer's capacity.
    #[error("insufficient capacity in message buffer")]
    InsufficientCapacity,

    /// `ip:port` could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// `connect()` called while already connected or connecting.
    #[error("already connected")]
    AlreadyConnected,

    /// An operation that requires an active connection was attempted
    /// without one.
    #[error("not connected")]
    NotConnected,

    /// A fatal transport-level failure (socket closed, disposed, etc).
    #[error("transport error: {0}")]
    TransportError(String),

    /// The peer rejected the connection attempt.
    #[error("connection rejected")]
    Rejected,
}

pub type Result<T> = std::result::Result<T, RiptideError>;
