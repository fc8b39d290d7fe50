//! `riptide_core`
//!
//! A lightweight, transport-agnostic networking layer for real-time games:
//! unreliable/reliable/notify delivery over a single fixed-size message
//! buffer, a synchronous `tick()` scheduler, and a polled event queue.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (wire format, reliability engine,
//!   connection lifecycle, transport, events).
//! - Traits for abstraction and dependency injection (`Transport`).
//! - No `unsafe`.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod header;
pub mod message;
pub mod pool;
pub mod registry;
pub mod reliability;
pub mod sequence;
pub mod server;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::client::Client;
    pub use crate::config::RiptideConfig;
    pub use crate::connection::{Connection, ConnectionState, DisconnectReason};
    pub use crate::error::{Result, RiptideError};
    pub use crate::event::{Event, EventQueue, InboundMessage};
    pub use crate::message::{Message, SendMode};
    pub use crate::registry::HandlerRegistry;
    pub use crate::server::Server;
    pub use crate::transport::{Transport, TransportEvent, UdpTransport};
}
