//! Polled event queue handed to the host application each `tick()`.
//!
//! The reference protocol exposes subscribable events; this port prefers a
//! polled queue instead (§9 DESIGN NOTES), which composes more simply with a
//! synchronous, single-threaded `tick()`.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::connection::DisconnectReason;
use crate::message::Message;

/// A user message delivered from a peer, tagged with its application-defined
/// message id so the host can dispatch it through its own
/// [`crate::registry::HandlerRegistry`].
#[derive(Debug)]
pub struct InboundMessage {
    pub from: u16,
    pub id: u16,
    pub body: Message,
}

/// Events surfaced by [`crate::server::Server::tick`] /
/// [`crate::client::Client::tick`]. Fire only from inside `tick()`, never
/// synchronously from `send()`.
#[derive(Debug)]
pub enum Event {
    /// Server-side: a client finished the handshake and was assigned `id`.
    ClientConnected { id: u16 },
    /// A connection reached a terminal state.
    ClientDisconnected { id: u16, reason: DisconnectReason },
    /// Client-side: the local connection attempt failed after
    /// `MaxConnectionAttempts` retries.
    ConnectionFailed,
    /// Client-side: the server's connected-peer roster gained `id`. Fired
    /// from the server's `ClientConnected` broadcast, distinct from this
    /// client's own [`Event::ClientConnected`] (which carries this client's
    /// own assigned id).
    PeerConnected { id: u16 },
    /// Client-side: the server's connected-peer roster lost `id`.
    PeerDisconnected { id: u16 },
    /// A user message arrived (any send mode), not consumed by the relay
    /// filter.
    Message(InboundMessage),
    /// A reliable send was confirmed delivered.
    ReliableDelivered { to: u16, sequence_id: u16 },
    /// A notify send was confirmed delivered.
    NotifyDelivered { to: u16, tag: u64 },
    /// A notify send fell outside the peer's ack window: presumed lost.
    NotifyLost { to: u16, tag: u64 },
    /// A raw socket address appeared that isn't mapped to any connection
    /// (server-side, pre-handshake traffic the accept policy hasn't seen).
    UnknownSender { addr: SocketAddr },
}

/// FIFO queue of pending [`Event`]s.
#[derive(Default)]
pub struct EventQueue {
    queue: VecDeque<Event>,
}

impl EventQueue {
    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    /// Drains every queued event, in arrival order.
    pub fn drain(&mut self) -> Vec<Event> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_arrival_order() {
        let mut q = EventQueue::default();
        q.push(Event::ClientConnected { id: 1 });
        q.push(Event::ClientConnected { id: 2 });
        let drained = q.drain();
        assert!(matches!(drained[0], Event::ClientConnected { id: 1 }));
        assert!(matches!(drained[1], Event::ClientConnected { id: 2 }));
        assert!(q.is_empty());
    }
}
