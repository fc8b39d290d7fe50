//! Transport abstraction: the narrow interface between the core and the
//! outside world. The core owns no sockets; it only sees [`TransportEvent`].
//!
//! [`UdpTransport`] is the default, backed by a non-blocking
//! `std::net::UdpSocket`. [`sim::SimTransport`] is an in-memory harness used
//! by integration tests to drive the reliability engine under controlled
//! loss/reordering.

pub mod sim;

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use tracing::{debug, warn};

use crate::connection::DisconnectReason;
use crate::error::{Result, RiptideError};

/// Datagrams drained from the socket in a single [`Transport::poll`] call.
/// Bounds the time a `tick()` can spend draining a flooded socket.
const DEFAULT_POLL_BUDGET: usize = 512;

/// Transport-level lifecycle events, handed to the Peer Hub each `tick()`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Server-side only: a connection-oriented transport (e.g. TCP) has a
    /// pending inbound connection at `endpoint`. `UdpTransport` never emits
    /// this — UDP is connectionless, so the core derives "connecting" from
    /// the `Connect` header tag instead.
    Connecting(SocketAddr),
    /// A connection-oriented transport completed its handshake with `endpoint`.
    Connected(SocketAddr),
    /// A datagram arrived from `endpoint`.
    DataReceived(SocketAddr, Vec<u8>),
    /// The transport itself tore down the channel to `endpoint`.
    Disconnected(SocketAddr, DisconnectReason),
    /// A fatal, transport-wide failure (socket closed/disposed). The
    /// transport stops; the caller should treat every connection it still
    /// has mapped as `Disconnected{TransportError}` (§7).
    TransportFailed,
}

/// Narrow interface the core uses to move bytes to/from a peer-identified
/// endpoint. The core never downcasts a `Transport` — both implementations
/// below are driven purely through this trait.
pub trait Transport {
    /// Local bound address, once started.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Best-effort send; no error surface unless the transport has failed.
    fn send(&mut self, bytes: &[u8], to: SocketAddr);

    /// Drains pending inbound events, up to an implementation-defined
    /// per-call budget. Never blocks.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Releases the underlying resource. Idempotent.
    fn stop(&mut self);
}

/// Default transport: a non-blocking UDP socket with a bounded per-poll
/// datagram budget, mirroring the drain-until-`WouldBlock` loop used
/// elsewhere in this codebase for socket reads.
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    poll_budget: usize,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    /// Binds a UDP socket at `addr` in non-blocking mode. `addr`'s port may
    /// be `0` for an ephemeral client port.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|e| RiptideError::TransportError(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| RiptideError::TransportError(e.to_string()))?;
        Ok(Self {
            socket: Some(socket),
            poll_budget: DEFAULT_POLL_BUDGET,
            recv_buf: vec![0u8; crate::message::MAX_MESSAGE_SIZE],
        })
    }

    /// Whether a transient socket error (reset, oversized datagram, etc.)
    /// should be swallowed-and-counted rather than treated as fatal (§7).
    fn is_transient(kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::WouldBlock | ErrorKind::ConnectionReset | ErrorKind::TimedOut | ErrorKind::Interrupted
        )
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn send(&mut self, bytes: &[u8], to: SocketAddr) {
        let Some(socket) = &self.socket else { return };
        if let Err(e) = socket.send_to(bytes, to) {
            if !Self::is_transient(e.kind()) {
                warn!(error = %e, %to, "udp send failed fatally, stopping transport");
                self.socket = None;
            } else {
                debug!(error = %e, %to, "transient udp send error");
            }
        }
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let Some(socket) = &self.socket else {
            return events;
        };

        for _ in 0..self.poll_budget {
            match socket.recv_from(&mut self.recv_buf) {
                Ok((n, from)) => {
                    events.push(TransportEvent::DataReceived(from, self.recv_buf[..n].to_vec()));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if Self::is_transient(e.kind()) => {
                    debug!(error = %e, "transient udp recv error");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "fatal udp recv error, stopping transport");
                    self.socket = None;
                    events.push(TransportEvent::TransportFailed);
                    break;
                }
            }
        }
        events
    }

    fn stop(&mut self) {
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn udp_round_trip() {
        let mut a = UdpTransport::bind(loopback()).unwrap();
        let mut b = UdpTransport::bind(loopback()).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send(b"hello", b_addr);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let events = b.poll();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TransportEvent::DataReceived(_, bytes) => assert_eq!(bytes, b"hello"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn poll_on_empty_socket_returns_nothing() {
        let mut a = UdpTransport::bind(loopback()).unwrap();
        assert!(a.poll().is_empty());
    }
}
