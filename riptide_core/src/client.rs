//! Client-side Peer Hub: a single outbound connection, its handshake retry
//! loop, and the heartbeat/RTT exchange.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::RiptideConfig;
use crate::connection::{Connection, ConnectionState, DisconnectReason};
use crate::error::{Result, RiptideError};
use crate::event::{Event, EventQueue, InboundMessage};
use crate::header::HeaderTag;
use crate::message::{Message, SendMode};
use crate::pool::Pool;
use crate::sequence::SequenceId;
use crate::transport::{Transport, TransportEvent};

/// Tracks the in-flight handshake before a [`Connection`] exists.
struct PendingConnect {
    remote: SocketAddr,
    attempts: u32,
    last_sent_at: Instant,
}

/// Client-side half of the Peer Hub. At most one active connection at a
/// time (spec.md §4.4/§4.5 — this is the single-peer counterpart to
/// [`crate::server::Server`]'s many-peer map).
pub struct Client {
    transport: Box<dyn Transport>,
    config: RiptideConfig,

    connection: Option<Connection>,
    pending_connect: Option<PendingConnect>,

    events: EventQueue,
}

impl Client {
    pub fn new(transport: Box<dyn Transport>, config: RiptideConfig) -> Self {
        Pool::grow();
        Self {
            transport,
            config,
            connection: None,
            pending_connect: None,
            events: EventQueue::default(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        matches!(&self.connection, Some(c) if c.state == ConnectionState::Connected)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(|c| c.remote)
    }

    pub fn connection_id(&self) -> Option<u16> {
        self.connection.as_ref().map(|c| c.id)
    }

    /// Starts (or restarts) a handshake toward `remote`. Fails fast if a
    /// connection or handshake is already in progress.
    pub fn connect(&mut self, remote: SocketAddr) -> Result<()> {
        if self.connection.is_some() || self.pending_connect.is_some() {
            return Err(RiptideError::AlreadyConnected);
        }
        let now = Instant::now();
        self.send_connect(remote);
        self.pending_connect = Some(PendingConnect { remote, attempts: 1, last_sent_at: now });
        Ok(())
    }

    fn send_connect(&mut self, remote: SocketAddr) {
        let mut msg = Pool::acquire_raw();
        if msg.add_bits(HeaderTag::Connect.as_u8() as u64, 8).is_ok() {
            self.transport.send(msg.as_bytes(), remote);
        }
        Pool::release(msg);
    }

    /// Clean, client-initiated disconnect: notifies the peer, tears down
    /// local state immediately (no handshake to wait for).
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            let mut msg = Pool::acquire_raw();
            if msg.add_bits(HeaderTag::Disconnect.as_u8() as u64, 8).is_ok() {
                self.transport.send(msg.as_bytes(), conn.remote);
            }
            Pool::release(msg);
            self.events.push(Event::ClientDisconnected { id: conn.id, reason: DisconnectReason::Disconnected });
        }
        self.pending_connect = None;
    }

    pub fn tick(&mut self) {
        let now = Instant::now();
        self.poll_transport(now);
        self.retry_handshake(now);
        self.run_heartbeat(now);
        self.run_timeout(now);
        self.run_retries(now);
    }

    pub fn poll_events(&mut self) -> Vec<Event> {
        self.events.drain()
    }

    fn poll_transport(&mut self, now: Instant) {
        for event in self.transport.poll() {
            match event {
                TransportEvent::DataReceived(from, bytes) => self.handle_datagram(from, bytes, now),
                TransportEvent::TransportFailed => self.fail_connection(DisconnectReason::TransportError),
                TransportEvent::Disconnected(addr, reason) => {
                    if self.connection.as_ref().is_some_and(|c| c.remote == addr) {
                        self.fail_connection(reason);
                    }
                }
                TransportEvent::Connecting(_) | TransportEvent::Connected(_) => {}
            }
        }
    }

    fn retry_handshake(&mut self, now: Instant) {
        let Some(pending) = &mut self.pending_connect else { return };
        if now.duration_since(pending.last_sent_at) < self.config.heartbeat_interval() {
            return;
        }
        if pending.attempts >= self.config.max_connection_attempts {
            self.pending_connect = None;
            self.events.push(Event::ConnectionFailed);
            return;
        }
        pending.attempts += 1;
        pending.last_sent_at = now;
        let remote = pending.remote;
        self.send_connect(remote);
    }

    fn run_heartbeat(&mut self, now: Instant) {
        let Some(conn) = &mut self.connection else { return };
        if conn.pending_ping.is_some() {
            return;
        }
        if now.duration_since(conn.last_heartbeat) < self.config.heartbeat_interval() {
            return;
        }
        let ping_id = conn.next_outbound_ping_id();
        conn.pending_ping = Some((ping_id, now));
        let remote = conn.remote;

        let mut msg = Pool::acquire_raw();
        if msg.add_bits(HeaderTag::Heartbeat.as_u8() as u64, 8).is_ok() && msg.add_u16(ping_id).is_ok() && msg.add_u32(0).is_ok() {
            self.transport.send(msg.as_bytes(), remote);
        }
        Pool::release(msg);
    }

    fn run_timeout(&mut self, now: Instant) {
        let should_timeout = self.connection.as_ref().is_some_and(|c| c.is_timed_out(now) || c.quality.should_disconnect());
        if should_timeout {
            let reason = if self.connection.as_ref().unwrap().is_timed_out(now) {
                DisconnectReason::TimedOut
            } else {
                DisconnectReason::PoorConnection
            };
            self.fail_connection(reason);
        }
    }

    fn run_retries(&mut self, now: Instant) {
        let Some(conn) = &mut self.connection else { return };
        conn.retry_pending(self.transport.as_mut(), now);
    }

    fn handle_datagram(&mut self, from: SocketAddr, bytes: Vec<u8>, now: Instant) {
        let mut msg = Pool::acquire_raw();
        if msg.load_received(&bytes).is_err() {
            Pool::release(msg);
            return;
        }
        let tag = match msg.peek_header_tag() {
            Ok(tag) => tag,
            Err(_) => {
                Pool::release(msg);
                return;
            }
        };
        let _ = msg.get_bits(8);

        match tag {
            HeaderTag::Welcome => self.handle_welcome(from, msg, now),
            HeaderTag::Reject => self.handle_reject(msg),
            HeaderTag::Heartbeat => self.handle_heartbeat(from, msg, now),
            HeaderTag::Disconnect => self.handle_disconnect_msg(from, msg),
            HeaderTag::Ack => self.handle_ack(from, msg, now, false),
            HeaderTag::AckExtra => self.handle_ack(from, msg, now, true),
            HeaderTag::Unreliable | HeaderTag::UnreliableAutoRelay => self.handle_unreliable(from, msg, now),
            HeaderTag::Reliable | HeaderTag::ReliableAutoRelay => self.handle_reliable(from, msg, now),
            HeaderTag::Notify => self.handle_notify(from, msg, now),
            HeaderTag::ClientConnected => self.handle_peer_connected(msg),
            HeaderTag::ClientDisconnected => self.handle_peer_disconnected(msg),
            HeaderTag::Connect => {
                Pool::release(msg);
            }
        }
    }

    fn handle_peer_connected(&mut self, mut msg: Message) {
        if let Ok(id) = msg.get_u16() {
            self.events.push(Event::PeerConnected { id });
        }
        Pool::release(msg);
    }

    fn handle_peer_disconnected(&mut self, mut msg: Message) {
        if let Ok(id) = msg.get_u16() {
            self.events.push(Event::PeerDisconnected { id });
        }
        Pool::release(msg);
    }

    fn handle_welcome(&mut self, from: SocketAddr, mut msg: Message, now: Instant) {
        let Some(pending) = &self.pending_connect else {
            Pool::release(msg);
            return;
        };
        if pending.remote != from {
            Pool::release(msg);
            return;
        }
        let Ok(id) = msg.get_u16() else {
            Pool::release(msg);
            return;
        };
        Pool::release(msg);

        self.pending_connect = None;
        let mut conn = Connection::new(id, from, now, self.config.timeout());
        conn.max_send_attempts = self.config.max_send_attempts;
        conn.quality.enabled = self.config.quality_disconnect_enabled;
        conn.state = ConnectionState::Connected;
        self.connection = Some(conn);

        info!(id, %from, "connected to server");
        self.events.push(Event::ClientConnected { id });
    }

    fn handle_reject(&mut self, msg: Message) {
        Pool::release(msg);
        if self.pending_connect.take().is_some() {
            self.events.push(Event::ConnectionFailed);
        }
    }

    fn handle_heartbeat(&mut self, from: SocketAddr, mut msg: Message, now: Instant) {
        let Some(conn) = &mut self.connection else {
            Pool::release(msg);
            return;
        };
        if conn.remote != from {
            Pool::release(msg);
            return;
        }
        conn.touch_heartbeat(now);
        let ping_id = msg.get_u16().unwrap_or(0);
        Pool::release(msg);

        if let Some((pending_id, sent_at)) = conn.pending_ping {
            if pending_id == ping_id {
                conn.pending_ping = None;
                conn.record_rtt_sample(now.duration_since(sent_at));
            }
        }
    }

    fn handle_disconnect_msg(&mut self, from: SocketAddr, mut msg: Message) {
        if !self.connection.as_ref().is_some_and(|c| c.remote == from) {
            Pool::release(msg);
            return;
        }
        let code = msg.get_bits(8).unwrap_or(DisconnectReason::Disconnected.wire_code() as u64) as u8;
        let has_message = msg.get_bool().unwrap_or(false);
        let message = if has_message { msg.get_string().ok() } else { None };
        Pool::release(msg);
        self.fail_connection(DisconnectReason::from_wire(code, message));
    }

    fn handle_ack(&mut self, from: SocketAddr, mut msg: Message, now: Instant, has_extra: bool) {
        let Some(conn) = &mut self.connection else {
            Pool::release(msg);
            return;
        };
        if conn.remote != from {
            Pool::release(msg);
            return;
        }
        let remote_last = msg.get_u16().unwrap_or(0);
        let remote_bitfield = msg.get_u16().unwrap_or(0);
        let extra = if has_extra { msg.get_u16().ok() } else { None };
        Pool::release(msg);

        let delivered = conn.apply_reliable_ack(SequenceId(remote_last), remote_bitfield, now);
        let id = conn.id;
        for seq in delivered {
            self.events.push(Event::ReliableDelivered { to: id, sequence_id: seq.0 });
        }
        if let Some(extra) = extra {
            let Some(conn) = &mut self.connection else { return };
            if conn.apply_ack_extra(SequenceId(extra)) {
                self.events.push(Event::ReliableDelivered { to: id, sequence_id: extra });
            }
        }
    }

    fn handle_unreliable(&mut self, from: SocketAddr, mut msg: Message, now: Instant) {
        let Some(conn) = &mut self.connection else {
            Pool::release(msg);
            return;
        };
        if conn.remote != from {
            Pool::release(msg);
            return;
        }
        conn.touch_heartbeat(now);
        let id = conn.id;
        let Ok(msg_id) = msg.get_u16() else {
            Pool::release(msg);
            return;
        };
        self.events.push(Event::Message(InboundMessage { from: id, id: msg_id, body: msg }));
    }

    fn handle_reliable(&mut self, from: SocketAddr, mut msg: Message, now: Instant) {
        let Some(conn) = &mut self.connection else {
            Pool::release(msg);
            return;
        };
        if conn.remote != from {
            Pool::release(msg);
            return;
        }
        conn.touch_heartbeat(now);
        let Ok(seq) = msg.get_u16().map(SequenceId) else {
            Pool::release(msg);
            return;
        };
        let is_new = conn.receive_reliable(seq);
        let is_latest = conn.receive_ack.last_received == seq;
        let extra = if is_latest { None } else { Some(seq) };
        let _ = conn.send_ack(extra, self.transport.as_mut());

        if !is_new {
            Pool::release(msg);
            return;
        }
        let Some(conn) = &self.connection else {
            Pool::release(msg);
            return;
        };
        let id = conn.id;
        let Ok(msg_id) = msg.get_u16() else {
            Pool::release(msg);
            return;
        };
        self.events.push(Event::Message(InboundMessage { from: id, id: msg_id, body: msg }));
    }

    fn handle_notify(&mut self, from: SocketAddr, mut msg: Message, now: Instant) {
        let Some(conn) = &mut self.connection else {
            Pool::release(msg);
            return;
        };
        if conn.remote != from {
            Pool::release(msg);
            return;
        }
        let Ok(seq) = msg.get_u16().map(SequenceId) else {
            Pool::release(msg);
            return;
        };
        let Ok(remote_last) = msg.get_u16().map(SequenceId) else {
            Pool::release(msg);
            return;
        };
        let Ok(remote_bitfield) = msg.get_u16() else {
            Pool::release(msg);
            return;
        };
        conn.touch_heartbeat(now);
        let id = conn.id;

        let (delivered, lost) = conn.notify.apply_peer_ack(remote_last, remote_bitfield);
        for _ in &delivered {
            conn.quality.record_notify_outcome(false);
        }
        for _ in &lost {
            conn.quality.record_notify_outcome(true);
        }
        let should_deliver = !matches!(conn.notify.receive(seq), crate::reliability::NotifyReceiveOutcome::Discard);

        for (_, tag) in delivered {
            self.events.push(Event::NotifyDelivered { to: id, tag });
        }
        for (_, tag) in lost {
            self.events.push(Event::NotifyLost { to: id, tag });
        }

        if !should_deliver {
            Pool::release(msg);
            return;
        }
        let Ok(msg_id) = msg.get_u16() else {
            Pool::release(msg);
            return;
        };
        self.events.push(Event::Message(InboundMessage { from: id, id: msg_id, body: msg }));
    }

    fn fail_connection(&mut self, reason: DisconnectReason) {
        let Some(conn) = self.connection.take() else { return };
        debug!(id = conn.id, ?reason, "disconnected from server");
        self.events.push(Event::ClientDisconnected { id: conn.id, reason });
    }

    /// Sends a user message, dispatching on its [`SendMode`]. Fails if there
    /// is no active connection. Notify sends carry tag `0`; callers that
    /// need to correlate a `NotifyDelivered`/`NotifyLost` event back to this
    /// particular send should use [`Client::send_notify`] instead.
    pub fn send(&mut self, msg: Message) -> Result<()> {
        let Some(conn) = &mut self.connection else {
            return Err(RiptideError::NotConnected);
        };
        match msg.send_mode() {
            SendMode::Unreliable => {
                conn.send_unreliable(&msg, self.transport.as_mut());
                Pool::release(msg);
            }
            SendMode::Reliable => {
                conn.send_reliable(msg, self.transport.as_mut(), Instant::now())?;
            }
            SendMode::Notify => {
                conn.send_notify(msg, 0, self.transport.as_mut())?;
            }
        }
        Ok(())
    }

    /// Sends a notify message tagged with an application-chosen `tag`, which
    /// comes back verbatim on the `NotifyDelivered`/`NotifyLost` event for
    /// this send. `msg` must have been created with `SendMode::Notify`.
    pub fn send_notify(&mut self, msg: Message, tag: u64) -> Result<SequenceId> {
        let Some(conn) = &mut self.connection else {
            return Err(RiptideError::NotConnected);
        };
        conn.send_notify(msg, tag, self.transport.as_mut())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        Pool::shrink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimNetwork;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn connect_then_welcome_marks_connected() {
        let net = SimNetwork::new(20, 0.0, Duration::ZERO);
        let mut client = Client::new(Box::new(net.endpoint(addr(6001))), RiptideConfig::default());
        let mut server_transport = net.endpoint(addr(6000));

        client.connect(addr(6000)).unwrap();
        client.tick();

        let events = server_transport.poll();
        assert_eq!(events.len(), 1);
        let TransportEvent::DataReceived(from, _) = &events[0] else { panic!("expected datagram") };

        let mut welcome = Pool::acquire_raw();
        welcome.add_bits(HeaderTag::Welcome.as_u8() as u64, 8).unwrap();
        welcome.add_u16(7).unwrap();
        server_transport.send(welcome.as_bytes(), *from);
        Pool::release(welcome);

        client.tick();
        assert!(client.is_connected());
        assert_eq!(client.connection_id(), Some(7));
        let events = client.poll_events();
        assert!(events.iter().any(|e| matches!(e, Event::ClientConnected { id: 7 })));
    }

    #[test]
    fn send_notify_records_the_caller_supplied_tag() {
        let net = SimNetwork::new(23, 0.0, Duration::ZERO);
        let mut client = Client::new(Box::new(net.endpoint(addr(6301))), RiptideConfig::default());
        client.connection = Some(Connection::new(1, addr(6300), Instant::now(), Duration::from_secs(5)));

        let msg = Message::create(SendMode::Notify, 9).unwrap();
        let seq = client.send_notify(msg, 4242).unwrap();
        let conn = client.connection.as_ref().unwrap();
        assert_eq!(conn.notify.outstanding.get(&seq), Some(&4242));
    }

    #[test]
    fn double_connect_is_rejected() {
        let net = SimNetwork::new(21, 0.0, Duration::ZERO);
        let mut client = Client::new(Box::new(net.endpoint(addr(6101))), RiptideConfig::default());
        client.connect(addr(6100)).unwrap();
        assert_eq!(client.connect(addr(6100)), Err(RiptideError::AlreadyConnected));
    }

    #[test]
    fn handshake_gives_up_after_max_attempts() {
        let net = SimNetwork::new(22, 0.0, Duration::ZERO);
        let config = RiptideConfig { max_connection_attempts: 2, heartbeat_interval_ms: 1, ..RiptideConfig::default() };
        let mut client = Client::new(Box::new(net.endpoint(addr(6201))), config);
        client.connect(addr(6200)).unwrap();

        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(2));
            client.tick();
        }

        let events = client.poll_events();
        assert!(events.iter().any(|e| matches!(e, Event::ConnectionFailed)));
    }
}
