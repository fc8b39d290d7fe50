//! Server-side Peer Hub: a map of connections, an ID allocator, an
//! accept/reject policy, and an optional auto-relay filter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::RiptideConfig;
use crate::connection::{Connection, ConnectionState, DisconnectReason};
use crate::error::{Result, RiptideError};
use crate::event::{Event, EventQueue, InboundMessage};
use crate::header::HeaderTag;
use crate::message::{Message, SendMode};
use crate::pool::Pool;
use crate::sequence::SequenceId;
use crate::transport::{Transport, TransportEvent};

/// Decides whether a new connection attempt from `addr` should be accepted.
/// The default always accepts (subject to `MaxClientCount`, checked
/// separately).
pub type AcceptPolicy = Box<dyn FnMut(SocketAddr) -> bool + Send>;

/// Server-side half of the Peer Hub (§4.5). Owns no socket directly — it
/// drives whatever [`Transport`] it was constructed with.
pub struct Server {
    transport: Box<dyn Transport>,
    config: RiptideConfig,

    connections: HashMap<u16, Connection>,
    by_addr: HashMap<SocketAddr, u16>,
    free_ids: VecDeque<u16>,

    relay_filter: HashSet<u16>,
    accept_policy: AcceptPolicy,

    events: EventQueue,
}

impl Server {
    pub fn new(transport: Box<dyn Transport>, config: RiptideConfig) -> Self {
        Pool::grow();
        let free_ids = (1..=config.max_client_count as u32).map(|n| n as u16).collect();
        Self {
            transport,
            config,
            connections: HashMap::new(),
            by_addr: HashMap::new(),
            free_ids,
            relay_filter: HashSet::new(),
            accept_policy: Box::new(|_addr| true),
            events: EventQueue::default(),
        }
    }

    pub fn set_accept_policy(&mut self, policy: AcceptPolicy) {
        self.accept_policy = policy;
    }

    /// Message ids for which inbound `*AutoRelay` traffic is forwarded to
    /// every other connected client instead of being delivered locally.
    pub fn set_relay_filter(&mut self, ids: impl IntoIterator<Item = u16>) {
        self.relay_filter = ids.into_iter().collect();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, id: u16) -> bool {
        matches!(self.connections.get(&id), Some(c) if c.state == ConnectionState::Connected)
    }

    /// One scheduler pass: poll the transport, run heartbeat/timeout checks,
    /// run retry timers. Never blocks.
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.poll_transport(now);
        self.run_timeouts(now);
        self.run_retries(now);
    }

    /// Drains events queued since the last call.
    pub fn poll_events(&mut self) -> Vec<Event> {
        self.events.drain()
    }

    fn poll_transport(&mut self, now: Instant) {
        for event in self.transport.poll() {
            match event {
                TransportEvent::DataReceived(from, bytes) => self.handle_datagram(from, bytes, now),
                TransportEvent::TransportFailed => self.fail_all(DisconnectReason::TransportError),
                TransportEvent::Disconnected(addr, reason) => self.disconnect_addr(addr, reason),
                TransportEvent::Connecting(_) | TransportEvent::Connected(_) => {}
            }
        }
    }

    fn run_timeouts(&mut self, now: Instant) {
        let timed_out: Vec<u16> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_timed_out(now) || c.quality.should_disconnect())
            .map(|(id, _)| *id)
            .collect();
        for id in timed_out {
            let reason = if self.connections[&id].is_timed_out(now) {
                DisconnectReason::TimedOut
            } else {
                DisconnectReason::PoorConnection
            };
            self.disconnect_id(id, reason);
        }
    }

    fn run_retries(&mut self, now: Instant) {
        for conn in self.connections.values_mut() {
            conn.retry_pending(self.transport.as_mut(), now);
        }
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
        let _ = msg.get_bits(8); // consume the tag byte

        match tag {
            HeaderTag::Connect => self.handle_connect(from, now),
            HeaderTag::Heartbeat => self.handle_heartbeat(from, msg, now),
            HeaderTag::Disconnect => self.handle_disconnect_msg(from, msg),
            HeaderTag::Ack => self.handle_ack(from, msg, now, false),
            HeaderTag::AckExtra => self.handle_ack(from, msg, now, true),
            HeaderTag::Unreliable | HeaderTag::UnreliableAutoRelay => self.handle_unreliable(from, tag, msg, now),
            HeaderTag::Reliable | HeaderTag::ReliableAutoRelay => self.handle_reliable(from, tag, msg, now),
            HeaderTag::Notify => self.handle_notify(from, msg, now),
            HeaderTag::Welcome | HeaderTag::ClientConnected | HeaderTag::ClientDisconnected | HeaderTag::Reject => {
                Pool::release(msg);
            }
        }
    }

    fn handle_connect(&mut self, from: SocketAddr, now: Instant) {
        if let Some(&id) = self.by_addr.get(&from) {
            let already_connected = match self.connections.get_mut(&id) {
                Some(conn) => {
                    conn.touch_heartbeat(now);
                    conn.state == ConnectionState::Connected
                }
                None => false,
            };
            if already_connected {
                self.send_welcome(id);
            }
            return;
        }

        if self.connections.len() >= self.config.max_client_count as usize || !(self.accept_policy)(from) {
            self.send_reject(from, None);
            return;
        }
        let Some(id) = self.free_ids.pop_front() else {
            self.send_reject(from, Some("server full".to_string()));
            return;
        };

        let mut conn = Connection::new(id, from, now, self.config.timeout());
        conn.max_send_attempts = self.config.max_send_attempts;
        conn.quality.enabled = self.config.quality_disconnect_enabled;
        conn.state = ConnectionState::Connected;
        self.connections.insert(id, conn);
        self.by_addr.insert(from, id);

        info!(id, %from, "client connected");
        self.send_welcome(id);
        self.events.push(Event::ClientConnected { id });
        self.broadcast_client_connected(id);
    }

    fn send_welcome(&mut self, id: u16) {
        let Some(remote) = self.connections.get(&id).map(|c| c.remote) else { return };
        let mut msg = Pool::acquire_raw();
        if msg.add_bits(HeaderTag::Welcome.as_u8() as u64, 8).is_ok() && msg.add_u16(id).is_ok() {
            self.transport.send(msg.as_bytes(), remote);
        }
        Pool::release(msg);
    }

    fn send_reject(&mut self, to: SocketAddr, reason: Option<String>) {
        let mut msg = Pool::acquire_raw();
        if msg.add_bits(HeaderTag::Reject.as_u8() as u64, 8).is_ok() {
            let has_reason = reason.is_some();
            let _ = msg.add_bool(has_reason);
            if let Some(reason) = reason {
                let _ = msg.add_string(&reason);
            }
            self.transport.send(msg.as_bytes(), to);
        }
        Pool::release(msg);
    }

    fn broadcast_client_connected(&mut self, id: u16) {
        let mut msg = Pool::acquire_raw();
        if msg.add_bits(HeaderTag::ClientConnected.as_u8() as u64, 8).is_err() || msg.add_u16(id).is_err() {
            Pool::release(msg);
            return;
        }
        let bytes = msg.as_bytes().to_vec();
        Pool::release(msg);
        for (&other_id, conn) in self.connections.iter() {
            if other_id != id && conn.state == ConnectionState::Connected {
                self.transport.send(&bytes, conn.remote);
            }
        }
    }

    fn broadcast_client_disconnected(&mut self, id: u16) {
        let mut msg = Pool::acquire_raw();
        if msg.add_bits(HeaderTag::ClientDisconnected.as_u8() as u64, 8).is_err() || msg.add_u16(id).is_err() {
            Pool::release(msg);
            return;
        }
        let bytes = msg.as_bytes().to_vec();
        Pool::release(msg);
        for conn in self.connections.values() {
            self.transport.send(&bytes, conn.remote);
        }
    }

    fn handle_heartbeat(&mut self, from: SocketAddr, mut msg: Message, now: Instant) {
        let Some(&id) = self.by_addr.get(&from) else {
            self.events.push(Event::UnknownSender { addr: from });
            Pool::release(msg);
            return;
        };
        let ping_id = msg.get_u16().unwrap_or(0);
        let _client_reported_rtt_ms = msg.get_u32().unwrap_or(0);
        Pool::release(msg);

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.touch_heartbeat(now);
        }

        let mut reply = Pool::acquire_raw();
        if reply.add_bits(HeaderTag::Heartbeat.as_u8() as u64, 8).is_ok()
            && reply.add_u16(ping_id).is_ok()
            && reply.add_u32(0).is_ok()
        {
            if let Some(conn) = self.connections.get(&id) {
                self.transport.send(reply.as_bytes(), conn.remote);
            }
        }
        Pool::release(reply);
    }

    fn handle_disconnect_msg(&mut self, from: SocketAddr, mut msg: Message) {
        let Some(&id) = self.by_addr.get(&from) else {
            Pool::release(msg);
            return;
        };
        Pool::release(msg);
        self.disconnect_id(id, DisconnectReason::Disconnected);
    }

    fn handle_ack(&mut self, from: SocketAddr, mut msg: Message, now: Instant, has_extra: bool) {
        let Some(&id) = self.by_addr.get(&from) else {
            Pool::release(msg);
            return;
        };
        let remote_last = msg.get_u16().unwrap_or(0);
        let remote_bitfield = msg.get_u16().unwrap_or(0);
        let extra = if has_extra { msg.get_u16().ok() } else { None };
        Pool::release(msg);

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.touch_heartbeat(now);
            let delivered = conn.apply_reliable_ack(SequenceId(remote_last), remote_bitfield, now);
            for seq in delivered {
                self.events.push(Event::ReliableDelivered { to: id, sequence_id: seq.0 });
            }
            if let Some(extra) = extra {
                if conn.apply_ack_extra(SequenceId(extra)) {
                    self.events.push(Event::ReliableDelivered { to: id, sequence_id: extra });
                }
            }
        }
    }

    fn handle_unreliable(&mut self, from: SocketAddr, tag: HeaderTag, mut msg: Message, now: Instant) {
        let Some(&id) = self.by_addr.get(&from) else {
            self.events.push(Event::UnknownSender { addr: from });
            Pool::release(msg);
            return;
        };
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.touch_heartbeat(now);
        }
        let Ok(msg_id) = msg.get_u16() else {
            Pool::release(msg);
            return;
        };

        if tag == HeaderTag::UnreliableAutoRelay && self.relay_filter.contains(&msg_id) {
            self.relay_unreliable(id, msg_id, &mut msg);
            Pool::release(msg);
            return;
        }

        self.events.push(Event::Message(InboundMessage { from: id, id: msg_id, body: msg }));
    }

    fn relay_unreliable(&mut self, from_id: u16, msg_id: u16, msg: &mut Message) {
        let mut out = Pool::acquire_raw();
        if out.add_bits(HeaderTag::Unreliable.as_u8() as u64, 8).is_err() || out.add_u16(msg_id).is_err() {
            Pool::release(out);
            return;
        }
        if out.add_message(msg, false).is_err() {
            Pool::release(out);
            return;
        }
        let bytes = out.as_bytes().to_vec();
        Pool::release(out);
        for (&other_id, conn) in self.connections.iter() {
            if other_id != from_id {
                self.transport.send(&bytes, conn.remote);
            }
        }
    }

    fn handle_reliable(&mut self, from: SocketAddr, tag: HeaderTag, mut msg: Message, now: Instant) {
        let Some(&id) = self.by_addr.get(&from) else {
            self.events.push(Event::UnknownSender { addr: from });
            Pool::release(msg);
            return;
        };
        let Ok(seq) = msg.get_u16().map(SequenceId) else {
            Pool::release(msg);
            return;
        };

        let Some(conn) = self.connections.get_mut(&id) else {
            Pool::release(msg);
            return;
        };
        conn.touch_heartbeat(now);
        let is_new = conn.receive_reliable(seq);
        let is_latest = conn.receive_ack.last_received == seq;
        let extra = if is_latest { None } else { Some(seq) };
        let _ = conn.send_ack(extra, self.transport.as_mut());

        if !is_new {
            Pool::release(msg);
            return;
        }

        let Ok(msg_id) = msg.get_u16() else {
            Pool::release(msg);
            return;
        };

        if tag == HeaderTag::ReliableAutoRelay && self.relay_filter.contains(&msg_id) {
            self.relay_reliable(id, msg_id, &mut msg, now);
            Pool::release(msg);
            return;
        }

        self.events.push(Event::Message(InboundMessage { from: id, id: msg_id, body: msg }));
    }

    fn relay_reliable(&mut self, from_id: u16, msg_id: u16, msg: &mut Message, now: Instant) {
        let other_ids: Vec<u16> = self.connections.keys().copied().filter(|&oid| oid != from_id).collect();
        for oid in other_ids {
            let Ok(mut out) = Message::create(SendMode::Reliable, msg_id) else { continue };
            if out.add_message(msg, false).is_err() {
                Pool::release(out);
                continue;
            }
            if let Some(conn) = self.connections.get_mut(&oid) {
                let _ = conn.send_reliable(out, self.transport.as_mut(), now);
            } else {
                Pool::release(out);
            }
        }
    }

    fn handle_notify(&mut self, from: SocketAddr, mut msg: Message, now: Instant) {
        let Some(&id) = self.by_addr.get(&from) else {
            self.events.push(Event::UnknownSender { addr: from });
            Pool::release(msg);
            return;
        };
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

        let Some(conn) = self.connections.get_mut(&id) else {
            Pool::release(msg);
            return;
        };
        conn.touch_heartbeat(now);

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

    fn disconnect_addr(&mut self, addr: SocketAddr, reason: DisconnectReason) {
        if let Some(&id) = self.by_addr.get(&addr) {
            self.disconnect_id(id, reason);
        }
    }

    /// Removes connection `id`, returns its slot to the free list, and
    /// notifies both the host and the remaining clients.
    pub fn disconnect_id(&mut self, id: u16, reason: DisconnectReason) {
        let Some(conn) = self.connections.remove(&id) else { return };
        self.by_addr.remove(&conn.remote);
        self.free_ids.push_back(id);

        let mut msg = Pool::acquire_raw();
        let encoded = msg.add_bits(HeaderTag::Disconnect.as_u8() as u64, 8).is_ok()
            && msg.add_bits(reason.wire_code() as u64, 8).is_ok()
            && msg.add_bool(reason.wire_message().is_some()).is_ok()
            && reason.wire_message().map_or(true, |m| msg.add_string(m).is_ok());
        if encoded {
            self.transport.send(msg.as_bytes(), conn.remote);
        }
        Pool::release(msg);

        debug!(id, ?reason, "client disconnected");
        self.events.push(Event::ClientDisconnected { id, reason });
        self.broadcast_client_disconnected(id);
    }

    /// Host-initiated kick, per §8's "Kick" scenario.
    pub fn disconnect_client(&mut self, id: u16, message: impl Into<String>) {
        self.disconnect_id(id, DisconnectReason::Kicked(Some(message.into())));
    }

    fn fail_all(&mut self, reason: DisconnectReason) {
        let ids: Vec<u16> = self.connections.keys().copied().collect();
        for id in ids {
            self.disconnect_id(id, reason.clone());
        }
    }

    /// Sends a user message to `id`, dispatching on its [`SendMode`]. Notify
    /// sends carry tag `0`; use [`Server::send_notify`] to correlate a
    /// `NotifyDelivered`/`NotifyLost` event back to this particular send.
    pub fn send_to(&mut self, id: u16, msg: Message) -> Result<()> {
        let Some(conn) = self.connections.get_mut(&id) else {
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

    /// Sends a notify message to `id` tagged with an application-chosen
    /// `tag`, which comes back verbatim on the delivery/loss event for this
    /// send. `msg` must have been created with `SendMode::Notify`.
    pub fn send_notify(&mut self, id: u16, msg: Message, tag: u64) -> Result<SequenceId> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Err(RiptideError::NotConnected);
        };
        conn.send_notify(msg, tag, self.transport.as_mut())
    }

    pub fn send_to_all(&mut self, build: impl Fn(u16) -> Result<Message>, except: Option<u16>) {
        let ids: Vec<u16> = self.connections.keys().copied().filter(|&id| Some(id) != except).collect();
        for id in ids {
            match build(id) {
                Ok(msg) => {
                    if let Err(e) = self.send_to(id, msg) {
                        warn!(id, error = %e, "send_to_all failed for one recipient");
                    }
                }
                Err(e) => warn!(id, error = %e, "send_to_all message construction failed"),
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        Pool::shrink();
    }
}
