//! Per-connection lifecycle: handshake, heartbeating, timeout, and
//! quality-based disconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::header::HeaderTag;
use crate::message::Message;
use crate::pool::Pool;
use crate::reliability::{retry_interval, NotifyState, PendingOutbound, ReceiveAckState, SendAckState};
use crate::sequence::SequenceId;
use crate::transport::Transport;

/// Connection lifecycle state (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    /// Server-side only: awaiting the accept/reject policy's decision.
    Pending,
    Connected,
    Disconnecting,
}

/// Terminal-transition reason, attached to every disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    TimedOut,
    Kicked(Option<String>),
    ServerStopped,
    /// Peer-initiated, clean disconnect.
    Disconnected,
    NeverConnected,
    TransportError,
    ConnectionRejected,
    PoorConnection,
}

impl DisconnectReason {
    /// Wire code carried in an outbound `Disconnect` message (§6: tag 6 =
    /// "close with reason + optional payload").
    pub fn wire_code(&self) -> u8 {
        match self {
            DisconnectReason::TimedOut => 0,
            DisconnectReason::Kicked(_) => 1,
            DisconnectReason::ServerStopped => 2,
            DisconnectReason::Disconnected => 3,
            DisconnectReason::NeverConnected => 4,
            DisconnectReason::TransportError => 5,
            DisconnectReason::ConnectionRejected => 6,
            DisconnectReason::PoorConnection => 7,
        }
    }

    /// Optional payload string carried alongside the wire code. Only
    /// `Kicked` ever has one today.
    pub fn wire_message(&self) -> Option<&str> {
        match self {
            DisconnectReason::Kicked(message) => message.as_deref(),
            _ => None,
        }
    }

    /// Reconstructs a reason from a wire code and its optional payload.
    /// Unknown codes fall back to `Disconnected` rather than panicking, in
    /// case a future sender adds a reason this build predates.
    pub fn from_wire(code: u8, message: Option<String>) -> DisconnectReason {
        match code {
            0 => DisconnectReason::TimedOut,
            1 => DisconnectReason::Kicked(message),
            2 => DisconnectReason::ServerStopped,
            3 => DisconnectReason::Disconnected,
            4 => DisconnectReason::NeverConnected,
            5 => DisconnectReason::TransportError,
            6 => DisconnectReason::ConnectionRejected,
            7 => DisconnectReason::PoorConnection,
            _ => DisconnectReason::Disconnected,
        }
    }
}

/// Rolling quality metrics used for the opt-out quality-based disconnect.
pub struct QualityTracker {
    avg_send_attempts: f64,
    notify_loss_rate: f64,
    over_threshold_samples: u32,
    pub max_avg_send_attempts: f64,
    pub max_notify_loss_rate: f64,
    pub resilience_window: u32,
    pub enabled: bool,
}

impl Default for QualityTracker {
    fn default() -> Self {
        Self {
            avg_send_attempts: 1.0,
            notify_loss_rate: 0.0,
            over_threshold_samples: 0,
            max_avg_send_attempts: 8.0,
            max_notify_loss_rate: 0.5,
            resilience_window: 5,
            enabled: true,
        }
    }
}

const EMA_ALPHA: f64 = 0.3;

impl QualityTracker {
    pub fn record_send_attempts(&mut self, attempts: u32) {
        self.avg_send_attempts = self.avg_send_attempts * (1.0 - EMA_ALPHA) + attempts as f64 * EMA_ALPHA;
        self.sample();
    }

    pub fn record_notify_outcome(&mut self, lost: bool) {
        let sample = if lost { 1.0 } else { 0.0 };
        self.notify_loss_rate = self.notify_loss_rate * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA;
        self.sample();
    }

    fn sample(&mut self) {
        if self.avg_send_attempts > self.max_avg_send_attempts || self.notify_loss_rate > self.max_notify_loss_rate {
            self.over_threshold_samples += 1;
        } else {
            self.over_threshold_samples = 0;
        }
    }

    /// Whether the connection should be torn down for poor quality.
    pub fn should_disconnect(&self) -> bool {
        self.enabled && self.over_threshold_samples > self.resilience_window
    }
}

/// Per-connection state: lifecycle, RTT, reliability engine state, and
/// pending outbound reliable/notify messages.
pub struct Connection {
    pub id: u16,
    pub remote: SocketAddr,
    pub state: ConnectionState,

    pub smoothed_rtt: Option<Duration>,
    last_raw_rtt: Option<Duration>,

    next_sequence_id: SequenceId,
    pub receive_ack: ReceiveAckState,
    pub send_ack: SendAckState,
    pub notify: NotifyState,
    pub pending: HashMap<SequenceId, PendingOutbound>,

    pub last_heartbeat: Instant,
    pub timeout: Duration,
    pub can_timeout: bool,

    pub quality: QualityTracker,

    /// Rolling ping id for the heartbeat exchange and the time it was sent.
    next_ping_id: u16,
    pub pending_ping: Option<(u16, Instant)>,

    pub max_send_attempts: u32,
}

impl Connection {
    pub fn new(id: u16, remote: SocketAddr, now: Instant, timeout: Duration) -> Self {
        Self {
            id,
            remote,
            state: ConnectionState::Connecting,
            smoothed_rtt: None,
            last_raw_rtt: None,
            next_sequence_id: SequenceId::ZERO,
            receive_ack: ReceiveAckState::default(),
            send_ack: SendAckState::default(),
            notify: NotifyState::default(),
            pending: HashMap::new(),
            last_heartbeat: now,
            timeout,
            can_timeout: true,
            quality: QualityTracker::default(),
            next_ping_id: 0,
            pending_ping: None,
            max_send_attempts: crate::reliability::DEFAULT_MAX_SEND_ATTEMPTS,
        }
    }

    pub fn next_outbound_sequence_id(&mut self) -> SequenceId {
        let id = self.next_sequence_id;
        self.next_sequence_id = self.next_sequence_id.next();
        id
    }

    pub fn next_outbound_ping_id(&mut self) -> u16 {
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        id
    }

    /// Records an RTT sample (clamped to >= 1ms) and updates the smoothed
    /// RTT via `smoothed = smoothed * 0.7 + sample * 0.3`.
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        let sample = sample.max(Duration::from_millis(1));
        self.last_raw_rtt = Some(sample);
        self.smoothed_rtt = Some(match self.smoothed_rtt {
            None => sample,
            Some(prev) => {
                let prev_ms = prev.as_secs_f64() * 1000.0;
                let sample_ms = sample.as_secs_f64() * 1000.0;
                Duration::from_secs_f64((prev_ms * 0.7 + sample_ms * 0.3) / 1000.0)
            }
        });
    }

    pub fn raw_rtt(&self) -> Option<Duration> {
        self.last_raw_rtt
    }

    pub fn retry_interval(&self) -> Duration {
        retry_interval(self.smoothed_rtt)
    }

    pub fn touch_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = now;
    }

    /// Whether this connection has gone silent past its timeout. Always
    /// `false` when `can_timeout` is disabled.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.can_timeout && now.duration_since(self.last_heartbeat) >= self.timeout
    }

    /// Unreliable send: header byte already written by `Pool::acquire`, no
    /// further framing.
    pub fn send_unreliable(&self, msg: &Message, transport: &mut dyn Transport) {
        transport.send(msg.as_bytes(), self.remote);
    }

    /// Reliable send: stamps the reserved sequence-id field, transmits, and
    /// registers a `PendingOutbound` with a retry deadline. `msg` is
    /// released back to the pool once its bytes are copied out.
    pub fn send_reliable(&mut self, mut msg: Message, transport: &mut dyn Transport, now: Instant) -> Result<SequenceId> {
        let seq = self.next_outbound_sequence_id();
        msg.set_bits_at(8, seq.0 as u64, 16)?;
        let bytes = msg.as_bytes().to_vec();
        transport.send(&bytes, self.remote);
        Pool::release(msg);
        let retry_after = self.retry_interval();
        self.pending.insert(seq, PendingOutbound::new(seq, bytes, self.remote, now, retry_after));
        Ok(seq)
    }

    /// Notify send: stamps sequence id, last-received id, and the
    /// piggybacked ack bitfield, then records `tag` against the sequence id
    /// for later `NotifyDelivered`/`NotifyLost` feedback. No retry is ever
    /// scheduled.
    pub fn send_notify(&mut self, mut msg: Message, tag: u64, transport: &mut dyn Transport) -> Result<SequenceId> {
        let seq = self.notify.next_outbound_sequence_id();
        msg.set_bits_at(8, seq.0 as u64, 16)?;
        msg.set_bits_at(24, self.notify.last_received.0 as u64, 16)?;
        msg.set_bits_at(40, self.notify.received_bitfield as u64, 16)?;
        transport.send(msg.as_bytes(), self.remote);
        Pool::release(msg);
        self.notify.outstanding.insert(seq, tag);
        Ok(seq)
    }

    /// Receiver-side reliable processing: returns `true` if `seq` is new
    /// (deliver to the application), `false` if it was a duplicate.
    pub fn receive_reliable(&mut self, seq: SequenceId) -> bool {
        !self.receive_ack.receive(seq)
    }

    /// Builds the `Ack` (or, with `extra`, `AckExtra`) reply for the current
    /// `ReceiveAckState` and sends it immediately.
    pub fn send_ack(&self, extra: Option<SequenceId>, transport: &mut dyn Transport) -> Result<()> {
        let mut msg = Pool::acquire_raw();
        let tag = if extra.is_some() { HeaderTag::AckExtra } else { HeaderTag::Ack };
        msg.add_bits(tag.as_u8() as u64, 8)?;
        msg.add_u16(self.receive_ack.last_received.0)?;
        msg.add_u16(self.receive_ack.received_bitfield)?;
        if let Some(extra) = extra {
            msg.add_u16(extra.0)?;
        }
        transport.send(msg.as_bytes(), self.remote);
        Pool::release(msg);
        Ok(())
    }

    /// Applies an inbound `Ack`/`AckExtra` (`remote_last`, `remote_bitfield`)
    /// against outstanding reliable sends. Returns the ids newly confirmed
    /// delivered. Ids that fell off the ack window without being confirmed
    /// have their retry deadline pulled forward so the next `retry_pending`
    /// resends them sooner.
    pub fn apply_reliable_ack(&mut self, remote_last: SequenceId, remote_bitfield: u16, now: Instant) -> Vec<SequenceId> {
        let delta = self.send_ack.apply_ack(remote_last, remote_bitfield);
        let mut delivered = Vec::new();
        for id in delta.newly_delivered {
            if let Some(pending) = self.pending.remove(&id) {
                self.quality.record_send_attempts(pending.attempts);
                delivered.push(id);
            }
        }
        for id in delta.fell_off {
            if let Some(pending) = self.pending.get_mut(&id) {
                pending.retry_deadline = now;
            }
        }
        delivered
    }

    /// Resolves an `AckExtra`'s trailing field directly against the pending
    /// map (the reliable engine's sliding window only tracks predecessors of
    /// the *latest* acked id; the extra field covers an older id the sender
    /// still needs confirmed).
    pub fn apply_ack_extra(&mut self, extra_seq: SequenceId) -> bool {
        if let Some(pending) = self.pending.remove(&extra_seq) {
            self.quality.record_send_attempts(pending.attempts);
            true
        } else {
            false
        }
    }

    /// Resends reliable entries whose retry deadline has elapsed and whose
    /// last send was at least `smoothed_rtt / 2` ago; drops (and charges
    /// quality for) entries that have exhausted `max_send_attempts`.
    /// Returns the sequence ids dropped for exhaustion.
    pub fn retry_pending(&mut self, transport: &mut dyn Transport, now: Instant) -> Vec<SequenceId> {
        let min_resend_gap = self.smoothed_rtt.unwrap_or(Duration::from_millis(50)) / 2;
        let retry_after = self.retry_interval();

        let mut exhausted = Vec::new();
        for (seq, pending) in self.pending.iter_mut() {
            if pending.attempts >= self.max_send_attempts {
                exhausted.push(*seq);
                continue;
            }
            if now >= pending.retry_deadline && now.duration_since(pending.last_sent_at) >= min_resend_gap {
                transport.send(&pending.bytes, pending.destination);
                pending.attempts += 1;
                pending.last_sent_at = now;
                pending.retry_deadline = now + retry_after;
            }
        }

        for seq in &exhausted {
            if let Some(pending) = self.pending.remove(seq) {
                self.quality.record_send_attempts(pending.attempts);
            }
        }
        exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999)
    }

    #[test]
    fn rtt_smoothing_initializes_on_first_sample() {
        let mut c = Connection::new(1, addr(), Instant::now(), Duration::from_secs(5));
        c.record_rtt_sample(Duration::from_millis(40));
        assert_eq!(c.smoothed_rtt, Some(Duration::from_millis(40)));
    }

    #[test]
    fn rtt_smoothing_applies_ema() {
        let mut c = Connection::new(1, addr(), Instant::now(), Duration::from_secs(5));
        c.record_rtt_sample(Duration::from_millis(100));
        c.record_rtt_sample(Duration::from_millis(200));
        // 100*0.7 + 200*0.3 = 130
        assert_eq!(c.smoothed_rtt, Some(Duration::from_millis(130)));
    }

    #[test]
    fn rtt_sample_clamped_to_1ms() {
        let mut c = Connection::new(1, addr(), Instant::now(), Duration::from_secs(5));
        c.record_rtt_sample(Duration::from_micros(0));
        assert_eq!(c.smoothed_rtt, Some(Duration::from_millis(1)));
    }

    #[test]
    fn timeout_disabled_never_fires() {
        let now = Instant::now();
        let mut c = Connection::new(1, addr(), now, Duration::from_millis(1));
        c.can_timeout = false;
        let later = now + Duration::from_secs(10);
        assert!(!c.is_timed_out(later));
    }

    #[test]
    fn quality_disconnect_after_resilience_window() {
        let mut q = QualityTracker {
            resilience_window: 2,
            ..QualityTracker::default()
        };
        for _ in 0..10 {
            q.record_send_attempts(15);
        }
        assert!(q.should_disconnect());
    }

    #[test]
    fn quality_disconnect_can_be_opted_out() {
        let mut q = QualityTracker {
            enabled: false,
            resilience_window: 0,
            ..QualityTracker::default()
        };
        for _ in 0..10 {
            q.record_send_attempts(15);
        }
        assert!(!q.should_disconnect());
    }

    #[test]
    fn reliable_send_then_ack_clears_pending() {
        use crate::message::{Message, SendMode};
        use crate::transport::sim::SimNetwork;
        use std::time::Duration;

        let net = SimNetwork::new(7, 0.0, Duration::ZERO);
        let mut transport = net.endpoint(addr());
        let now = Instant::now();
        let mut conn = Connection::new(1, addr(), now, Duration::from_secs(5));

        let msg = Message::create(SendMode::Reliable, 42).unwrap();
        let seq = conn.send_reliable(msg, &mut transport, now).unwrap();
        assert_eq!(conn.pending.len(), 1);

        let delivered = conn.apply_reliable_ack(seq, 0, now);
        assert_eq!(delivered, vec![seq]);
        assert!(conn.pending.is_empty());
    }

    #[test]
    fn exhausted_reliable_send_is_dropped_and_charges_quality() {
        use crate::message::{Message, SendMode};
        use crate::transport::sim::SimNetwork;
        use std::time::Duration;

        let net = SimNetwork::new(8, 0.0, Duration::ZERO);
        let mut transport = net.endpoint(addr());
        let now = Instant::now();
        let mut conn = Connection::new(1, addr(), now, Duration::from_secs(5));
        conn.max_send_attempts = 1;

        let msg = Message::create(SendMode::Reliable, 1).unwrap();
        conn.send_reliable(msg, &mut transport, now).unwrap();

        let later = now + Duration::from_secs(10);
        let dropped = conn.retry_pending(&mut transport, later);
        assert_eq!(dropped.len(), 1);
        assert!(conn.pending.is_empty());
    }
}
