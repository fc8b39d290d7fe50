//! Reliability engine: per-connection sequence counters, pending outbound
//! messages with retry timers, and ack bitfields for the reliable and
//! notify send modes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::sequence::SequenceId;

/// `RetryMultiplier` from the defaults table.
pub const RETRY_MULTIPLIER: f64 = 1.2;
/// Used when `smoothed_rtt` is not yet known.
pub const DEFAULT_RETRY_MS: u64 = 50;
pub const MIN_RETRY_MS: u64 = 10;
/// `MaxSendAttempts` default.
pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 15;

/// A reliable or notify message still awaiting delivery confirmation.
pub struct PendingOutbound {
    pub sequence_id: SequenceId,
    pub bytes: Vec<u8>,
    pub destination: SocketAddr,
    pub attempts: u32,
    pub last_sent_at: Instant,
    pub retry_deadline: Instant,
    /// Opaque tag handed back on `NotifyDelivered`/`NotifyLost`; unused for
    /// reliable sends.
    pub notify_tag: u64,
}

impl PendingOutbound {
    pub fn new(sequence_id: SequenceId, bytes: Vec<u8>, destination: SocketAddr, now: Instant, retry_after: Duration) -> Self {
        Self {
            sequence_id,
            bytes,
            destination,
            attempts: 1,
            last_sent_at: now,
            retry_deadline: now + retry_after,
            notify_tag: 0,
        }
    }
}

/// `max(10, smoothed_rtt_ms * RetryMultiplier)`, or the 50ms default when no
/// RTT sample exists yet.
pub fn retry_interval(smoothed_rtt: Option<Duration>) -> Duration {
    match smoothed_rtt {
        None => Duration::from_millis(DEFAULT_RETRY_MS),
        Some(rtt) => {
            let ms = (rtt.as_secs_f64() * 1000.0 * RETRY_MULTIPLIER).round() as u64;
            Duration::from_millis(ms.max(MIN_RETRY_MS))
        }
    }
}

/// Receiver-side state for reliable messages: the duplicate filter and the
/// ack bitfield summarizing which of the last `WINDOW` sequence ids have
/// been received.
pub struct ReceiveAckState {
    pub last_received: SequenceId,
    /// Bit `i` set means `last_received - i` has been received.
    pub received_bitfield: u16,
    has_received_any: bool,
    /// Bit `i` set means `last_received - i` has already been handled
    /// (passed to the application) — the duplicate filter. Widened beyond
    /// the 16 bits of `received_bitfield`; never narrowed below 16 per the
    /// protocol's documented open question.
    duplicate_filter: u64,
}

pub const DUPLICATE_FILTER_BITS: u32 = 64;

impl Default for ReceiveAckState {
    fn default() -> Self {
        Self {
            last_received: SequenceId::ZERO,
            received_bitfield: 0,
            has_received_any: false,
            duplicate_filter: 0,
        }
    }
}

impl ReceiveAckState {
    /// Returns `true` if `seq` is a duplicate that should be dropped
    /// silently. Otherwise marks it handled and updates the ack bitfield.
    pub fn receive(&mut self, seq: SequenceId) -> bool {
        if !self.has_received_any {
            self.has_received_any = true;
            self.last_received = seq;
            self.received_bitfield = 0;
            self.duplicate_filter = 0;
            return false;
        }

        let gap = seq.signed_diff(self.last_received);
        if gap > 0 {
            // `seq` is newer: shift state forward by `gap`, mark the
            // previous `last_received` as bit `gap` (now a predecessor).
            if gap as u32 >= DUPLICATE_FILTER_BITS {
                self.duplicate_filter = 0;
            } else {
                self.duplicate_filter <<= gap;
            }
            if (gap as u32) < DUPLICATE_FILTER_BITS {
                self.duplicate_filter |= 1 << (gap - 1);
            }
            if gap <= 16 {
                self.received_bitfield = (self.received_bitfield << gap) | (1 << (gap - 1));
            } else {
                self.received_bitfield = 0;
            }
            self.last_received = seq;
            false
        } else if gap == 0 {
            // Re-delivery of the newest id.
            true
        } else {
            // Older than last_received: check duplicate filter / bitfield.
            let back = (-gap) as u32;
            if back == 0 || back > DUPLICATE_FILTER_BITS {
                // Outside the filter window: documented open question —
                // treat as not-a-duplicate so it's still delivered.
                return false;
            }
            let bit = 1u64 << (back - 1);
            let was_duplicate = self.duplicate_filter & bit != 0;
            self.duplicate_filter |= bit;
            if back <= 16 {
                self.received_bitfield |= 1 << (back - 1);
            }
            was_duplicate
        }
    }
}

/// Sender-side state for reliable messages: tracks which outbound sequence
/// ids the peer has acknowledged, to detect loss of older messages.
#[derive(Default)]
pub struct SendAckState {
    pub last_acked: SequenceId,
    pub acked_bitfield: u16,
    has_ack: bool,
}

impl SendAckState {
    /// Applies an incoming ack (`remote_last`, `remote_bitfield`). Returns
    /// the sequence ids newly confirmed delivered (clear their pending
    /// entries) and the ids that "fell off" the left edge of the bitfield
    /// while still unconfirmed — a cue to resend them sooner; the actual
    /// resend stays timer-driven.
    pub fn apply_ack(&mut self, remote_last: SequenceId, remote_bitfield: u16) -> AckDelta {
        let mut newly_delivered = ack_bits_to_ids(remote_last, remote_bitfield);
        newly_delivered.push(remote_last);

        if !self.has_ack {
            self.has_ack = true;
            self.last_acked = remote_last;
            self.acked_bitfield = remote_bitfield;
            return AckDelta { newly_delivered, fell_off: Vec::new() };
        }

        let gap = remote_last.signed_diff(self.last_acked);
        let mut fell_off = Vec::new();

        if gap > 0 {
            let gap = gap as u32;
            // Bit `i` of the old bitfield represents `last_acked - (i+1)`.
            // Relative to the new reference point `remote_last`, that same
            // id sits at bit `i + gap`; anything landing at bit >= 16 has
            // left the window.
            for i in 0u32..16 {
                if self.acked_bitfield & (1 << i) == 0 && i + gap >= 16 {
                    let id = self.last_acked.wrapping_add(0u16.wrapping_sub((i + 1) as u16));
                    fell_off.push(id);
                }
            }
            let shifted = if gap >= 16 { 0 } else { (self.acked_bitfield as u32) << gap };
            self.acked_bitfield = (shifted & 0xFFFF) as u16 | remote_bitfield;
            self.last_acked = remote_last;
        } else if gap == 0 {
            self.acked_bitfield |= remote_bitfield;
        }
        // gap < 0: a stale ack of an older "latest" id. `AckExtra`'s extra
        // field is matched against the pending map directly by the caller,
        // not through this sliding-window state.

        AckDelta { newly_delivered, fell_off }
    }
}

/// Expands a `(last, bitfield)` ack pair into the set of sequence ids it
/// covers (not including `last` itself): bit `i` (1-indexed) means
/// `last - i` was received.
fn ack_bits_to_ids(last: SequenceId, bitfield: u16) -> Vec<SequenceId> {
    (1..=16u16)
        .filter(|i| bitfield & (1 << (i - 1)) != 0)
        .map(|i| last.wrapping_add(0u16.wrapping_sub(i)))
        .collect()
}

pub struct AckDelta {
    pub newly_delivered: Vec<SequenceId>,
    pub fell_off: Vec<SequenceId>,
}

/// Notify state: strict-order discard on receive, piggybacked acks on send,
/// and the set of outstanding outbound sequence ids awaiting feedback.
pub struct NotifyState {
    pub last_received: SequenceId,
    has_received_any: bool,
    pub received_bitfield: u16,
    pub outstanding: HashMap<SequenceId, u64>,
    next_sequence_id: SequenceId,
}

impl Default for NotifyState {
    fn default() -> Self {
        Self {
            last_received: SequenceId::ZERO,
            has_received_any: false,
            received_bitfield: 0,
            outstanding: HashMap::new(),
            next_sequence_id: SequenceId::ZERO,
        }
    }
}

pub enum NotifyReceiveOutcome {
    /// Accepted: present to the application.
    Deliver,
    /// Older than the last received id: discard, but acks still update.
    Discard,
}

impl NotifyState {
    pub fn next_outbound_sequence_id(&mut self) -> SequenceId {
        let id = self.next_sequence_id;
        self.next_sequence_id = self.next_sequence_id.next();
        id
    }

    pub fn receive(&mut self, seq: SequenceId) -> NotifyReceiveOutcome {
        if !self.has_received_any {
            self.has_received_any = true;
            self.last_received = seq;
            self.received_bitfield = 0;
            return NotifyReceiveOutcome::Deliver;
        }
        let gap = seq.signed_diff(self.last_received);
        if gap <= 0 {
            return NotifyReceiveOutcome::Discard;
        }
        if gap <= 16 {
            self.received_bitfield = (self.received_bitfield << gap) | (1 << (gap - 1));
        } else {
            self.received_bitfield = 0;
        }
        self.last_received = seq;
        NotifyReceiveOutcome::Deliver
    }

    /// Applies the peer's piggybacked ack (`remote_last`, `remote_bitfield`)
    /// against our outstanding sends, returning ids newly confirmed
    /// delivered and ids that fell out of the ack window and are therefore
    /// lost.
    pub fn apply_peer_ack(&mut self, remote_last: SequenceId, remote_bitfield: u16) -> (Vec<(SequenceId, u64)>, Vec<(SequenceId, u64)>) {
        let mut delivered = Vec::new();
        let mut lost = Vec::new();

        let mut acked = ack_bits_to_ids(remote_last, remote_bitfield);
        acked.push(remote_last);

        for &id in &acked {
            if let Some(tag) = self.outstanding.remove(&id) {
                delivered.push((id, tag));
            }
        }

        // Anything outstanding older than `remote_last - 16` can no longer
        // be acknowledged by this window: it's lost.
        let stale: Vec<SequenceId> = self
            .outstanding
            .keys()
            .copied()
            .filter(|&id| remote_last.signed_diff(id) > 16)
            .collect();
        for id in stale {
            if let Some(tag) = self.outstanding.remove(&id) {
                lost.push((id, tag));
            }
        }

        (delivered, lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_filters_exact_duplicate() {
        let mut state = ReceiveAckState::default();
        assert!(!state.receive(SequenceId(5)));
        assert!(state.receive(SequenceId(5)));
    }

    #[test]
    fn receive_filters_older_duplicate() {
        let mut state = ReceiveAckState::default();
        assert!(!state.receive(SequenceId(5)));
        assert!(!state.receive(SequenceId(6)));
        assert!(!state.receive(SequenceId(4))); // older, first time
        assert!(state.receive(SequenceId(4))); // now a duplicate
    }

    #[test]
    fn receive_accepts_out_of_order_within_window() {
        let mut state = ReceiveAckState::default();
        state.receive(SequenceId(10));
        assert!(!state.receive(SequenceId(8)));
        assert_eq!(state.last_received, SequenceId(10));
        assert_ne!(state.received_bitfield & (1 << 1), 0);
    }

    #[test]
    fn notify_discards_out_of_order() {
        let mut state = NotifyState::default();
        assert!(matches!(state.receive(SequenceId(5)), NotifyReceiveOutcome::Deliver));
        assert!(matches!(state.receive(SequenceId(3)), NotifyReceiveOutcome::Discard));
        assert!(matches!(state.receive(SequenceId(6)), NotifyReceiveOutcome::Deliver));
    }

    #[test]
    fn notify_outstanding_ack_and_loss() {
        let mut state = NotifyState::default();
        for i in 0..20u16 {
            state.outstanding.insert(SequenceId(i), i as u64);
        }
        let (delivered, lost) = state.apply_peer_ack(SequenceId(19), 0b1);
        assert!(delivered.iter().any(|&(id, _)| id == SequenceId(19)));
        assert!(delivered.iter().any(|&(id, _)| id == SequenceId(18)));
        assert!(lost.iter().any(|&(id, _)| id == SequenceId(2)));
    }

    #[test]
    fn send_ack_state_tracks_delivery_and_loss() {
        let mut state = SendAckState::default();
        let first = state.apply_ack(SequenceId(10), 0);
        assert_eq!(first.newly_delivered, vec![SequenceId(10)]);
        assert!(first.fell_off.is_empty());

        // Advance far enough that id 9 (a predecessor of 10 that was never
        // separately acked) falls out of the window.
        let second = state.apply_ack(SequenceId(27), 0);
        assert!(second.fell_off.contains(&SequenceId(9)));
    }

    #[test]
    fn retry_interval_defaults_to_50ms() {
        assert_eq!(retry_interval(None), Duration::from_millis(50));
    }

    #[test]
    fn retry_interval_floors_at_10ms() {
        assert_eq!(retry_interval(Some(Duration::from_millis(1))), Duration::from_millis(10));
    }

    #[test]
    fn retry_interval_scales_with_rtt() {
        let got = retry_interval(Some(Duration::from_millis(100)));
        assert_eq!(got, Duration::from_millis(120));
    }
}
