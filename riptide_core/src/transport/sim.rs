//! In-memory transport harness: configurable loss, latency jitter, and
//! reordering, used by integration tests to drive the reliability engine
//! deterministically without real sockets or wall-clock flakiness.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Transport, TransportEvent};

struct InFlight {
    deliver_at: Instant,
    from: SocketAddr,
    bytes: Vec<u8>,
}

struct NetworkInner {
    rng: StdRng,
    loss_rate: f64,
    jitter: Duration,
    inboxes: HashMap<SocketAddr, Vec<InFlight>>,
}

/// Shared virtual network. Clone to hand each participant its own
/// [`SimTransport`] endpoint bound to the same network.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl SimNetwork {
    /// `loss_rate` in `[0, 1]`; `jitter` is the maximum extra delay applied
    /// to a delivered datagram (reordering falls out of overlapping delays).
    pub fn new(seed: u64, loss_rate: f64, jitter: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                rng: StdRng::seed_from_u64(seed),
                loss_rate,
                jitter,
                inboxes: HashMap::new(),
            })),
        }
    }

    /// Changes the loss rate applied to future sends. Lets a test establish
    /// a connection over a clean network, then degrade it to exercise
    /// timeout/quality-disconnect behavior.
    pub fn set_loss_rate(&self, loss_rate: f64) {
        self.inner.lock().unwrap().loss_rate = loss_rate;
    }

    /// Binds a new endpoint on this network.
    pub fn endpoint(&self, addr: SocketAddr) -> SimTransport {
        SimTransport {
            network: self.clone(),
            addr,
            stopped: false,
        }
    }

    fn send(&self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.rng.gen::<f64>() < inner.loss_rate {
            return;
        }
        let delay = if inner.jitter.is_zero() {
            Duration::ZERO
        } else {
            let millis = inner.rng.gen_range(0..=inner.jitter.as_millis() as u64);
            Duration::from_millis(millis)
        };
        let deliver_at = Instant::now() + delay;
        inner.inboxes.entry(to).or_default().push(InFlight { deliver_at, from, bytes });
    }

    fn drain(&self, addr: SocketAddr) -> Vec<TransportEvent> {
        let mut inner = self.inner.lock().unwrap();
        let Some(inbox) = inner.inboxes.get_mut(&addr) else {
            return Vec::new();
        };
        let now = Instant::now();
        let (due, pending): (Vec<InFlight>, Vec<InFlight>) =
            std::mem::take(inbox).into_iter().partition(|pkt| pkt.deliver_at <= now);
        *inbox = pending;
        let mut ready = due;
        ready.sort_by_key(|pkt| pkt.deliver_at);
        ready
            .into_iter()
            .map(|pkt| TransportEvent::DataReceived(pkt.from, pkt.bytes))
            .collect()
    }
}

/// A [`Transport`] endpoint on a [`SimNetwork`].
pub struct SimTransport {
    network: SimNetwork,
    addr: SocketAddr,
    stopped: bool,
}

impl Transport for SimTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    fn send(&mut self, bytes: &[u8], to: SocketAddr) {
        if self.stopped {
            return;
        }
        self.network.send(self.addr, to, bytes.to_vec());
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        if self.stopped {
            return Vec::new();
        }
        self.network.drain(self.addr)
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
