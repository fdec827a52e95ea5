//! Liveness manager.
//!
//! Probes authenticated peers that have gone quiet, and checks the nonce
//! echoed in their answers. A wrong echo is a protocol violation; the peer
//! manager shuts the connection down.
use std::collections::HashMap;

use tracing::{debug, trace};

use crate::common::addr::OverlayAddr;
use crate::common::time::Clock;
use crate::net::time::DelayQueue;
use crate::net::{ConnectionId, LocalDuration, LocalTime};

use super::output::{SetTimer, Wire};

/// How long a connection may be quiet before we probe it.
pub const PING_IDLE: LocalDuration = LocalDuration::from_secs(30);
/// Bounds of the liveness tick interval.
pub const LIVENESS_INTERVAL_MIN: LocalDuration = LocalDuration::from_mins(5);
pub const LIVENESS_INTERVAL_MAX: LocalDuration = LocalDuration::from_mins(10);
/// Per-peer jitter bounds for probes, in milliseconds.
const PING_JITTER_MIN_MS: u64 = 1;
const PING_JITTER_MAX_MS: u64 = 10;

/// An event emitted by the liveness manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A probe was sent to a quiet peer.
    PingSent {
        /// The probed peer.
        addr: OverlayAddr,
        /// The nonce we expect back.
        nonce: u64,
    },
    /// A peer answered a probe correctly.
    PongReceived {
        /// The answering peer.
        addr: OverlayAddr,
        /// The echoed nonce.
        nonce: u64,
    },
    /// A peer answered with the wrong nonce.
    PongMismatch {
        /// The offending peer.
        addr: OverlayAddr,
        /// The nonce we expected, if a probe was outstanding.
        expected: Option<u64>,
        /// The nonce we got.
        got: u64,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::PingSent { addr, nonce } => write!(fmt, "{}: Sent ping ({})", addr, nonce),
            Event::PongReceived { addr, nonce } => {
                write!(fmt, "{}: Received pong ({})", addr, nonce)
            }
            Event::PongMismatch { addr, expected, got } => write!(
                fmt,
                "{}: Pong nonce mismatch (expected {:?}, got {})",
                addr, expected, got
            ),
        }
    }
}

/// Liveness manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Liveness tick interval bounds.
    pub interval: (LocalDuration, LocalDuration),
    /// Idle threshold before a peer is probed.
    pub idle: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: (LIVENESS_INTERVAL_MIN, LIVENESS_INTERVAL_MAX),
            idle: PING_IDLE,
        }
    }
}

/// Per-peer probe state.
#[derive(Debug)]
struct Probe {
    /// The peer's connection.
    conn: ConnectionId,
    /// Outstanding probe nonce, if any.
    nonce: Option<u64>,
}

/// Manages peer liveness.
#[derive(Debug)]
pub struct PingManager<U, C> {
    /// Liveness manager configuration.
    pub config: Config,
    /// Probe state of authenticated peers.
    peers: HashMap<OverlayAddr, Probe>,
    /// Jittered per-peer probe sends.
    queue: DelayQueue<OverlayAddr>,
    /// Next liveness tick.
    next_tick: Option<LocalTime>,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U: Wire<Event> + SetTimer, C: Clock> PingManager<U, C> {
    /// Create a new liveness manager.
    pub fn new(config: Config, rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            queue: DelayQueue::new(),
            next_tick: None,
            upstream,
            rng,
            clock,
        }
    }

    /// Initialize the liveness manager. Must be called once.
    pub fn initialize(&mut self) {
        self.rearm();
    }

    /// Called when a peer completed authentication.
    pub fn peer_negotiated(&mut self, addr: OverlayAddr, conn: ConnectionId) {
        self.peers.insert(addr, Probe { conn, nonce: None });
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, addr: &OverlayAddr) {
        self.peers.remove(addr);
    }

    /// Whether the liveness interval has elapsed. The capacity check runs on
    /// the same cadence, before the probes go out.
    pub fn tick_due(&self, now: LocalTime) -> bool {
        self.next_tick.map_or(false, |at| now >= at)
    }

    /// Start a probe round over the given quiet peers, spreading the sends
    /// with a small per-peer jitter, and re-arm the tick.
    pub fn tick(&mut self, idle_peers: &[(OverlayAddr, ConnectionId)]) {
        let now = self.clock.local_time();

        trace!(target: "p2p", "Liveness tick over {} quiet peer(s)", idle_peers.len());

        for (addr, _) in idle_peers {
            if !self.peers.contains_key(addr) {
                continue;
            }
            let jitter = LocalDuration::from_millis(
                self.rng.u64(PING_JITTER_MIN_MS..=PING_JITTER_MAX_MS),
            );
            self.queue.schedule(addr.clone(), now + jitter);
        }
        if let Some(wait) = self.queue.next_due(now) {
            self.upstream.set_timer(wait);
        }
        self.rearm();
    }

    /// Send the probes that are due.
    pub fn flush(&mut self) {
        let now = self.clock.local_time();

        for addr in self.queue.pop_due(now) {
            let Some(probe) = self.peers.get_mut(&addr) else {
                continue;
            };
            let nonce = self.rng.u64(..);

            probe.nonce = Some(nonce);
            self.upstream.ping(probe.conn, nonce);
            self.upstream.event(Event::PingSent { addr, nonce });
        }
    }

    /// Called when a ping was received; answer on the same connection.
    pub fn received_ping(&mut self, conn: ConnectionId, nonce: u64) {
        self.upstream.pong(conn, nonce);
    }

    /// Called when a pong was received. Returns `false` on a nonce mismatch,
    /// in which case the caller evicts the peer.
    pub fn received_pong(&mut self, addr: &OverlayAddr, nonce: u64) -> bool {
        let Some(probe) = self.peers.get_mut(addr) else {
            debug!(target: "p2p", "{}: pong from unknown peer", addr);
            return true;
        };
        if probe.nonce == Some(nonce) {
            probe.nonce = None;
            self.upstream.event(Event::PongReceived {
                addr: addr.clone(),
                nonce,
            });
            true
        } else {
            self.upstream.event(Event::PongMismatch {
                addr: addr.clone(),
                expected: probe.nonce,
                got: nonce,
            });
            false
        }
    }

    /// Schedule the next liveness tick.
    fn rearm(&mut self) {
        let delay = super::random_delay(&mut self.rng, self.config.interval);

        self.next_tick = Some(self.clock.local_time() + delay);
        self.upstream.set_timer(delay);
    }
}
