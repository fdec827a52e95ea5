//!
//! The peer-to-peer address manager.
//!
//! Keeps the reported-peer set: addresses learned through gossip but not
//! currently connected. Bounded by a random purge, fed by the periodic
//! peer exchange, and never containing our own address or an authenticated
//! peer's.
use std::collections::HashSet;

use tracing::{debug, trace};

use crate::common::addr::OverlayAddr;
use crate::common::peer::{AddressSource, KnownAddress, Source, Store};
use crate::common::time::Clock;
use crate::net::time::DelayQueue;
use crate::net::{ConnectionId, LocalDuration, LocalTime};
use crate::wire;

use super::output::{Disconnect, SetTimer, Wire};

/// Maximum number of reported addresses we keep.
pub const MAX_REPORTED_PEERS: usize = 1000;
/// Address lists larger than this are misbehavior and cost the sender its
/// connection.
pub const MAX_REPORTED_BATCH: usize = 1100;
/// Bounds of the peer-exchange interval.
pub const EXCHANGE_INTERVAL_MIN: LocalDuration = LocalDuration::from_mins(1);
pub const EXCHANGE_INTERVAL_MAX: LocalDuration = LocalDuration::from_mins(2);
/// Per-peer jitter bounds for exchange requests, in milliseconds.
const EXCHANGE_JITTER_MIN_MS: u64 = 5;
const EXCHANGE_JITTER_MAX_MS: u64 = 10;

/// An event emitted by the address manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// Peer addresses have been received.
    AddressesReceived {
        /// Number of addresses received.
        count: usize,
        /// Source of addresses received.
        source: Source,
    },
    /// Reported addresses were dropped to stay under the cap.
    AddressesPurged {
        /// Number of addresses dropped.
        count: usize,
    },
    /// A peer sent more addresses than the protocol allows.
    OversizedAddressList {
        /// The offending connection.
        conn: ConnectionId,
        /// How many addresses it sent.
        count: usize,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::AddressesReceived { count, source } => {
                write!(fmt, "received {} addresse(s) from source `{}`", count, source)
            }
            Event::AddressesPurged { count } => {
                write!(fmt, "purged {} reported addresse(s) over the cap", count)
            }
            Event::OversizedAddressList { conn, count } => {
                write!(fmt, "{} sent an oversized address list ({})", conn, count)
            }
        }
    }
}

/// Address manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on the reported-peer set.
    pub max_reported_peers: usize,
    /// Address lists above this size are misbehavior.
    pub max_reported_batch: usize,
    /// Peer-exchange interval bounds.
    pub exchange_interval: (LocalDuration, LocalDuration),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_reported_peers: MAX_REPORTED_PEERS,
            max_reported_batch: MAX_REPORTED_BATCH,
            exchange_interval: (EXCHANGE_INTERVAL_MIN, EXCHANGE_INTERVAL_MAX),
        }
    }
}

/// Outcome of merging a received address list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The list was merged.
    Merged {
        /// Newly-learned addresses.
        added: usize,
    },
    /// The list exceeded the protocol limit and the sender was disconnected.
    Oversized,
}

/// Manages reported peer addresses.
#[derive(Debug)]
pub struct AddressManager<P, U, C> {
    /// Address manager configuration.
    pub config: Config,
    /// Reported address store.
    peers: P,
    /// Our own addresses, as configured or as seen by remote peers. Never
    /// enter the reported set.
    local_addrs: HashSet<OverlayAddr>,
    /// Next peer-exchange round.
    next_exchange: Option<LocalTime>,
    /// Jittered per-peer exchange sends.
    queue: DelayQueue<ConnectionId>,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<P: Store, U: Wire<Event> + SetTimer + Disconnect, C: Clock> AddressManager<P, U, C> {
    /// Create a new, empty address manager.
    pub fn new(config: Config, rng: fastrand::Rng, peers: P, upstream: U, clock: C) -> Self {
        Self {
            config,
            peers,
            local_addrs: HashSet::new(),
            next_exchange: None,
            queue: DelayQueue::new(),
            upstream,
            rng,
            clock,
        }
    }

    /// Initialize the address manager. Must be called once.
    pub fn initialize(&mut self) {
        self.rearm();
    }

    /// The number of reported peers known.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether there are any reported peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether an address is in the reported set.
    pub fn contains(&self, addr: &OverlayAddr) -> bool {
        self.peers.get(addr).is_some()
    }

    /// The reported set united with the given authenticated addresses: what
    /// we offer in a peer exchange.
    pub fn known_addresses(&self, authenticated: &HashSet<OverlayAddr>) -> Vec<OverlayAddr> {
        self.peers
            .iter()
            .map(|(addr, _)| addr.clone())
            .chain(authenticated.iter().cloned())
            .collect()
    }

    /// Called when a request for known addresses was received: merge what the
    /// peer offered, then answer with what we know.
    pub fn received_get_peers(
        &mut self,
        conn: ConnectionId,
        msg: wire::GetPeers,
        authenticated: &HashSet<OverlayAddr>,
    ) {
        if self.merge(conn, msg.known, Source::Peer, authenticated) == MergeOutcome::Oversized {
            return;
        }
        let known = self.known_addresses(authenticated);
        self.upstream.peers(conn, known);
    }

    /// Called when a peer shared its known addresses.
    pub fn received_peers(
        &mut self,
        conn: ConnectionId,
        msg: wire::Peers,
        authenticated: &HashSet<OverlayAddr>,
    ) {
        self.merge(conn, msg.known, Source::Peer, authenticated);
    }

    /// Merge an address list into the reported set.
    ///
    /// Oversized lists cost the sender its connection and change nothing.
    /// Otherwise our own address and authenticated peers are dropped, the
    /// rest is unioned in, and the set is purged back under the cap.
    fn merge(
        &mut self,
        conn: ConnectionId,
        addrs: Vec<OverlayAddr>,
        source: Source,
        authenticated: &HashSet<OverlayAddr>,
    ) -> MergeOutcome {
        if addrs.len() > self.config.max_reported_batch {
            self.upstream.event(Event::OversizedAddressList {
                conn,
                count: addrs.len(),
            });
            self.upstream.disconnect(
                conn,
                super::handler::DisconnectReason::PeerMisbehaving("oversized address list"),
            );
            return MergeOutcome::Oversized;
        }
        let count = addrs.len();
        let time = self.clock.local_time();
        let mut fresh = HashSet::new();
        let mut added = 0;

        for addr in addrs {
            if self.local_addrs.contains(&addr) {
                continue;
            }
            if authenticated.contains(&addr) {
                continue;
            }
            if self
                .peers
                .insert(&addr, KnownAddress::new(addr.clone(), source, Some(time)))
            {
                added += 1;
            } else if let Some(ka) = self.peers.get_mut(&addr) {
                ka.last_seen = Some(time);
            }
            fresh.insert(addr);
        }
        if count > 0 {
            self.upstream.event(Event::AddressesReceived { count, source });
        }
        self.purge(&fresh);

        MergeOutcome::Merged { added }
    }

    /// Drop uniformly random reported addresses until the set is back under
    /// the cap. Just-reported addresses are kept over older ones, and
    /// authenticated peers are not in the reported set, so neither is purged.
    fn purge(&mut self, fresh: &HashSet<OverlayAddr>) {
        if self.peers.len() <= self.config.max_reported_peers {
            return;
        }
        let excess = self.peers.len() - self.config.max_reported_peers;
        let mut candidates: Vec<OverlayAddr> = self
            .peers
            .iter()
            .map(|(addr, _)| addr.clone())
            .filter(|addr| !fresh.contains(addr))
            .collect();

        self.rng.shuffle(&mut candidates);
        candidates.truncate(excess);

        for addr in &candidates {
            self.peers.remove(addr);
        }
        let mut count = candidates.len();

        // A single batch can exceed the cap on its own; then it pays too.
        if self.peers.len() > self.config.max_reported_peers {
            let excess = self.peers.len() - self.config.max_reported_peers;
            let mut rest: Vec<OverlayAddr> =
                self.peers.iter().map(|(addr, _)| addr.clone()).collect();

            self.rng.shuffle(&mut rest);

            for addr in rest.into_iter().take(excess) {
                self.peers.remove(&addr);
                count += 1;
            }
        }
        self.upstream.event(Event::AddressesPurged { count });
    }

    /// An address authenticated: it is connected now, not merely reported.
    pub fn peer_authenticated(&mut self, addr: &OverlayAddr) {
        self.peers.remove(addr);
        self.purge(&HashSet::new());
    }

    /// A peer disconnected: its address leaves the reported set as well.
    pub fn peer_disconnected(&mut self, addr: &OverlayAddr) {
        self.peers.remove(addr);
    }

    /// Called when a tick is received.
    ///
    /// Starts a peer-exchange round when the interval elapsed, spreading the
    /// requests over the peers with a small per-peer jitter, and flushes the
    /// requests that are due.
    pub fn received_wake(
        &mut self,
        peers: &[(OverlayAddr, ConnectionId)],
        authenticated: &HashSet<OverlayAddr>,
        local: Option<&OverlayAddr>,
    ) {
        let local_time = self.clock.local_time();

        trace!(target: "p2p", "Received wake");

        if self.next_exchange.map_or(false, |at| local_time >= at) {
            for (_, conn) in peers {
                let jitter = LocalDuration::from_millis(
                    self.rng.u64(EXCHANGE_JITTER_MIN_MS..=EXCHANGE_JITTER_MAX_MS),
                );
                self.queue.schedule(*conn, local_time + jitter);
            }
            if let Some(wait) = self.queue.next_due(local_time) {
                self.upstream.set_timer(wait);
            }
            self.rearm();
        }

        let due = self.queue.pop_due(local_time);

        if !due.is_empty() {
            let Some(local) = local else {
                debug!(target: "p2p", "Local address not published, skipping peer exchange");
                return;
            };
            let known = self.known_addresses(authenticated);

            for conn in due {
                self.upstream.get_peers(conn, local.clone(), known.clone());
            }
        }
    }

    /// Schedule the next exchange round.
    fn rearm(&mut self) {
        let delay = super::random_delay(&mut self.rng, self.config.exchange_interval);

        self.next_exchange = Some(self.clock.local_time() + delay);
        self.upstream.set_timer(delay);
    }
}

impl<P: Store, U: Wire<Event> + SetTimer + Disconnect, C: Clock> AddressSource
    for AddressManager<P, U, C>
{
    fn sample(&mut self, exclude: &HashSet<OverlayAddr>) -> Option<OverlayAddr> {
        let candidates: Vec<OverlayAddr> = self
            .peers
            .iter()
            .map(|(addr, _)| addr.clone())
            .filter(|addr| !exclude.contains(addr))
            .collect();

        if candidates.is_empty() {
            return None;
        }
        let ix = self.rng.usize(..candidates.len());

        candidates.into_iter().nth(ix)
    }

    fn record_local_address(&mut self, addr: OverlayAddr) {
        self.peers.remove(&addr);
        self.local_addrs.insert(addr);
    }

    fn insert(&mut self, addrs: impl IntoIterator<Item = OverlayAddr>, source: Source) {
        let time = self.clock.local_time();
        let mut fresh = HashSet::new();

        for addr in addrs {
            if self.local_addrs.contains(&addr) {
                continue;
            }
            self.peers
                .insert(&addr, KnownAddress::new(addr.clone(), source, Some(time)));
            fresh.insert(addr);
        }
        self.purge(&fresh);
    }

    fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
