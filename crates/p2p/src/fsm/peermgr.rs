//! Manages peer connections and the authentication exchange.
//!
//! The peer manager owns two of the three peer tables: authenticated peers
//! and in-flight handshakes, disjoint by address at all times. (Reported
//! addresses live in the address manager.) It also enforces the connection
//! caps through tiered eviction.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::common::addr::OverlayAddr;
use crate::common::time::Clock;
use crate::fsm::handshake::{Handshake, Role, Stage};
use crate::net::{ConnectionId, Link, LocalDuration, LocalTime};
use crate::wire;

use super::handler::DisconnectReason;
use super::output::{Connect, Disconnect, SetTimer, Wire};

/// Authenticated connections we are comfortable with; bootstrap stops and
/// eviction starts here.
pub const MAX_CONNECTIONS_LOW: usize = 8;
/// Above this, outbound connections become eviction candidates too.
pub const MAX_CONNECTIONS_NORMAL: usize = 12;
/// Above this, every authenticated connection is an eviction candidate.
pub const MAX_CONNECTIONS_HIGH: usize = 16;
/// Bounds of the delay before re-checking caps after an eviction completes.
pub const CAPACITY_RECHECK_MIN: LocalDuration = LocalDuration::from_millis(100);
pub const CAPACITY_RECHECK_MAX: LocalDuration = LocalDuration::from_millis(500);

/// An event originating in the peer manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connecting to a peer.
    Connecting(OverlayAddr),
    /// A new connection is open. This fires *before* the peer has
    /// authenticated.
    Connected(ConnectionId, Link),
    /// Connection attempt failed.
    ConnectionFailed(OverlayAddr, Arc<std::io::Error>),
    /// A peer completed the authentication exchange.
    Authenticated {
        /// The peer's address.
        addr: OverlayAddr,
        /// The authenticated connection.
        conn: ConnectionId,
        /// How the connection participates in the mesh from now on.
        kind: ConnectionKind,
    },
    /// An authentication exchange failed.
    AuthenticationFailed {
        /// The address the exchange was binding.
        addr: OverlayAddr,
        /// What went wrong.
        reason: &'static str,
    },
    /// A connection closed.
    Disconnected(ConnectionId, Option<OverlayAddr>),
    /// An authenticated connection was shut down to get back under the caps.
    Evicted {
        /// The evicted peer.
        addr: OverlayAddr,
        /// Its connection.
        conn: ConnectionId,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting(addr) => write!(fmt, "Connecting to peer {}", addr),
            Self::Connected(conn, link) => write!(fmt, "{}: Peer connected ({:?})", conn, link),
            Self::ConnectionFailed(addr, err) => {
                write!(fmt, "{}: Peer connection attempt failed: {}", addr, err)
            }
            Self::Authenticated { addr, conn, kind } => {
                write!(fmt, "{}: Peer authenticated on {} ({})", addr, conn, kind)
            }
            Self::AuthenticationFailed { addr, reason } => {
                write!(fmt, "{}: Authentication failed: {}", addr, reason)
            }
            Self::Disconnected(conn, Some(addr)) => {
                write!(fmt, "Disconnected from {} ({})", addr, conn)
            }
            Self::Disconnected(conn, None) => write!(fmt, "Disconnected {}", conn),
            Self::Evicted { addr, conn } => {
                write!(fmt, "{}: Peer evicted to get back under capacity ({})", addr, conn)
            }
        }
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Authenticated connections we aim for; eviction of passive connections
    /// starts above this.
    pub max_connections_low: usize,
    /// Above this, active (outbound) connections are evicted too.
    pub max_connections_normal: usize,
    /// Above this, any authenticated connection may be evicted.
    pub max_connections_high: usize,
    /// Delay window before re-checking caps after an eviction completes.
    pub capacity_recheck: (LocalDuration, LocalDuration),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections_low: MAX_CONNECTIONS_LOW,
            max_connections_normal: MAX_CONNECTIONS_NORMAL,
            max_connections_high: MAX_CONNECTIONS_HIGH,
            capacity_recheck: (CAPACITY_RECHECK_MIN, CAPACITY_RECHECK_MAX),
        }
    }
}

/// How a connection participates in the mesh. Drives the eviction tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Inbound, peer not yet authenticated.
    Inbound,
    /// Outbound, peer not yet authenticated.
    Outbound,
    /// Inbound, authenticated. First eviction tier.
    Passive,
    /// Outbound, authenticated. Second eviction tier.
    Active,
    /// Currently serving an inbound authentication exchange. Never evicted.
    AuthRequest,
    /// Authenticated for direct messaging. Last eviction tier.
    DirectPeer,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(fmt, "inbound"),
            Self::Outbound => write!(fmt, "outbound"),
            Self::Passive => write!(fmt, "passive"),
            Self::Active => write!(fmt, "active"),
            Self::AuthRequest => write!(fmt, "auth-request"),
            Self::DirectPeer => write!(fmt, "direct-peer"),
        }
    }
}

/// Core-side view of a transport connection.
///
/// The transport owns the connection; this is the bookkeeping the core keeps
/// about it.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Transport-assigned identifier.
    pub id: ConnectionId,
    /// The remote peer's address, once bound by authentication. Outbound
    /// connections carry the dialed address from the start.
    pub addr: Option<OverlayAddr>,
    /// Mesh participation class.
    pub kind: ConnectionKind,
    /// Link direction.
    pub link: Link,
    /// Open since this time.
    pub since: LocalTime,
    /// Last time any message arrived on this connection.
    pub last_active: LocalTime,
    /// Whether the remote peer has authenticated.
    pub authenticated: bool,
}

/// An authenticated peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address.
    pub addr: OverlayAddr,
    /// The connection the peer is bound to.
    pub conn: ConnectionId,
}

/// Result of feeding a handshake message into the peer manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// The exchange completed; the address is now authenticated.
    Authenticated(OverlayAddr),
    /// The exchange failed and was removed.
    Failed(OverlayAddr),
}

/// What a closed connection was doing at the time it closed.
#[derive(Debug, Clone)]
pub struct Departed {
    /// The address the connection was bound to, or binding.
    pub addr: OverlayAddr,
    /// It carried an authenticated peer.
    pub authenticated: bool,
    /// It carried an in-flight handshake.
    pub handshaking: bool,
}

/// Manages peer connections and the authentication exchange.
#[derive(Debug)]
pub struct PeerManager<U, C> {
    /// Peer manager configuration.
    pub config: Config,
    /// Our own overlay address, once published.
    local: Option<OverlayAddr>,
    /// Connection states, by transport id.
    conns: HashMap<ConnectionId, Connection>,
    /// Authenticated peers, by address.
    peers: HashMap<OverlayAddr, Peer>,
    /// In-flight handshakes, by address. Disjoint with `peers`.
    handshakes: HashMap<OverlayAddr, Handshake>,
    /// Addresses being authenticated for direct messaging.
    direct: HashSet<OverlayAddr>,
    /// Eviction in progress, waiting for the transport to confirm.
    evicting: Option<ConnectionId>,
    /// Pending capacity re-check.
    recheck_at: Option<LocalTime>,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U: Wire<Event> + SetTimer + Connect + Disconnect, C: Clock> PeerManager<U, C> {
    /// Create a new peer manager.
    pub fn new(config: Config, rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            config,
            local: None,
            conns: HashMap::new(),
            peers: HashMap::new(),
            handshakes: HashMap::new(),
            direct: HashSet::new(),
            evicting: None,
            recheck_at: None,
            upstream,
            rng,
            clock,
        }
    }

    /// Record our own overlay address. Needed to open and answer exchanges.
    pub fn set_local_address(&mut self, addr: OverlayAddr) {
        self.local = Some(addr);
    }

    /// Initiate an outbound authentication exchange with `addr`.
    ///
    /// Returns `false` if the address is already authenticated or an exchange
    /// is already in flight; the racing attempt is suppressed.
    pub fn authenticate(&mut self, addr: OverlayAddr) -> bool {
        if self.local.as_ref() == Some(&addr) {
            debug!(target: "p2p", "Not authenticating to own address {}", addr);
            return false;
        }
        if self.is_authenticated(&addr) {
            warn!(target: "p2p", "{}: already authenticated, suppressing attempt", addr);
            return false;
        }
        if self.is_handshaking(&addr) {
            warn!(target: "p2p", "{}: handshake already in flight, suppressing attempt", addr);
            return false;
        }
        let time = self.clock.local_time();

        self.handshakes
            .insert(addr.clone(), Handshake::requester(addr.clone(), time));
        self.upstream.connect(addr.clone());
        self.upstream.event(Event::Connecting(addr));

        true
    }

    /// Initiate a one-shot exchange for direct messaging. The connection will
    /// be classed [`ConnectionKind::DirectPeer`] on success.
    pub fn authenticate_direct(&mut self, addr: OverlayAddr) -> bool {
        self.direct.insert(addr.clone());
        self.authenticate(addr)
    }

    /// Called when a peer is being connected to.
    pub fn peer_attempted(&mut self, addr: &OverlayAddr) {
        // All dials originate here, so an attempted address must carry an
        // in-flight handshake.
        debug_assert!(self.is_handshaking(addr), "{} is not handshaking", addr);
    }

    /// Called when a connection is established.
    pub fn peer_connected(&mut self, conn: ConnectionId, addr: Option<&OverlayAddr>, link: Link) {
        let time = self.clock.local_time();

        debug_assert!(!self.conns.contains_key(&conn), "{} is already tracked", conn);

        self.conns.insert(
            conn,
            Connection {
                id: conn,
                addr: addr.cloned(),
                kind: match link {
                    Link::Inbound => ConnectionKind::Inbound,
                    Link::Outbound => ConnectionKind::Outbound,
                },
                link,
                since: time,
                last_active: time,
                authenticated: false,
            },
        );

        match link {
            Link::Inbound => {
                // Wait for the peer's authentication request.
            }
            Link::Outbound => {
                let Some(addr) = addr else {
                    debug!(target: "p2p", "{}: outbound connection without a dialed address", conn);
                    return;
                };
                let Some(local) = self.local.clone() else {
                    self.upstream
                        .disconnect(conn, DisconnectReason::Other("local address not published"));
                    return;
                };
                match self.handshakes.get_mut(addr) {
                    Some(hs) => {
                        let nonce = self.rng.u64(..);

                        hs.dialed(conn, nonce, time);
                        self.upstream.auth_request(conn, local, nonce);
                    }
                    None => {
                        // The transport dialed on its own account; nothing to
                        // authenticate with.
                        debug!(target: "p2p", "{}: outbound connection to {} with no exchange", conn, addr);
                    }
                }
            }
        }
        self.upstream.event(Event::Connected(conn, link));
    }

    /// An outbound dial failed before a connection existed.
    pub fn dial_failed(&mut self, addr: &OverlayAddr, err: Arc<std::io::Error>) -> bool {
        let Some(hs) = self.handshakes.get(addr) else {
            return false;
        };
        if !matches!(hs.stage, Stage::Dialing { .. }) {
            return false;
        }
        self.handshakes.remove(addr);
        self.direct.remove(addr);
        self.upstream.event(Event::ConnectionFailed(addr.clone(), err));

        true
    }

    /// Called when an authentication request was received on `conn`.
    pub fn received_auth_request(&mut self, conn: ConnectionId, msg: wire::AuthRequest) {
        let Some(local) = self.local.clone() else {
            self.upstream
                .disconnect(conn, DisconnectReason::Other("local address not published"));
            return;
        };
        if msg.sender == local {
            self.upstream.disconnect(conn, DisconnectReason::SelfConnection);
            return;
        }
        if self.is_authenticated(&msg.sender) {
            debug!(target: "p2p", "{}: authentication request from already-authenticated {}, dropping", conn, msg.sender);
            return;
        }
        if self.is_handshaking(&msg.sender) {
            warn!(target: "p2p", "{}: handshake already in flight for {}, dropping request", conn, msg.sender);
            return;
        }
        let Some(c) = self.conns.get_mut(&conn) else {
            debug!(target: "p2p", "Authentication request on unknown {}", conn);
            return;
        };
        let time = self.clock.local_time();
        let nonce = self.rng.u64(..);

        // The connection is finalizing an inbound exchange; eviction must
        // leave it alone.
        c.kind = ConnectionKind::AuthRequest;

        self.handshakes.insert(
            msg.sender.clone(),
            Handshake::responder(msg.sender.clone(), conn, nonce, time),
        );
        self.upstream.auth_response(conn, local, msg.nonce, nonce);
    }

    /// Called when an authentication response was received on `conn`.
    pub fn received_auth_response(
        &mut self,
        conn: ConnectionId,
        msg: wire::AuthResponse,
    ) -> Option<HandshakeProgress> {
        let addr = self.conns.get(&conn).and_then(|c| c.addr.clone())?;
        let hs = self.handshakes.get(&addr)?;

        if hs.conn != Some(conn) {
            debug!(target: "p2p", "{}: authentication response on the wrong connection", conn);
            return None;
        }
        if msg.sender != addr {
            // The peer on the far side claims an address other than the one
            // we dialed. Never bind it.
            error!(
                target: "p2p",
                "{}: authentication response claims {} but {} was dialed", conn, msg.sender, addr
            );
            return Some(self.fail_handshake(&addr, conn, "peer address mismatch"));
        }
        match hs.verify_response(&msg) {
            Ok(response_nonce) => {
                self.upstream.auth_ack(conn, response_nonce);
                Some(self.promote(addr, conn))
            }
            Err(reason) => Some(self.fail_handshake(&addr, conn, reason)),
        }
    }

    /// Called when an authentication ack was received on `conn`.
    pub fn received_auth_ack(
        &mut self,
        conn: ConnectionId,
        msg: wire::AuthAck,
    ) -> Option<HandshakeProgress> {
        let addr = self
            .handshakes
            .values()
            .find(|hs| hs.conn == Some(conn) && hs.role == Role::Responder)
            .map(|hs| hs.addr.clone())?;

        match self.handshakes[&addr].verify_ack(&msg) {
            Ok(()) => Some(self.promote(addr, conn)),
            Err(reason) => Some(self.fail_handshake(&addr, conn, reason)),
        }
    }

    /// Complete an exchange: bind the address to the connection and create
    /// the peer.
    fn promote(&mut self, addr: OverlayAddr, conn: ConnectionId) -> HandshakeProgress {
        self.handshakes.remove(&addr);

        let direct = self.direct.remove(&addr);
        let Some(c) = self.conns.get_mut(&conn) else {
            return HandshakeProgress::Failed(addr);
        };
        let kind = if direct {
            ConnectionKind::DirectPeer
        } else if c.link.is_inbound() {
            ConnectionKind::Passive
        } else {
            ConnectionKind::Active
        };
        c.addr = Some(addr.clone());
        c.kind = kind;
        c.authenticated = true;

        self.peers
            .insert(addr.clone(), Peer { addr: addr.clone(), conn });
        self.upstream.event(Event::Authenticated {
            addr: addr.clone(),
            conn,
            kind,
        });
        self.enforce_limits();

        HandshakeProgress::Authenticated(addr)
    }

    /// Fail an exchange: drop it and shut the connection down.
    fn fail_handshake(
        &mut self,
        addr: &OverlayAddr,
        conn: ConnectionId,
        reason: &'static str,
    ) -> HandshakeProgress {
        self.handshakes.remove(addr);
        self.direct.remove(addr);
        self.upstream.event(Event::AuthenticationFailed {
            addr: addr.clone(),
            reason,
        });
        self.upstream
            .disconnect(conn, DisconnectReason::PeerMisbehaving(reason));

        HandshakeProgress::Failed(addr.clone())
    }

    /// Called when a connection closed. Returns what the connection was doing
    /// so callers can clean up the other tables.
    pub fn peer_disconnected(&mut self, conn: ConnectionId) -> Option<Departed> {
        let c = self.conns.remove(&conn)?;

        if self.evicting == Some(conn) {
            self.evicting = None;
            self.schedule_recheck();
        }
        let addr = c.addr.clone().or_else(|| {
            self.handshakes
                .values()
                .find(|hs| hs.conn == Some(conn))
                .map(|hs| hs.addr.clone())
        });
        self.upstream.event(Event::Disconnected(conn, addr.clone()));

        let addr = addr?;
        let authenticated = self
            .peers
            .get(&addr)
            .map_or(false, |p| p.conn == conn);
        if authenticated {
            self.peers.remove(&addr);
        }
        let handshaking = self
            .handshakes
            .get(&addr)
            .map_or(false, |hs| hs.conn == Some(conn));
        if handshaking {
            self.handshakes.remove(&addr);
            self.direct.remove(&addr);
        }

        Some(Departed {
            addr,
            authenticated,
            handshaking,
        })
    }

    /// Called when a message arrived on a connection.
    pub fn record_activity(&mut self, conn: ConnectionId) {
        let time = self.clock.local_time();

        if let Some(c) = self.conns.get_mut(&conn) {
            c.last_active = time;
        }
    }

    /// Called when a tick was received.
    pub fn received_wake(&mut self) {
        let local_time = self.clock.local_time();

        if let Some(at) = self.recheck_at {
            if local_time >= at {
                self.recheck_at = None;
                self.enforce_limits();
            }
        }
    }
}

/// Queries over the peer tables.
impl<U, C> PeerManager<U, C> {
    /// Check whether an address is authenticated.
    pub fn is_authenticated(&self, addr: &OverlayAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Check whether an exchange is in flight for an address.
    pub fn is_handshaking(&self, addr: &OverlayAddr) -> bool {
        self.handshakes.contains_key(addr)
    }

    /// Look up an authenticated peer.
    pub fn peer(&self, addr: &OverlayAddr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    /// Number of authenticated peers.
    pub fn authenticated_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of in-flight handshakes.
    pub fn handshake_count(&self) -> usize {
        self.handshakes.len()
    }

    /// Iterator over authenticated peers and their connections.
    pub fn authenticated(&self) -> impl Iterator<Item = (&Peer, &Connection)> + Clone {
        self.peers
            .values()
            .filter_map(move |p| self.conns.get(&p.conn).map(|c| (p, c)))
    }

    /// Addresses of all authenticated peers.
    pub fn authenticated_addresses(&self) -> HashSet<OverlayAddr> {
        self.peers.keys().cloned().collect()
    }

    /// Authenticated peers as `(address, connection)` pairs.
    pub fn authenticated_conns(&self) -> Vec<(OverlayAddr, ConnectionId)> {
        self.peers
            .values()
            .map(|p| (p.addr.clone(), p.conn))
            .collect()
    }

    /// Addresses that must not be re-attempted: authenticated peers and
    /// in-flight handshakes.
    pub fn addresses_in_use(&self) -> HashSet<OverlayAddr> {
        self.peers
            .keys()
            .chain(self.handshakes.keys())
            .cloned()
            .collect()
    }

    /// Authenticated peers whose connection has been quiet for at least
    /// `idle`.
    pub fn idle_peers(&self, idle: LocalDuration, now: LocalTime) -> Vec<(OverlayAddr, ConnectionId)> {
        self.authenticated()
            .filter(|(_, c)| now - c.last_active >= idle)
            .map(|(p, c)| (p.addr.clone(), c.id))
            .collect()
    }

    /// Look up a connection.
    pub fn connection(&self, conn: ConnectionId) -> Option<&Connection> {
        self.conns.get(&conn)
    }
}

/// Capacity management.
impl<U: Wire<Event> + SetTimer + Connect + Disconnect, C: Clock> PeerManager<U, C> {
    /// Shut down one authenticated connection if we are over the caps.
    ///
    /// Candidates widen in tiers: passive connections first, then active ones,
    /// then everything authenticated. Connections serving an inbound exchange
    /// are never candidates. Runs after every successful authentication and
    /// from the liveness tick; one eviction per call, the follow-up is
    /// scheduled once the transport confirms the shutdown.
    pub fn enforce_limits(&mut self) {
        if self.evicting.is_some() {
            return;
        }
        let count = self.peers.len();
        if count <= self.config.max_connections_low {
            return;
        }
        let victim = {
            let authenticated: Vec<&Connection> = self
                .authenticated()
                .map(|(_, c)| c)
                .filter(|c| c.kind != ConnectionKind::AuthRequest)
                .collect();

            let mut candidates: Vec<&&Connection> = authenticated
                .iter()
                .filter(|c| c.kind == ConnectionKind::Passive)
                .collect();

            if candidates.is_empty() && count > self.config.max_connections_normal {
                candidates = authenticated
                    .iter()
                    .filter(|c| {
                        c.kind == ConnectionKind::Passive || c.kind == ConnectionKind::Active
                    })
                    .collect();
            }
            if candidates.is_empty() && count > self.config.max_connections_high {
                candidates = authenticated.iter().collect();
            }
            candidates
                .into_iter()
                .min_by_key(|c| c.last_active)
                .map(|c| (c.id, c.addr.clone()))
        };

        if let Some((conn, Some(addr))) = victim {
            debug!(target: "p2p", "Over capacity with {} peers, evicting {}", count, addr);

            self.evicting = Some(conn);
            self.upstream.event(Event::Evicted { addr, conn });
            self.upstream.disconnect(conn, DisconnectReason::ConnectionLimit);
        }
    }

    /// Schedule a capacity re-check shortly after an eviction completed, to
    /// drain any remaining excess.
    fn schedule_recheck(&mut self) {
        let delay = super::random_delay(&mut self.rng, self.config.capacity_recheck);

        self.recheck_at = Some(self.clock.local_time() + delay);
        self.upstream.set_timer(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::{AdjustableClock, RefClock};
    use crate::fsm::output::{Io, Outbox};
    use crate::wire::Message;

    fn addr(host: &str) -> OverlayAddr {
        OverlayAddr::new(host, 9999)
    }

    fn manager(config: Config) -> (PeerManager<Outbox, RefClock<LocalTime>>, Outbox, RefClock<LocalTime>) {
        let outbox = Outbox::new();
        let clock = RefClock::from(LocalTime::from_secs(100_000));
        let mut mgr = PeerManager::new(
            config,
            fastrand::Rng::with_seed(42),
            outbox.clone(),
            clock.clone(),
        );
        mgr.set_local_address(addr("self.onion"));

        (mgr, outbox, clock)
    }

    fn drain(outbox: &mut Outbox) -> Vec<Io> {
        outbox.collect()
    }

    fn request_nonce(outputs: &[Io]) -> Option<u64> {
        outputs.iter().find_map(|io| match io {
            Io::Write(_, Message::AuthRequest(m)) => Some(m.nonce),
            _ => None,
        })
    }

    fn response_nonce(outputs: &[Io]) -> Option<u64> {
        outputs.iter().find_map(|io| match io {
            Io::Write(_, Message::AuthResponse(m)) => Some(m.response_nonce),
            _ => None,
        })
    }

    /// Drive a full outbound exchange with `addr` on `conn`.
    fn authenticate_outbound(
        mgr: &mut PeerManager<Outbox, RefClock<LocalTime>>,
        outbox: &mut Outbox,
        peer: &OverlayAddr,
        conn: ConnectionId,
    ) {
        assert!(mgr.authenticate(peer.clone()));
        mgr.peer_connected(conn, Some(peer), Link::Outbound);

        let outputs = drain(outbox);
        let nonce = request_nonce(&outputs).expect("an authentication request is sent");

        let progress = mgr.received_auth_response(
            conn,
            wire::AuthResponse {
                sender: peer.clone(),
                request_nonce: nonce,
                response_nonce: 7,
            },
        );
        assert_eq!(
            progress,
            Some(HandshakeProgress::Authenticated(peer.clone()))
        );
        drain(outbox);
    }

    #[test]
    fn test_outbound_authentication() {
        let (mut mgr, mut outbox, _) = manager(Config::default());
        let peer = addr("alpha.onion");
        let conn = ConnectionId(1);

        assert!(mgr.authenticate(peer.clone()));
        assert!(mgr.is_handshaking(&peer));

        let outputs = drain(&mut outbox);
        assert!(outputs
            .iter()
            .any(|io| matches!(io, Io::Connect(a) if *a == peer)));

        mgr.peer_connected(conn, Some(&peer), Link::Outbound);
        let outputs = drain(&mut outbox);
        let nonce = request_nonce(&outputs).expect("an authentication request is sent");

        let progress = mgr.received_auth_response(
            conn,
            wire::AuthResponse {
                sender: peer.clone(),
                request_nonce: nonce,
                response_nonce: 11,
            },
        );
        assert_eq!(progress, Some(HandshakeProgress::Authenticated(peer.clone())));

        let outputs = drain(&mut outbox);
        assert!(outputs
            .iter()
            .any(|io| matches!(io, Io::Write(c, Message::AuthAck(m)) if *c == conn && m.response_nonce == 11)));

        assert!(mgr.is_authenticated(&peer));
        assert!(!mgr.is_handshaking(&peer));
        assert_eq!(
            mgr.connection(conn).unwrap().kind,
            ConnectionKind::Active
        );
        assert!(mgr.connection(conn).unwrap().authenticated);
    }

    #[test]
    fn test_inbound_authentication() {
        let (mut mgr, mut outbox, _) = manager(Config::default());
        let peer = addr("beta.onion");
        let conn = ConnectionId(2);

        mgr.peer_connected(conn, None, Link::Inbound);
        mgr.received_auth_request(
            conn,
            wire::AuthRequest {
                sender: peer.clone(),
                nonce: 5,
            },
        );
        assert!(mgr.is_handshaking(&peer));
        assert_eq!(
            mgr.connection(conn).unwrap().kind,
            ConnectionKind::AuthRequest
        );

        let outputs = drain(&mut outbox);
        let nonce = response_nonce(&outputs).expect("an authentication response is sent");

        let progress =
            mgr.received_auth_ack(conn, wire::AuthAck { response_nonce: nonce });
        assert_eq!(progress, Some(HandshakeProgress::Authenticated(peer.clone())));

        assert!(mgr.is_authenticated(&peer));
        assert!(!mgr.is_handshaking(&peer));
        assert_eq!(mgr.connection(conn).unwrap().kind, ConnectionKind::Passive);
        assert_eq!(mgr.connection(conn).unwrap().addr.as_ref(), Some(&peer));
    }

    #[test]
    fn test_duplicate_attempts_are_suppressed() {
        let (mut mgr, mut outbox, _) = manager(Config::default());
        let peer = addr("gamma.onion");

        assert!(mgr.authenticate(peer.clone()));
        assert!(!mgr.authenticate(peer.clone()));

        // An inbound request for the same address is dropped too.
        mgr.peer_connected(ConnectionId(9), None, Link::Inbound);
        drain(&mut outbox);
        mgr.received_auth_request(
            ConnectionId(9),
            wire::AuthRequest {
                sender: peer.clone(),
                nonce: 1,
            },
        );
        let outputs = drain(&mut outbox);
        assert!(!outputs
            .iter()
            .any(|io| matches!(io, Io::Write(_, Message::AuthResponse(_)))));
        assert_eq!(mgr.handshake_count(), 1);
    }

    #[test]
    fn test_own_address_is_rejected() {
        let (mut mgr, mut outbox, _) = manager(Config::default());

        assert!(!mgr.authenticate(addr("self.onion")));

        mgr.peer_connected(ConnectionId(4), None, Link::Inbound);
        drain(&mut outbox);
        mgr.received_auth_request(
            ConnectionId(4),
            wire::AuthRequest {
                sender: addr("self.onion"),
                nonce: 8,
            },
        );
        let outputs = drain(&mut outbox);
        assert!(outputs.iter().any(|io| matches!(
            io,
            Io::Disconnect(_, DisconnectReason::SelfConnection)
        )));
    }

    #[test]
    fn test_address_mismatch_fails_the_exchange() {
        let (mut mgr, mut outbox, _) = manager(Config::default());
        let peer = addr("delta.onion");
        let conn = ConnectionId(5);

        assert!(mgr.authenticate(peer.clone()));
        mgr.peer_connected(conn, Some(&peer), Link::Outbound);
        let outputs = drain(&mut outbox);
        let nonce = request_nonce(&outputs).unwrap();

        let progress = mgr.received_auth_response(
            conn,
            wire::AuthResponse {
                sender: addr("imposter.onion"),
                request_nonce: nonce,
                response_nonce: 3,
            },
        );
        assert_eq!(progress, Some(HandshakeProgress::Failed(peer.clone())));
        assert!(!mgr.is_authenticated(&peer));
        assert!(!mgr.is_handshaking(&peer));

        let outputs = drain(&mut outbox);
        assert!(outputs.iter().any(|io| matches!(
            io,
            Io::Disconnect(c, DisconnectReason::PeerMisbehaving(_)) if *c == conn
        )));
    }

    #[test]
    fn test_authenticated_and_handshaking_stay_disjoint() {
        let (mut mgr, mut outbox, _) = manager(Config::default());
        let peer = addr("epsilon.onion");
        let conn = ConnectionId(6);

        authenticate_outbound(&mut mgr, &mut outbox, &peer, conn);
        assert!(mgr.is_authenticated(&peer));

        // Removing the peer returns the table to its prior membership.
        let departed = mgr.peer_disconnected(conn).unwrap();
        assert!(departed.authenticated);
        assert!(!mgr.is_authenticated(&peer));
        assert!(!mgr.is_handshaking(&peer));
    }

    #[test]
    fn test_tiered_eviction_picks_the_oldest() {
        let config = Config {
            max_connections_low: 2,
            max_connections_normal: 3,
            max_connections_high: 4,
            ..Config::default()
        };
        let (mut mgr, mut outbox, mut clock) = manager(config);

        // Five direct peers; none passive, none active.
        for i in 0..5 {
            clock.set(LocalTime::from_secs(100_000 + i));

            let peer = addr(&format!("peer{}.onion", i));
            assert!(mgr.authenticate_direct(peer.clone()));
            mgr.peer_connected(ConnectionId(i), Some(&peer), Link::Outbound);

            let outputs = drain(&mut outbox);
            let nonce = request_nonce(&outputs).unwrap();
            mgr.received_auth_response(
                ConnectionId(i),
                wire::AuthResponse {
                    sender: peer.clone(),
                    request_nonce: nonce,
                    response_nonce: 1,
                },
            );
        }
        assert_eq!(mgr.authenticated_count(), 5);
        for i in 0..5 {
            assert_eq!(
                mgr.connection(ConnectionId(i)).unwrap().kind,
                ConnectionKind::DirectPeer
            );
        }

        // Count exceeds the high cap; the full authenticated set is fair
        // game and the oldest connection goes. Exactly one per iteration.
        let outputs = drain(&mut outbox);
        let evictions: Vec<_> = outputs
            .iter()
            .filter_map(|io| match io {
                Io::Disconnect(c, DisconnectReason::ConnectionLimit) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(evictions, vec![ConnectionId(0)]);

        // Once the transport confirms, a re-check is scheduled.
        mgr.peer_disconnected(ConnectionId(0));
        let outputs = drain(&mut outbox);
        let timer = outputs.iter().find_map(|io| match io {
            Io::SetTimer(d) => Some(*d),
            _ => None,
        });
        let timer = timer.expect("a capacity re-check is scheduled");
        assert!(timer >= LocalDuration::from_millis(100) && timer <= LocalDuration::from_millis(500));

        // At four peers and none passive or active, no tier matches.
        clock.set(LocalTime::from_secs(100_600));
        mgr.received_wake();
        let outputs = drain(&mut outbox);
        assert!(!outputs
            .iter()
            .any(|io| matches!(io, Io::Disconnect(_, DisconnectReason::ConnectionLimit))));
        assert_eq!(mgr.authenticated_count(), 4);
    }

    #[test]
    fn test_passive_connections_are_evicted_first() {
        let config = Config {
            max_connections_low: 1,
            max_connections_normal: 8,
            max_connections_high: 12,
            ..Config::default()
        };
        let (mut mgr, mut outbox, mut clock) = manager(config);

        // One active (outbound) peer, authenticated first: oldest activity.
        let active = addr("active.onion");
        authenticate_outbound(&mut mgr, &mut outbox, &active, ConnectionId(10));

        // One passive (inbound) peer.
        clock.set(LocalTime::from_secs(100_010));
        let passive = addr("passive.onion");
        mgr.peer_connected(ConnectionId(11), None, Link::Inbound);
        mgr.received_auth_request(
            ConnectionId(11),
            wire::AuthRequest {
                sender: passive.clone(),
                nonce: 2,
            },
        );
        let outputs = drain(&mut outbox);
        let nonce = response_nonce(&outputs).unwrap();
        mgr.received_auth_ack(ConnectionId(11), wire::AuthAck { response_nonce: nonce });

        // The passive peer is newer, but passive is the first tier.
        let outputs = drain(&mut outbox);
        let evictions: Vec<_> = outputs
            .iter()
            .filter_map(|io| match io {
                Io::Disconnect(c, DisconnectReason::ConnectionLimit) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(evictions, vec![ConnectionId(11)]);
    }

    #[test]
    fn test_dial_failure_clears_the_exchange() {
        let (mut mgr, _outbox, _) = manager(Config::default());
        let peer = addr("zeta.onion");

        assert!(mgr.authenticate(peer.clone()));
        assert!(mgr.dial_failed(
            &peer,
            Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
        ));
        assert!(!mgr.is_handshaking(&peer));

        // A second report is a no-op.
        assert!(!mgr.dial_failed(
            &peer,
            Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
        ));
    }
}
