//! Overlay protocol state machine.
//!
//! Composes the managers, routes inbound messages between them, and carries
//! the user-facing commands onto the protocol thread.
use std::collections::HashMap;
use std::fmt;

use flume as chan;
use thiserror::Error;
use tracing::debug;

use crate::common::addr::OverlayAddr;
use crate::common::peer::{self, AddressSource, Source};
use crate::common::time::AdjustableClock;
use crate::fsm::addrmgr::AddressManager;
use crate::fsm::bootmgr::BootstrapManager;
use crate::fsm::event::Event;
use crate::fsm::output::{Disconnect as _, Outbox};
use crate::fsm::peermgr::{ConnectionKind, Departed, HandshakeProgress, PeerManager};
use crate::fsm::pingmgr::PingManager;
use crate::fsm::{addrmgr, bootmgr, output, peermgr, pingmgr};
use crate::net::{ConnectionId, Disconnect, Link, LocalDuration, LocalTime};
use crate::wire::{self, Message};

/// Configured limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Authenticated connections we aim for; eviction of passive connections
    /// starts above this, and bootstrap stops here.
    pub max_connections_low: usize,
    /// Above this, active connections are evicted too.
    pub max_connections_normal: usize,
    /// Above this, any authenticated connection may be evicted.
    pub max_connections_high: usize,
    /// Cap on the reported-peer set.
    pub max_reported_peers: usize,
    /// Received address lists above this size are misbehavior.
    pub max_reported_batch: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_connections_low: peermgr::MAX_CONNECTIONS_LOW,
            max_connections_normal: peermgr::MAX_CONNECTIONS_NORMAL,
            max_connections_high: peermgr::MAX_CONNECTIONS_HIGH,
            max_reported_peers: addrmgr::MAX_REPORTED_PEERS,
            max_reported_batch: addrmgr::MAX_REPORTED_BATCH,
        }
    }
}

/// Disconnect reason.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Peer is misbehaving.
    PeerMisbehaving(&'static str),
    /// Connection to self was detected.
    SelfConnection,
    /// The connection was evicted to get back under the caps.
    ConnectionLimit,
    /// Peer was forced to disconnect by external command.
    Command,
    /// Peer was disconnected for another reason.
    Other(&'static str),
}

impl From<DisconnectReason> for Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::ConnectionLimit => write!(f, "connection limit reached"),
            Self::Command => write!(f, "received external command"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// Failure reported to direct-authentication callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthenticationError {
    /// The exchange with the peer failed.
    #[error("handshake with peer failed")]
    HandshakeFailed,
    /// The node is shutting down.
    #[error("node is shutting down")]
    ShuttingDown,
}

/// A remote peer, as seen by clients.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address.
    pub addr: OverlayAddr,
    /// The connection the peer is bound to.
    pub conn: ConnectionId,
    /// Mesh participation class.
    pub kind: ConnectionKind,
    /// Connected since this time.
    pub since: LocalTime,
}

impl From<(&peermgr::Peer, &peermgr::Connection)> for Peer {
    fn from((peer, conn): (&peermgr::Peer, &peermgr::Connection)) -> Self {
        Self {
            addr: peer.addr.clone(),
            conn: conn.id,
            kind: conn.kind,
            since: conn.since,
        }
    }
}

/// A command or request that can be sent to the protocol.
#[derive(Clone)]
pub enum Command {
    /// Send a payload to every authenticated peer, minus the originator.
    Broadcast(Vec<u8>, Option<OverlayAddr>, chan::Sender<Vec<OverlayAddr>>),
    /// One-shot authentication for direct messaging. The reply fires exactly
    /// once.
    ConnectDirect(OverlayAddr, chan::Sender<Result<OverlayAddr, AuthenticationError>>),
    /// Get authenticated peers.
    GetPeers(chan::Sender<Vec<Peer>>),
    /// Import addresses into the reported set.
    ImportAddresses(Vec<OverlayAddr>),
    /// Remove an address from the seed set.
    RemoveSeed(OverlayAddr),
    /// Shut the protocol down. Idempotent.
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast(payload, exclude, _) => {
                write!(f, "Broadcast({} bytes, exclude {:?})", payload.len(), exclude)
            }
            Self::ConnectDirect(addr, _) => write!(f, "ConnectDirect({})", addr),
            Self::GetPeers(_) => write!(f, "GetPeers"),
            Self::ImportAddresses(addrs) => write!(f, "ImportAddresses({:?})", addrs),
            Self::RemoveSeed(addr) => write!(f, "RemoveSeed({})", addr),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seed addresses to bootstrap from.
    pub seeds: Vec<OverlayAddr>,
    /// Configured limits.
    pub limits: Limits,
    /// How long a connection may be quiet before it is probed.
    pub ping_idle: LocalDuration,
    /// Liveness tick interval bounds.
    pub liveness_interval: (LocalDuration, LocalDuration),
    /// Peer-exchange interval bounds.
    pub exchange_interval: (LocalDuration, LocalDuration),
    /// Bootstrap back-off bounds.
    pub retry_delay: (LocalDuration, LocalDuration),
    /// Capacity re-check delay bounds.
    pub capacity_recheck: (LocalDuration, LocalDuration),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            limits: Limits::default(),
            ping_idle: pingmgr::PING_IDLE,
            liveness_interval: (pingmgr::LIVENESS_INTERVAL_MIN, pingmgr::LIVENESS_INTERVAL_MAX),
            exchange_interval: (addrmgr::EXCHANGE_INTERVAL_MIN, addrmgr::EXCHANGE_INTERVAL_MAX),
            retry_delay: (bootmgr::RETRY_DELAY_MIN, bootmgr::RETRY_DELAY_MAX),
            capacity_recheck: (peermgr::CAPACITY_RECHECK_MIN, peermgr::CAPACITY_RECHECK_MAX),
        }
    }
}

/// An instance of the overlay protocol.
pub struct StateMachine<P, C> {
    /// Reported-address manager.
    pub addrmgr: AddressManager<P, Outbox, C>,
    /// Peer manager.
    pub peermgr: PeerManager<Outbox, C>,
    /// Liveness manager.
    pub pingmgr: PingManager<Outbox, C>,
    /// Bootstrap manager.
    pub bootmgr: BootstrapManager<Outbox, C>,
    /// Direct-authentication callers waiting for an exchange to finish.
    direct_pending: HashMap<OverlayAddr, Vec<chan::Sender<Result<OverlayAddr, AuthenticationError>>>>,
    /// Our own overlay address, once published.
    local: Option<OverlayAddr>,
    /// Shutdown latch. Once set, timers and completions are no-ops.
    shutdown: bool,
    /// Clock shared with all managers.
    pub clock: C,
    /// Outbound I/O. Used to communicate protocol events with a reactor.
    pub outbox: Outbox,
}

impl<P, C> Iterator for StateMachine<P, C> {
    type Item = output::Io;

    fn next(&mut self) -> Option<output::Io> {
        self.outbox.next()
    }
}

impl<P: peer::Store, C: AdjustableClock> StateMachine<P, C> {
    /// Construct a new protocol instance.
    pub fn new(peers: P, clock: C, rng: fastrand::Rng, config: Config) -> Self {
        let Config {
            seeds,
            limits,
            ping_idle,
            liveness_interval,
            exchange_interval,
            retry_delay,
            capacity_recheck,
        } = config;

        let outbox = Outbox::new();
        let peermgr = PeerManager::new(
            peermgr::Config {
                max_connections_low: limits.max_connections_low,
                max_connections_normal: limits.max_connections_normal,
                max_connections_high: limits.max_connections_high,
                capacity_recheck,
            },
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let addrmgr = AddressManager::new(
            addrmgr::Config {
                max_reported_peers: limits.max_reported_peers,
                max_reported_batch: limits.max_reported_batch,
                exchange_interval,
            },
            rng.clone(),
            peers,
            outbox.clone(),
            clock.clone(),
        );
        let pingmgr = PingManager::new(
            pingmgr::Config {
                interval: liveness_interval,
                idle: ping_idle,
            },
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let bootmgr = BootstrapManager::new(
            seeds,
            limits.max_connections_low,
            retry_delay,
            rng,
            outbox.clone(),
            clock.clone(),
        );

        Self {
            addrmgr,
            peermgr,
            pingmgr,
            bootmgr,
            direct_pending: HashMap::new(),
            local: None,
            shutdown: false,
            clock,
            outbox,
        }
    }

    /// Process a user command.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        if self.shutdown {
            match cmd {
                Command::Broadcast(_, _, reply) => {
                    reply.send(Vec::new()).ok();
                }
                Command::ConnectDirect(_, reply) => {
                    reply.send(Err(AuthenticationError::ShuttingDown)).ok();
                }
                Command::GetPeers(reply) => {
                    reply.send(Vec::new()).ok();
                }
                _ => {}
            }
            return;
        }
        match cmd {
            Command::Broadcast(payload, exclude, reply) => {
                let sent = self.broadcast(payload, exclude.as_ref());
                reply.send(sent).ok();
            }
            Command::ConnectDirect(addr, reply) => {
                if self.peermgr.is_authenticated(&addr) {
                    reply.send(Ok(addr)).ok();
                } else {
                    let handshaking = self.peermgr.is_handshaking(&addr);

                    self.direct_pending.entry(addr.clone()).or_default().push(reply);

                    if !handshaking && !self.peermgr.authenticate_direct(addr.clone()) {
                        // Unattemptable, eg. our own address.
                        if let Some(waiters) = self.direct_pending.remove(&addr) {
                            for waiter in waiters {
                                waiter.send(Err(AuthenticationError::HandshakeFailed)).ok();
                            }
                        }
                    }
                }
            }
            Command::GetPeers(reply) => {
                let peers = self.peermgr.authenticated().map(Peer::from).collect();
                reply.send(peers).ok();
            }
            Command::ImportAddresses(addrs) => {
                let authenticated = self.peermgr.authenticated_addresses();

                peer::AddressSource::insert(
                    &mut self.addrmgr,
                    addrs.into_iter().filter(|a| !authenticated.contains(a)),
                    Source::Imported,
                );
            }
            Command::RemoveSeed(addr) => {
                self.bootmgr.remove_seed(&addr);
            }
            Command::Shutdown => {
                self.shut_down();
            }
        }
    }

    /// Shut the protocol down. Idempotent; pending timers and completions
    /// become no-ops.
    pub fn shut_down(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        self.outbox.event(Event::ShuttingDown);
    }

    /// Send a payload to every authenticated peer whose address differs from
    /// the originator. Dropped silently when there are no peers.
    fn broadcast(&mut self, payload: Vec<u8>, exclude: Option<&OverlayAddr>) -> Vec<OverlayAddr> {
        let peers = self.peermgr.authenticated_conns();

        if peers.is_empty() {
            debug!(target: "p2p", "No authenticated peers, dropping broadcast");
            return Vec::new();
        }
        let mut sent = Vec::new();

        for (addr, conn) in peers {
            if Some(&addr) == exclude {
                continue;
            }
            self.outbox.message(
                conn,
                Message::Broadcast(wire::Broadcast {
                    payload: payload.clone(),
                }),
            );
            sent.push(addr);
        }
        sent
    }

    /// An exchange completed: wire the peer into the other managers and
    /// advance the bootstrap cascade.
    fn peer_authenticated(&mut self, addr: OverlayAddr) {
        self.addrmgr.peer_authenticated(&addr);

        if let Some(peer) = self.peermgr.peer(&addr) {
            let conn = peer.conn;
            self.pingmgr.peer_negotiated(addr.clone(), conn);
        }
        if let Some(waiters) = self.direct_pending.remove(&addr) {
            for waiter in waiters {
                waiter.send(Ok(addr.clone())).ok();
            }
        }
        let count = self.peermgr.authenticated_count();
        let exclude = self.peermgr.addresses_in_use();
        let next = self
            .bootmgr
            .handshake_succeeded(&addr, count, &exclude, &mut self.addrmgr);

        self.bootstrap_attempt(next);
    }

    /// An exchange failed: resolve direct waiters and advance the bootstrap
    /// cascade.
    fn handshake_failed(&mut self, addr: OverlayAddr) {
        if let Some(waiters) = self.direct_pending.remove(&addr) {
            for waiter in waiters {
                waiter.send(Err(AuthenticationError::HandshakeFailed)).ok();
            }
        }
        let exclude = self.peermgr.addresses_in_use();
        let next = self.bootmgr.handshake_failed(&addr, &exclude, &mut self.addrmgr);

        self.bootstrap_attempt(next);
    }

    /// Keep attempting bootstrap candidates until one is actually dialed.
    /// The cascade's candidate sets are finite, so this terminates.
    fn bootstrap_attempt(&mut self, mut next: Option<OverlayAddr>) {
        while let Some(addr) = next {
            if self.peermgr.authenticate(addr.clone()) {
                break;
            }
            let exclude = self.peermgr.addresses_in_use();
            next = self.bootmgr.handshake_failed(&addr, &exclude, &mut self.addrmgr);
        }
    }
}

impl<P: peer::Store, C: AdjustableClock> crate::net::StateMachine for StateMachine<P, C> {
    type Message = Message;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);
        self.addrmgr.initialize();
        self.pingmgr.initialize();
        self.outbox.event(Event::Ready { time });
    }

    fn address_published(&mut self, addr: OverlayAddr) {
        if self.shutdown {
            return;
        }
        debug!(target: "p2p", "Local address published: {}", addr);

        self.local = Some(addr.clone());
        self.peermgr.set_local_address(addr.clone());
        self.addrmgr.record_local_address(addr);

        let exclude = self.peermgr.addresses_in_use();
        let next = self.bootmgr.start(&exclude, &mut self.addrmgr);

        self.bootstrap_attempt(next);
    }

    fn message_received(&mut self, conn: ConnectionId, message: Message) {
        if self.shutdown {
            return;
        }
        debug!(target: "p2p", "Received {:?} on {}", message, conn);

        self.peermgr.record_activity(conn);

        match message {
            Message::AuthRequest(msg) => {
                self.peermgr.received_auth_request(conn, msg);
            }
            Message::AuthResponse(msg) => {
                match self.peermgr.received_auth_response(conn, msg) {
                    Some(HandshakeProgress::Authenticated(addr)) => self.peer_authenticated(addr),
                    Some(HandshakeProgress::Failed(addr)) => self.handshake_failed(addr),
                    None => {}
                }
            }
            Message::AuthAck(msg) => match self.peermgr.received_auth_ack(conn, msg) {
                Some(HandshakeProgress::Authenticated(addr)) => self.peer_authenticated(addr),
                Some(HandshakeProgress::Failed(addr)) => self.handshake_failed(addr),
                None => {}
            },
            Message::Ping(nonce) => {
                self.pingmgr.received_ping(conn, nonce);
            }
            Message::Pong(nonce) => {
                let Some(addr) = self
                    .peermgr
                    .connection(conn)
                    .filter(|c| c.authenticated)
                    .and_then(|c| c.addr.clone())
                else {
                    debug!(target: "p2p", "Pong on unauthenticated {}, dropping", conn);
                    return;
                };
                if !self.pingmgr.received_pong(&addr, nonce) {
                    self.outbox
                        .disconnect(conn, DisconnectReason::PeerMisbehaving("pong nonce mismatch"));
                }
            }
            Message::GetPeers(msg) => {
                let authenticated = self.peermgr.authenticated_addresses();
                self.addrmgr.received_get_peers(conn, msg, &authenticated);
            }
            Message::Peers(msg) => {
                let authenticated = self.peermgr.authenticated_addresses();
                self.addrmgr.received_peers(conn, msg, &authenticated);
            }
            Message::Broadcast(msg) => {
                let Some(addr) = self
                    .peermgr
                    .connection(conn)
                    .filter(|c| c.authenticated)
                    .and_then(|c| c.addr.clone())
                else {
                    debug!(target: "p2p", "Broadcast on unauthenticated {}, dropping", conn);
                    return;
                };
                self.outbox.event(Event::Broadcast {
                    from: addr,
                    payload: msg.payload,
                });
            }
        }
    }

    fn attempted(&mut self, addr: &OverlayAddr) {
        self.peermgr.peer_attempted(addr);
    }

    fn connected(&mut self, conn: ConnectionId, addr: Option<&OverlayAddr>, link: Link) {
        if self.shutdown {
            return;
        }
        self.peermgr.peer_connected(conn, addr, link);
    }

    fn dial_failed(&mut self, addr: &OverlayAddr, err: std::sync::Arc<std::io::Error>) {
        if self.shutdown {
            return;
        }
        if self.peermgr.dial_failed(addr, err) {
            self.handshake_failed(addr.clone());
        }
    }

    fn disconnected(&mut self, conn: ConnectionId, reason: Disconnect<DisconnectReason>) {
        if self.shutdown {
            return;
        }
        let Some(Departed {
            addr,
            authenticated,
            handshaking,
        }) = self.peermgr.peer_disconnected(conn)
        else {
            return;
        };

        self.addrmgr.peer_disconnected(&addr);
        self.pingmgr.peer_disconnected(&addr);

        if handshaking {
            self.handshake_failed(addr.clone());
        }
        if authenticated || handshaking {
            debug!(
                target: "p2p",
                "{}: disconnected ({}); peers = {}, reported = {}, handshakes = {}",
                addr,
                reason,
                self.peermgr.authenticated_count(),
                self.addrmgr.len(),
                self.peermgr.handshake_count(),
            );
        }
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);
    }

    fn timer_expired(&mut self) {
        if self.shutdown {
            return;
        }
        let now = self.clock.local_time();

        // The liveness tick doubles as the capacity check.
        if self.pingmgr.tick_due(now) {
            self.peermgr.enforce_limits();

            let idle = self.peermgr.idle_peers(self.pingmgr.config.idle, now);
            self.pingmgr.tick(&idle);
        }
        self.pingmgr.flush();

        let peers = self.peermgr.authenticated_conns();
        let authenticated = self.peermgr.authenticated_addresses();
        self.addrmgr.received_wake(&peers, &authenticated, self.local.as_ref());

        self.peermgr.received_wake();

        let exclude = self.peermgr.addresses_in_use();
        let next = self.bootmgr.received_wake(&exclude, &mut self.addrmgr);
        self.bootstrap_attempt(next);
    }
}

impl<P: peer::Store, C: AdjustableClock> crate::net::Service for StateMachine<P, C> {
    type Command = Command;

    fn command_received(&mut self, cmd: Self::Command) {
        self.command(cmd)
    }
}
