//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
//!
//! Each sub-protocol, eg. the "ping" or "handshake" protocols are given a copy
//! of this outbox with specific capabilities, eg. peer disconnection, message
//! sending etc. to communicate with the network.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::common::addr::OverlayAddr;
use crate::fsm::event::Event;
use crate::fsm::handler::DisconnectReason;
use crate::net::{ConnectionId, LocalDuration};
use crate::wire::{self, Message};

/// Output of a state transition of the protocol state machine.
pub type Io = crate::net::Io<Message, Event, DisconnectReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to connect to peers.
pub trait Connect {
    /// Connect to peer.
    fn connect(&self, addr: OverlayAddr);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Disconnect from peer.
    fn disconnect(&self, conn: ConnectionId, reason: DisconnectReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// Overlay wire protocol.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    // Handshake messages //////////////////////////////////////////////////////

    /// Send an authentication request, opening an exchange.
    fn auth_request(&mut self, conn: ConnectionId, sender: OverlayAddr, nonce: u64);

    /// Send an authentication response, echoing the requester's nonce.
    fn auth_response(
        &mut self,
        conn: ConnectionId,
        sender: OverlayAddr,
        request_nonce: u64,
        response_nonce: u64,
    );

    /// Send an authentication ack, echoing the responder's nonce.
    fn auth_ack(&mut self, conn: ConnectionId, response_nonce: u64);

    // Ping/pong ///////////////////////////////////////////////////////////////

    /// Send a ping message.
    fn ping(&mut self, conn: ConnectionId, nonce: u64) -> &Self;

    /// Send a pong message.
    fn pong(&mut self, conn: ConnectionId, nonce: u64) -> &Self;

    // Addresses //////////////////////////////////////////////////////////////

    /// Send a request for known peer addresses.
    fn get_peers(&mut self, conn: ConnectionId, sender: OverlayAddr, known: Vec<OverlayAddr>);

    /// Send known peer addresses.
    fn peers(&mut self, conn: ConnectionId, known: Vec<OverlayAddr>);
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    /// Output queue.
    pub outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.lock().unwrap().pop_front()
    }
}

impl Outbox {
    /// Create a new channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound.lock().unwrap().push_back(output);
    }

    /// Push a message to the channel.
    pub fn message(&mut self, conn: ConnectionId, payload: Message) -> &Self {
        debug!(target: "p2p", "Sending {:?} to {}", payload, conn);

        self.push(Io::Write(conn, payload));

        self
    }

    /// Push an event to the channel.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, conn: ConnectionId, reason: DisconnectReason) {
        debug!(target: "p2p", "Disconnecting {}: {}", conn, reason);

        self.push(Io::Disconnect(conn, reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: OverlayAddr) {
        self.push(Io::Connect(addr));
    }
}

impl<E: Into<Event> + std::fmt::Display> Wire<E> for Outbox {
    fn event(&self, event: E) {
        debug!(target: "p2p", "{}", &event);
        self.event(event.into());
    }

    fn auth_request(&mut self, conn: ConnectionId, sender: OverlayAddr, nonce: u64) {
        self.message(
            conn,
            Message::AuthRequest(wire::AuthRequest { sender, nonce }),
        );
    }

    fn auth_response(
        &mut self,
        conn: ConnectionId,
        sender: OverlayAddr,
        request_nonce: u64,
        response_nonce: u64,
    ) {
        self.message(
            conn,
            Message::AuthResponse(wire::AuthResponse {
                sender,
                request_nonce,
                response_nonce,
            }),
        );
    }

    fn auth_ack(&mut self, conn: ConnectionId, response_nonce: u64) {
        self.message(conn, Message::AuthAck(wire::AuthAck { response_nonce }));
    }

    fn ping(&mut self, conn: ConnectionId, nonce: u64) -> &Self {
        self.message(conn, Message::Ping(nonce));
        self
    }

    fn pong(&mut self, conn: ConnectionId, nonce: u64) -> &Self {
        self.message(conn, Message::Pong(nonce));
        self
    }

    fn get_peers(&mut self, conn: ConnectionId, sender: OverlayAddr, known: Vec<OverlayAddr>) {
        self.message(conn, Message::GetPeers(wire::GetPeers { sender, known }));
    }

    fn peers(&mut self, conn: ConnectionId, known: Vec<OverlayAddr>) {
        self.message(conn, Message::Peers(wire::Peers { known }));
    }
}
