//! Overlay wire messages.
//!
//! Only the message *shapes* live here. Encoding and decoding are the
//! transport's concern; the core hands these values to [`crate::net::Io::Write`]
//! and receives them from [`crate::net::StateMachine::message_received`].

use serde::{Deserialize, Serialize};

use crate::common::addr::OverlayAddr;

/// A message exchanged between overlay nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First message of an authentication exchange, sent by the requester.
    AuthRequest(AuthRequest),
    /// The responder's reply, echoing the requester's nonce.
    AuthResponse(AuthResponse),
    /// The requester's final word, echoing the responder's nonce.
    AuthAck(AuthAck),
    /// Liveness probe.
    Ping(u64),
    /// Answer to a liveness probe, echoing its nonce.
    Pong(u64),
    /// Ask a peer for the addresses it knows.
    GetPeers(GetPeers),
    /// Addresses a peer knows.
    Peers(Peers),
    /// Opaque application payload, fanned out to the peer group.
    Broadcast(Broadcast),
}

/// Opens an authentication exchange and claims a sender address. The nonce
/// must come back in the matching [`AuthResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// The requester's own overlay address.
    pub sender: OverlayAddr,
    /// Freshness challenge bound to this connection.
    pub nonce: u64,
}

/// Accepts an authentication request. Carries the responder's own challenge,
/// which must come back in the matching [`AuthAck`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// The responder's own overlay address.
    pub sender: OverlayAddr,
    /// Echo of the requester's challenge.
    pub request_nonce: u64,
    /// The responder's challenge.
    pub response_nonce: u64,
}

/// Completes an authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAck {
    /// Echo of the responder's challenge.
    pub response_nonce: u64,
}

/// Request for a peer's known addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPeers {
    /// The requester's own overlay address.
    pub sender: OverlayAddr,
    /// Addresses the requester already knows, offered in exchange.
    pub known: Vec<OverlayAddr>,
}

/// A peer's known addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peers {
    /// The addresses being shared.
    pub known: Vec<OverlayAddr>,
}

/// An opaque application payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    /// Application bytes. The core does not interpret them.
    pub payload: Vec<u8>,
}
