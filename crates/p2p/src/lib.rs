//! Peer-group overlay core of the Bourse trading network.
//!
//! Maintains a live mesh of mutually-authenticated peer connections on top of
//! an anonymizing transport whose addresses are opaque strings: bootstraps
//! from seed addresses, discovers further peers through gossip, authenticates
//! each peer with a nonce round-trip, bounds the number of connections with
//! tiered eviction, probes liveness, and fans application payloads out to the
//! peer group.
//!
//! The core is a deterministic, single-threaded state machine
//! ([`fsm::handler::StateMachine`]): the transport feeds it events through the
//! [`net::StateMachine`] trait and drains [`net::Io`] instructions back out.
//! Socket I/O, session encryption and message encoding live outside this
//! crate, behind the traits in [`net`].

pub mod client;
pub mod common;
pub mod fsm;
pub mod net;
pub mod wire;

pub use common::addr::OverlayAddr;
