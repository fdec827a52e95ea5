//! State machine events.
use crate::common::addr::OverlayAddr;
use crate::net::LocalTime;

use crate::fsm::{
    addrmgr::Event as AddressEvent, bootmgr::Event as BootstrapEvent,
    peermgr::Event as PeerEvent, pingmgr::Event as PingEvent,
};

/// A peer-to-peer event.
///
/// This stream is the extension point for embedding applications: every
/// variant may be ignored without affecting the protocol.
#[derive(Debug, Clone)]
pub enum Event {
    /// The node is initializing its state machine and about to start network
    /// activity.
    Initializing,
    /// The node is initialized and ready to receive commands.
    Ready {
        /// Local time.
        time: LocalTime,
    },
    /// The node is shutting down; no further timers or completions will run.
    ShuttingDown,
    /// An application payload was received from an authenticated peer.
    Broadcast {
        /// The authenticated sender.
        from: OverlayAddr,
        /// The opaque payload.
        payload: Vec<u8>,
    },
    /// An address manager event.
    Address(AddressEvent),
    /// A peer manager event.
    Peer(PeerEvent),
    /// A bootstrap event.
    Bootstrap(BootstrapEvent),
    /// A ping manager event.
    Ping(PingEvent),
}

impl From<PeerEvent> for Event {
    fn from(e: PeerEvent) -> Self {
        Self::Peer(e)
    }
}

impl From<AddressEvent> for Event {
    fn from(e: AddressEvent) -> Self {
        Self::Address(e)
    }
}

impl From<BootstrapEvent> for Event {
    fn from(e: BootstrapEvent) -> Self {
        Self::Bootstrap(e)
    }
}

impl From<PingEvent> for Event {
    fn from(e: PingEvent) -> Self {
        Self::Ping(e)
    }
}
