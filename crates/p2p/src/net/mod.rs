//! Peer-to-peer networking core types.
//!
//! The overlay core never touches a socket: it consumes events through the
//! [`StateMachine`] trait and answers with [`Io`] instructions, which the
//! transport drains after every call. Everything in this module is the
//! *contract* between the core and whatever transport hosts it.
#![allow(clippy::type_complexity)]

use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;

pub use time::{LocalDuration, LocalTime};

pub mod time;

use crate::common::addr::OverlayAddr;

/// Identifier of a transport connection.
///
/// Assigned by the transport and opaque to the core. The core never owns the
/// connection behind it; it may only request a shutdown via [`Io::Disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Link direction of the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Inbound conneciton.
    Inbound,
    /// Outbound connection.
    Outbound,
}

impl Link {
    /// Check whether the link is outbound.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Check whether the link is inbound.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Output of a state transition of the state machine.
#[derive(Debug)]
pub enum Io<M, E, D> {
    /// There is a message ready to be sent to a peer.
    Write(ConnectionId, M),
    /// Connect to a peer.
    Connect(OverlayAddr),
    /// Disconnect from a peer.
    Disconnect(ConnectionId, D),
    /// Ask for a wakeup in a specified amount of time.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(E),
}

/// Disconnection event which includes the reason.
#[derive(Debug, Clone)]
pub enum Disconnect<T> {
    /// Error with an underlying established connection. This is also how the
    /// transport surfaces send failures and stalled peers.
    ConnectionError(Arc<std::io::Error>),
    /// Peer was disconnected by the internal state-machine logic.
    StateMachine(T),
}

impl<T> Disconnect<T> {
    pub fn is_connection_err(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

impl<T: fmt::Display> fmt::Display for Disconnect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionError(err) => write!(f, "{}", err),
            Self::StateMachine(reason) => write!(f, "{}", reason),
        }
    }
}

/// A service state-machine to implement the overlay protocol's logic.
///
/// All methods are called from a single logical thread; the state machine is
/// the only owner of the peer tables and needs no internal locking. Transport
/// completions (connects, disconnects, inbound messages) are re-dispatched
/// onto that thread by the caller before any of these entry points run.
///
/// The state machine emits [`Io`] instructions to the transport via its
/// [`Iterator`] trait.
pub trait StateMachine:
    Iterator<Item = Io<Self::Message, Self::Event, Self::DisconnectReason>>
{
    /// Message type sent between peers.
    type Message: fmt::Debug;
    /// Events emitted by the state machine.
    /// These are forwarded by the transport to the user thread.
    type Event: fmt::Debug + Send;
    /// Reason a peer was disconnected, in case the peer was disconnected by
    /// the internal state-machine logic.
    type DisconnectReason: fmt::Debug
        + fmt::Display
        + Into<Disconnect<Self::DisconnectReason>>;

    /// Initialize the state machine. Called once before any event is sent to
    /// the state machine.
    fn initialize(&mut self, _time: LocalTime) {}
    /// The transport has published the local node's overlay address.
    ///
    /// May arrive well after [`StateMachine::initialize`]: hidden services
    /// take time to come up. Bootstrapping starts here.
    fn address_published(&mut self, addr: OverlayAddr);
    /// Called by the transport upon receiving a message from a remote peer.
    fn message_received(&mut self, conn: ConnectionId, message: Self::Message);
    /// Connection attempt underway.
    ///
    /// This is only encountered when an outgoing connection attempt is made,
    /// and is always called before [`StateMachine::connected`].
    fn attempted(&mut self, addr: &OverlayAddr);
    /// New connection with a peer.
    ///
    /// `addr` is the dialed address for outbound links, and `None` for
    /// inbound links: on an anonymizing overlay the remote address is unknown
    /// until the peer authenticates.
    fn connected(&mut self, conn: ConnectionId, addr: Option<&OverlayAddr>, link: Link);
    /// An outbound dial failed before a connection was established.
    fn dial_failed(&mut self, addr: &OverlayAddr, err: Arc<io::Error>);
    /// Called whenever a remote peer was disconnected, either because of a
    /// network-related event or due to a local instruction from this state
    /// machine, using [`Io::Disconnect`].
    fn disconnected(&mut self, conn: ConnectionId, reason: Disconnect<Self::DisconnectReason>);
    /// Called by the transport every time the event loop gets data from the
    /// network, or times out. Used to update the state machine's internal
    /// clock.
    fn tick(&mut self, local_time: LocalTime);
    /// A timer set with [`Io::SetTimer`] has expired.
    fn timer_expired(&mut self);
}

/// A network service.
///
/// Network protocols must implement this trait to be drivable by a reactor.
pub trait Service: StateMachine {
    /// Commands handled by the service. These commands should originate from
    /// an external "user" thread. They are passed through the reactor via a
    /// channel given to [`NetReactor::run`]. The reactor calls
    /// [`Service::command_received`] on the service for each command received.
    type Command: Send + Sync;

    /// An external command has been received.
    fn command_received(&mut self, cmd: Self::Command);
}

/// Used by reactors to wake the event loop, for example when a
/// [`Service::Command`] is ready to be processed by the service.
pub trait NetWaker: Send + Sync + Clone {
    /// Wake up! Call this after sending a command to make sure the command is
    /// processed in a timely fashion.
    fn wake(&self) -> io::Result<()>;
}

/// Any transport reactor that can drive the overlay core.
///
/// Implementations live outside this crate, next to the socket and session
/// plumbing of the underlying network.
#[async_trait]
pub trait NetReactor {
    /// The type of waker this reactor uses.
    type Waker: NetWaker;

    /// Create a new reactor, initializing it with a channel on which the
    /// local overlay address is published once the transport is ready.
    fn new(listening: chan::Sender<OverlayAddr>) -> Result<Self, io::Error>
    where
        Self: Sized;

    /// Run the given service with the reactor.
    ///
    /// Returns when cancelled or when the command channel closes; socket
    /// faults on individual connections are reported to the service as
    /// disconnects, not surfaced here.
    async fn run<S>(
        &mut self,
        service: S,
        commands: chan::Receiver<S::Command>,
        cancellation: CancellationToken,
    ) -> Result<(), io::Error>
    where
        S: Service + Send + Sync,
        S::DisconnectReason: Send + Sync;

    /// Return a new waker.
    ///
    /// The reactor can provide multiple wakers such that multiple user
    /// threads may wake the event loop.
    fn waker(&self) -> Self::Waker;
}
