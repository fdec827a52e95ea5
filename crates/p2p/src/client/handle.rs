//! Node handles are created from nodes by users of the library, to communicate
//! with the underlying protocol instance.
use async_trait::async_trait;
use flume as chan;
use thiserror::Error;

use crate::common::addr::OverlayAddr;
use crate::fsm::handler::{AuthenticationError, Command, Peer};

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// The command returned an error.
    #[error("command failed")]
    Command,
    /// The operation timed out.
    #[error("the operation timed out")]
    Timeout,
    /// A direct authentication failed.
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    /// An I/O error occured.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with a node process.
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Send a command to the client.
    async fn command(&self, cmd: Command) -> Result<(), Error>;

    /// Send a payload to every authenticated peer, except `exclude`. Returns
    /// the addresses the payload went out to; empty when there are no peers.
    async fn broadcast(
        &self,
        payload: Vec<u8>,
        exclude: Option<OverlayAddr>,
    ) -> Result<Vec<OverlayAddr>, Error>;

    /// Authenticate to a peer for direct messaging. Resolves exactly once,
    /// with the peer's address on success.
    async fn connect_direct(&self, addr: OverlayAddr) -> Result<OverlayAddr, Error>;

    /// Get the currently authenticated peers.
    async fn peers(&self) -> Result<Vec<Peer>, Error>;

    /// Remove an address from the seed set. Used when this node is itself a
    /// seed.
    async fn remove_seed(&self, addr: OverlayAddr) -> Result<(), Error>;

    /// Shut the node down. Idempotent.
    async fn shut_down(&self) -> Result<(), Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn command(&self, cmd: Command) -> Result<(), Error>;
        async fn broadcast(
            &self,
            payload: Vec<u8>,
            exclude: Option<OverlayAddr>,
        ) -> Result<Vec<OverlayAddr>, Error>;
        async fn connect_direct(&self, addr: OverlayAddr) -> Result<OverlayAddr, Error>;
        async fn peers(&self) -> Result<Vec<Peer>, Error>;
        async fn remove_seed(&self, addr: OverlayAddr) -> Result<(), Error>;
        async fn shut_down(&self) -> Result<(), Error>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mock() {
        let mut _mock = MockHandle::new();
    }
}
