use std::time;

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;

use crate::client::error::Error;
use crate::client::handle;
use crate::client::peer::Cache;
use crate::common::addr::OverlayAddr;
use crate::common::time::RefClock;
use crate::fsm::handler;
use crate::fsm::handler::{Command, Limits, Peer};
use crate::net::{LocalTime, NetReactor, NetWaker};

/// P2P client configuration.
#[derive(Debug, Clone)]
pub struct P2PConfig {
    /// Seed addresses to bootstrap from.
    pub seeds: Vec<OverlayAddr>,
    /// Configured limits (connection caps, reported-peer caps).
    pub limits: Limits,
}

impl P2PConfig {
    /// Create a new configuration with the given seeds.
    pub fn new(seeds: Vec<OverlayAddr>, limits: Limits) -> Self {
        Self { seeds, limits }
    }
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            limits: Limits::default(),
        }
    }
}

/// Runs a pre-loaded client.
pub struct P2PClient<R: NetReactor> {
    handle: Handle<R::Waker>,
    service: handler::StateMachine<Cache, RefClock<LocalTime>>,
    commands: chan::Receiver<Command>,
    reactor: R,
}

impl<R: NetReactor> P2PClient<R> {
    /// Create a new client.
    pub fn new(config: P2PConfig) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();
        let (listening_send, listening) = chan::bounded(1);
        let reactor = <R as NetReactor>::new(listening_send)?;

        let clock = RefClock::from(LocalTime::now());
        let rng = fastrand::Rng::new();

        let service = handler::StateMachine::new(
            Cache::new(),
            clock,
            rng,
            handler::Config {
                seeds: config.seeds,
                limits: config.limits,

                ..handler::Config::default()
            },
        );

        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            timeout: time::Duration::from_secs(60),
            listening,
        };

        Ok(P2PClient {
            handle,
            service,
            commands: commands_rx,
            reactor,
        })
    }

    /// Run a pre-loaded p2p client.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let result = self
            .reactor
            .run(self.service, self.commands, cancellation)
            .await;

        if let Err(e) = result {
            tracing::error!("P2P is down. P2P client run error: {}", e);
        }
    }

    /// Create a new handle to communicate with the client.
    pub fn handle(&self) -> Handle<R::Waker> {
        self.handle.clone()
    }
}

/// Handle into a running client.
#[derive(Clone)]
pub struct Handle<W: NetWaker> {
    pub commands: chan::Sender<Command>,
    pub waker: W,
    pub timeout: time::Duration,
    pub listening: chan::Receiver<OverlayAddr>,
}

impl<W: NetWaker> Handle<W> {
    /// Send a command to the command channel, and wake up the event loop.
    async fn _command(&self, cmd: Command) -> Result<(), handle::Error> {
        if self.commands.send_async(cmd).await.is_err() {
            return Err(handle::Error::Command);
        }
        self.waker.wake()?;

        Ok(())
    }
}

#[async_trait]
impl<W: NetWaker> handle::Handle for Handle<W> {
    async fn command(&self, cmd: Command) -> Result<(), handle::Error> {
        self._command(cmd).await
    }

    async fn broadcast(
        &self,
        payload: Vec<u8>,
        exclude: Option<OverlayAddr>,
    ) -> Result<Vec<OverlayAddr>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Broadcast(payload, exclude, transmit))
            .await?;

        match receive.recv_async().await {
            Ok(addrs) => Ok(addrs),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn connect_direct(&self, addr: OverlayAddr) -> Result<OverlayAddr, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::ConnectDirect(addr, transmit)).await?;

        match receive.recv_async().await {
            Ok(result) => Ok(result?),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn peers(&self) -> Result<Vec<Peer>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetPeers(transmit)).await?;

        match receive.recv_async().await {
            Ok(peers) => Ok(peers),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn remove_seed(&self, addr: OverlayAddr) -> Result<(), handle::Error> {
        self.command(Command::RemoveSeed(addr)).await
    }

    async fn shut_down(&self) -> Result<(), handle::Error> {
        self.command(Command::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::handle::Handle as _;
    use crate::net::{Service, StateMachine};
    use std::io;

    #[derive(Clone)]
    struct TestWaker;

    impl NetWaker for TestWaker {
        fn wake(&self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Reactor stub: runs the service on commands alone, with no sockets.
    struct TestReactor;

    #[async_trait]
    impl NetReactor for TestReactor {
        type Waker = TestWaker;

        fn new(_listening: chan::Sender<OverlayAddr>) -> Result<Self, io::Error> {
            Ok(Self)
        }

        async fn run<S>(
            &mut self,
            mut service: S,
            commands: chan::Receiver<S::Command>,
            cancellation: CancellationToken,
        ) -> Result<(), io::Error>
        where
            S: Service + Send + Sync,
            S::DisconnectReason: Send + Sync,
        {
            service.initialize(LocalTime::now());

            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return Ok(()),
                    cmd = commands.recv_async() => match cmd {
                        Ok(cmd) => {
                            service.command_received(cmd);
                            while service.next().is_some() {}
                        }
                        Err(_) => return Ok(()),
                    }
                }
            }
        }

        fn waker(&self) -> TestWaker {
            TestWaker
        }
    }

    #[tokio::test]
    async fn test_facade_round_trip() {
        let client: P2PClient<TestReactor> = P2PClient::new(P2PConfig::default()).unwrap();
        let handle = client.handle();
        let cancellation = CancellationToken::new();
        let task = tokio::spawn(client.run(cancellation.clone()));

        // No peers yet: a broadcast goes nowhere, silently.
        let sent = handle.broadcast(b"hello".to_vec(), None).await.unwrap();
        assert!(sent.is_empty());

        let peers = handle.peers().await.unwrap();
        assert!(peers.is_empty());

        handle.shut_down().await.unwrap();

        cancellation.cancel();
        task.await.unwrap();
    }
}
