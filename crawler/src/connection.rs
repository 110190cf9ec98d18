//! Seams between the crawl engine and the network.
//!
//! [`PeerConnection`] is a handshaken session and [`Connector`] produces
//! them. Production code uses [`PeerConnector`] over TCP. Tests swap in the
//! mocks from `test_utils`.

use bitcoin::p2p::message::NetworkMessage;
use bitcoin::Network;
use nodescan_connection::{
    Connection, ConnectionConfiguration, ConnectionError, Endpoint, Peer, TcpConnection,
};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};

/// A session with a peer that has completed the handshake.
pub trait PeerConnection: Send {
    fn send(
        &mut self,
        message: NetworkMessage,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Must be cancellation safe.
    fn receive(&mut self) -> impl Future<Output = Result<NetworkMessage, ConnectionError>> + Send;

    /// The peer as described by its version message.
    fn peer(&self) -> Peer;
}

impl<R, W> PeerConnection for Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn send(
        &mut self,
        message: NetworkMessage,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        Connection::send(self, message)
    }

    fn receive(&mut self) -> impl Future<Output = Result<NetworkMessage, ConnectionError>> + Send {
        Connection::receive(self)
    }

    fn peer(&self) -> Peer {
        Connection::peer(self).clone()
    }
}

/// Factory for peer connections.
pub trait Connector: Clone + Send + Sync + 'static {
    type Connection: PeerConnection + 'static;

    /// Dial `endpoint` and complete the handshake.
    fn connect(
        &self,
        endpoint: Endpoint,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send;
}

/// Dials real peers over TCP.
#[derive(Debug, Clone)]
pub struct PeerConnector {
    network: Network,
    config: ConnectionConfiguration,
}

impl PeerConnector {
    pub fn new(network: Network, config: ConnectionConfiguration) -> Self {
        Self { network, config }
    }
}

impl Connector for PeerConnector {
    type Connection = TcpConnection;

    fn connect(
        &self,
        endpoint: Endpoint,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send {
        let network = self.network;
        let config = self.config.clone();
        async move { TcpConnection::connect(endpoint, network, config).await }
    }
}
