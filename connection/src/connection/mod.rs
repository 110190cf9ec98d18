//! A handshaken session with one bitcoin peer.
//!
//! [`Connection`] pairs a framed reader and writer with what the handshake
//! learned about the peer. It is generic over the byte stream so the same
//! code runs on TCP halves in production and in-memory pipes in tests.
//!
//! # Example
//!
//! ```no_run
//! use bitcoin::Network;
//! use bitcoin::p2p::message::NetworkMessage;
//! use nodescan_connection::{ConnectionConfiguration, PeerProtocolVersion, TcpConnection};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfiguration::non_listening(PeerProtocolVersion::Known(70016), None);
//! let mut connection =
//!     TcpConnection::connect("127.0.0.1:8333".parse()?, Network::Bitcoin, config).await?;
//!
//! println!("Connected to {}", connection.peer());
//! connection.send(NetworkMessage::Ping(7)).await?;
//! let response = connection.receive().await?;
//! println!("Received {}", response.cmd());
//! # Ok(())
//! # }
//! ```

mod configuration;
mod error;
mod handshake;
mod tcp;

pub use configuration::{
    default_user_agent, ConnectionConfiguration, DEFAULT_CONNECTION_TIMEOUT, NON_LISTENING_ADDRESS,
};
pub use error::ConnectionError;
pub use handshake::generate_nonce;
pub use tcp::TcpConnection;

use crate::peer::Peer;
use crate::transport::{TransportReader, TransportWriter};
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::Network;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connection to a bitcoin peer.
#[derive(Debug)]
pub struct Connection<R, W> {
    configuration: ConnectionConfiguration,
    peer: Peer,
    reader: TransportReader<R>,
    writer: TransportWriter<W>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a byte stream to `peer`. No bytes are exchanged until
    /// [`handshake`](Self::handshake) runs.
    pub fn new(
        peer: Peer,
        network: Network,
        configuration: ConnectionConfiguration,
        reader: R,
        writer: W,
    ) -> Self {
        let magic = network.magic();
        Self {
            configuration,
            peer,
            reader: TransportReader::new(magic, reader),
            writer: TransportWriter::new(magic, writer),
        }
    }

    /// The peer, including anything learned during the handshake.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn configuration(&self) -> &ConnectionConfiguration {
        &self.configuration
    }

    /// Send a message to the peer.
    pub async fn send(&mut self, message: NetworkMessage) -> Result<(), ConnectionError> {
        Ok(self.writer.write(message).await?)
    }

    /// Receive the next message from the peer.
    ///
    /// Cancellation safe, so it can sit in a `tokio::select!` branch.
    pub async fn receive(&mut self) -> Result<NetworkMessage, ConnectionError> {
        Ok(self.reader.read().await?)
    }
}

impl<R, W> fmt::Display for Connection<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection to {}", self.peer)
    }
}
