//! TCP-specific connections.

use super::{Connection, ConnectionConfiguration, ConnectionError};
use crate::peer::{Endpoint, Peer};
use bitcoin::Network;
use log::debug;
use std::io;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A connection over tokio's TCP stream halves.
pub type TcpConnection = Connection<OwnedReadHalf, OwnedWriteHalf>;

async fn dial(endpoint: Endpoint, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    match tokio::time::timeout(timeout, TcpStream::connect(endpoint.socket_addr())).await {
        Ok(Ok(stream)) => {
            // Bitcoin messages are small, don't let Nagle hold them back.
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(ConnectionError::Io(e)),
        Err(_) => Err(ConnectionError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("Dialing {endpoint} timed out"),
        ))),
    }
}

impl TcpConnection {
    /// Dial `endpoint` and perform the handshake.
    pub async fn connect(
        endpoint: Endpoint,
        network: Network,
        configuration: ConnectionConfiguration,
    ) -> Result<Self, ConnectionError> {
        let stream = dial(endpoint, configuration.connection_timeout).await?;
        debug!("TCP connection to {endpoint} established");

        let (reader, writer) = stream.into_split();
        let mut connection =
            Connection::new(Peer::new(endpoint), network, configuration, reader, writer);
        connection.handshake().await?;

        Ok(connection)
    }
}
