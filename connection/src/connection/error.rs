//! Error types for connection handling.

use crate::transport::TransportError;
use std::error::Error;
use std::fmt;
use std::io;

/// Errors that can occur while dialing, handshaking or talking to a peer.
#[derive(Debug)]
pub enum ConnectionError {
    /// An I/O error occurred while establishing the TCP connection.
    Io(io::Error),
    /// Framing or decoding failed.
    TransportFailed(TransportError),
    /// The peer answered with our own nonce, so we dialed ourselves.
    ConnectionLoop,
    /// The peer speaks a protocol version older than we support.
    ObsoleteVersion(u32),
}

impl ConnectionError {
    /// Whether the connection can keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConnectionError::TransportFailed(err) => err.is_recoverable(),
            _ => false,
        }
    }

    /// Whether the peer closed the connection.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            ConnectionError::TransportFailed(err) => err.is_end_of_stream(),
            ConnectionError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(err) => write!(f, "Socket error: {err}"),
            ConnectionError::TransportFailed(err) => {
                write!(f, "Peer transport failed: {err}")
            }
            ConnectionError::ConnectionLoop => {
                write!(f, "Dialed ourselves, version nonce matches our own")
            }
            ConnectionError::ObsoleteVersion(version) => {
                write!(f, "Peer protocol version {version} is too old")
            }
        }
    }
}

impl Error for ConnectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConnectionError::Io(err) => Some(err),
            ConnectionError::TransportFailed(err) => Some(err),
            ConnectionError::ConnectionLoop | ConnectionError::ObsoleteVersion(_) => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Io(err)
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        ConnectionError::TransportFailed(err)
    }
}
