//! Bitcoin message framing.
//!
//! The crawler speaks the plaintext v1 protocol. [`TransportReader`] turns a
//! byte stream into typed [`NetworkMessage`](bitcoin::p2p::message::NetworkMessage)s
//! and [`TransportWriter`] does the reverse.
//!
//! # Decode outcomes
//!
//! Reading yields either a message or a [`TransportError`], and the error
//! says whether the stream is still usable:
//!
//! * **Unknown message** - a well formed frame with a command this codec
//!   doesn't know. Recoverable.
//! * **Other decode errors** - bad checksum, unparsable payload, wrong
//!   network magic. The whole frame was consumed, so the next read starts on
//!   a frame boundary. Recoverable.
//! * **End of stream** - the peer closed the connection. Terminal.
//!
//! Anything else (socket errors, frames too large to buffer) is terminal too.
//!
//! # Example
//!
//! ```
//! use bitcoin::p2p::Magic;
//! use bitcoin::p2p::message::NetworkMessage;
//! use nodescan_connection::{TransportReader, TransportWriter};
//! use tokio::net::TcpStream;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("127.0.0.1:8333").await?;
//! let (reader, writer) = stream.into_split();
//!
//! let mut writer = TransportWriter::new(Magic::BITCOIN, writer);
//! let mut reader = TransportReader::new(Magic::BITCOIN, reader);
//!
//! writer.write(NetworkMessage::Ping(42)).await?;
//! match reader.read().await {
//!     Ok(message) => println!("Received {}", message.cmd()),
//!     Err(e) if e.is_recoverable() => println!("Skipping frame: {e}"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```

mod v1;

pub use v1::{TransportReader, TransportWriter, MAX_PAYLOAD_SIZE};

use bitcoin::consensus::encode;
use std::fmt;
use std::io;

/// Error types specific to the transport layer.
#[derive(Debug)]
pub enum TransportError {
    /// IO error during read/write operations.
    Io(io::Error),
    /// The peer closed the stream, possibly part way through a frame.
    EndOfStream,
    /// Failed to deserialize a complete frame.
    Deserialize(encode::Error),
    /// A complete frame carried a command this codec doesn't know.
    UnknownMessage(String),
    /// Network magic in the message doesn't match the expected value.
    MagicMismatch,
    /// The header announced a payload larger than [`MAX_PAYLOAD_SIZE`].
    PayloadTooLarge(usize),
}

impl TransportError {
    /// Whether the reader is positioned on a frame boundary after this error,
    /// so the next read can continue with the following message.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Deserialize(_)
                | TransportError::UnknownMessage(_)
                | TransportError::MagicMismatch
        )
    }

    /// Whether this error means the peer hung up.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            TransportError::EndOfStream => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "IO error: {e}"),
            TransportError::EndOfStream => write!(f, "Peer closed the stream"),
            TransportError::Deserialize(e) => write!(f, "Message deserialization error: {e}"),
            TransportError::UnknownMessage(command) => write!(f, "Unknown message '{command}'"),
            TransportError::MagicMismatch => write!(f, "Network magic mismatch"),
            TransportError::PayloadTooLarge(len) => {
                write!(f, "Payload of {len} bytes exceeds {MAX_PAYLOAD_SIZE}")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Deserialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<encode::Error> for TransportError {
    fn from(e: encode::Error) -> Self {
        TransportError::Deserialize(e)
    }
}
