//! Plaintext v1 framing: a 24 byte header followed by the payload.

use crate::transport::TransportError;
use bitcoin::consensus::encode;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a bitcoin message header in bytes.
pub const HEADER_SIZE: usize = 24;
/// Offset in the header where the payload length is stored.
const PAYLOAD_LENGTH_OFFSET: usize = 16;
/// Largest payload a peer may announce, matching bitcoin core's limit.
pub const MAX_PAYLOAD_SIZE: usize = 4_000_000;

/// Progress of a partially read frame, kept across cancelled reads.
#[derive(Debug)]
enum ReadState {
    Header {
        header: [u8; HEADER_SIZE],
        filled: usize,
    },
    /// Buffer holds the header followed by room for the payload.
    Payload { frame: Vec<u8>, filled: usize },
}

impl ReadState {
    fn header() -> Self {
        ReadState::Header {
            header: [0u8; HEADER_SIZE],
            filled: 0,
        }
    }

    fn payload(header: &[u8; HEADER_SIZE], payload_len: usize) -> Self {
        let mut frame = vec![0u8; HEADER_SIZE + payload_len];
        frame[..HEADER_SIZE].copy_from_slice(header);
        ReadState::Payload {
            frame,
            filled: HEADER_SIZE,
        }
    }
}

/// Reads framed messages from a byte stream.
///
/// [`read`](Self::read) is cancellation safe. Bytes consumed by a read that
/// is dropped mid-frame (e.g. the losing branch of `tokio::select!`) are kept
/// and the next call picks up where it left off.
#[derive(Debug)]
pub struct TransportReader<R> {
    network_magic: Magic,
    state: ReadState,
    reader: R,
}

impl<R> TransportReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(network_magic: Magic, reader: R) -> Self {
        Self {
            network_magic,
            state: ReadState::header(),
            reader,
        }
    }

    /// Read the next message.
    ///
    /// Whenever a complete frame was consumed the reader is back on a frame
    /// boundary, even if the frame failed to decode. Check
    /// [`TransportError::is_recoverable`] to decide whether to keep reading.
    pub async fn read(&mut self) -> Result<NetworkMessage, TransportError> {
        loop {
            match &mut self.state {
                ReadState::Header { header, filled } => {
                    while *filled < HEADER_SIZE {
                        let n = self.reader.read(&mut header[*filled..]).await?;
                        if n == 0 {
                            return Err(TransportError::EndOfStream);
                        }
                        *filled += n;
                    }

                    let mut len_bytes = [0u8; 4];
                    len_bytes.copy_from_slice(
                        &header[PAYLOAD_LENGTH_OFFSET..PAYLOAD_LENGTH_OFFSET + 4],
                    );
                    let payload_len = u32::from_le_bytes(len_bytes) as usize;
                    if payload_len > MAX_PAYLOAD_SIZE {
                        self.state = ReadState::header();
                        return Err(TransportError::PayloadTooLarge(payload_len));
                    }

                    self.state = ReadState::payload(header, payload_len);
                }
                ReadState::Payload { frame, filled } => {
                    while *filled < frame.len() {
                        let n = self.reader.read(&mut frame[*filled..]).await?;
                        if n == 0 {
                            return Err(TransportError::EndOfStream);
                        }
                        *filled += n;
                    }

                    let frame = std::mem::take(frame);
                    self.state = ReadState::header();
                    return self.decode(&frame);
                }
            }
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<NetworkMessage, TransportError> {
        let raw: RawNetworkMessage = encode::deserialize(frame)?;
        if raw.magic() != &self.network_magic {
            return Err(TransportError::MagicMismatch);
        }

        match raw.into_payload() {
            NetworkMessage::Unknown { command, .. } => {
                Err(TransportError::UnknownMessage(command.to_string()))
            }
            message => Ok(message),
        }
    }
}

/// Writes framed messages to a byte stream.
#[derive(Debug)]
pub struct TransportWriter<W> {
    network_magic: Magic,
    writer: W,
}

impl<W> TransportWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(network_magic: Magic, writer: W) -> Self {
        Self {
            network_magic,
            writer,
        }
    }

    /// Frame, write and flush a message.
    pub async fn write(&mut self, message: NetworkMessage) -> Result<(), TransportError> {
        let raw = RawNetworkMessage::new(self.network_magic, message);
        let bytes = encode::serialize(&raw);

        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;

        Ok(())
    }
}
