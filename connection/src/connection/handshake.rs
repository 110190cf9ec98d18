//! The version/verack handshake.

use super::{Connection, ConnectionError};
use crate::peer::{
    PeerProtocolVersion, PeerServices, ADDRV2_MIN_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use log::{debug, warn};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};

/// Seconds since the unix epoch, or 0 if the clock is set before it.
fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Generates a non-zero 64-bit nonce.
///
/// Not cryptographically secure. Good enough for connection loop detection
/// and for pairing pings with pongs. A process wide counter keeps nonces
/// created within the same clock tick distinct.
pub fn generate_nonce() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let pid = process::id() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    // Spread the counter across the word so consecutive calls differ in many bits.
    let nonce = now ^ pid.rotate_left(32) ^ count.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    // Zero reads as "no ping outstanding".
    nonce.max(1)
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Sent our version, heard nothing back yet.
    VersionSent,
    /// Got the peer's version (and answered with verack).
    VersionReceived,
    /// Got a verack before the peer's version.
    VerackReceived,
    Complete,
}

impl HandshakeState {
    fn on_verack(self) -> Self {
        match self {
            HandshakeState::VersionSent => HandshakeState::VerackReceived,
            HandshakeState::VersionReceived => HandshakeState::Complete,
            other => {
                debug!("Received duplicate verack message in state {other:?}, ignoring");
                other
            }
        }
    }

    fn on_version(self) -> Self {
        match self {
            HandshakeState::VerackReceived => HandshakeState::Complete,
            _ => HandshakeState::VersionReceived,
        }
    }

    fn has_version(self) -> bool {
        matches!(
            self,
            HandshakeState::VersionReceived | HandshakeState::Complete
        )
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Perform the version handshake.
    ///
    /// 1. Send our version.
    /// 2. Read until the peer's version and verack have both arrived,
    ///    skipping frames that fail to decode.
    /// 3. On the peer's version, validate it, record what it says about the
    ///    peer, optionally send `sendaddrv2`, and answer with verack.
    pub async fn handshake(&mut self) -> Result<(), ConnectionError> {
        let nonce = generate_nonce();
        let version = self.version_message(nonce);
        self.send(version).await?;
        debug!("Sent version message to {}", self.peer.endpoint);

        let mut state = HandshakeState::VersionSent;
        while state != HandshakeState::Complete {
            let message = match self.receive().await {
                Ok(message) => message,
                Err(e) if e.is_recoverable() => {
                    warn!(
                        "Skipping frame from {} during handshake: {e}",
                        self.peer.endpoint
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            match message {
                NetworkMessage::Version(version) if !state.has_version() => {
                    self.on_version(version, nonce).await?;
                    state = state.on_version();
                }
                NetworkMessage::Version(_) => {
                    debug!("Received duplicate version message in state {state:?}, ignoring");
                }
                NetworkMessage::Verack => state = state.on_verack(),
                other => {
                    debug!(
                        "Received {} from {} during handshake, ignoring",
                        other.cmd(),
                        self.peer.endpoint
                    );
                }
            }
        }

        debug!("Handshake with {} complete", self.peer);
        Ok(())
    }

    fn version_message(&self, nonce: u64) -> NetworkMessage {
        let receiver_services = match self.peer.services {
            PeerServices::Known(flags) => flags,
            PeerServices::Unknown => ServiceFlags::NONE,
        };
        let services = self.configuration.services;

        NetworkMessage::Version(VersionMessage {
            version: self
                .configuration
                .protocol_version
                .unwrap_or(MIN_PROTOCOL_VERSION),
            services,
            timestamp: unix_timestamp(),
            receiver: Address::new(&self.peer.endpoint.socket_addr(), receiver_services),
            sender: Address::new(&self.configuration.sender_address, services),
            nonce,
            user_agent: self.configuration.user_agent_string(),
            start_height: self.configuration.start_height,
            relay: self.configuration.relay,
        })
    }

    async fn on_version(
        &mut self,
        version: VersionMessage,
        our_nonce: u64,
    ) -> Result<(), ConnectionError> {
        if version.nonce == our_nonce {
            return Err(ConnectionError::ConnectionLoop);
        }
        if version.version < MIN_PROTOCOL_VERSION {
            return Err(ConnectionError::ObsoleteVersion(version.version));
        }

        self.peer.services = PeerServices::Known(version.services);
        self.peer.version = PeerProtocolVersion::Known(version.version);
        self.peer.user_agent = Some(version.user_agent);

        let local_version = self
            .configuration
            .protocol_version
            .unwrap_or(MIN_PROTOCOL_VERSION);
        let effective_version = local_version.min(version.version);
        if self.configuration.request_addrv2 && effective_version >= ADDRV2_MIN_PROTOCOL_VERSION {
            self.send(NetworkMessage::SendAddrV2).await?;
        }

        self.send(NetworkMessage::Verack).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfiguration;
    use crate::peer::{Endpoint, Peer};
    use crate::transport::{TransportReader, TransportWriter};
    use bitcoin::p2p::message::CommandString;
    use bitcoin::Network;
    use std::collections::HashSet;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    type TestConnection = Connection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn peer_version(version: u32, nonce: u64) -> VersionMessage {
        let addr = "127.0.0.1:8333".parse().unwrap();
        VersionMessage {
            version,
            services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            timestamp: unix_timestamp(),
            receiver: Address::new(&addr, ServiceFlags::NONE),
            sender: Address::new(&addr, ServiceFlags::NETWORK),
            nonce,
            user_agent: "/Satoshi:27.0.0/".to_string(),
            start_height: 850_000,
            relay: false,
        }
    }

    /// Connect a [`Connection`] to a scripted peer. The script gets the
    /// peer side of the pipe and the crawler's version message, and returns
    /// every command it read afterwards.
    fn pipe<F, Fut>(script: F) -> (TestConnection, JoinHandle<Vec<String>>)
    where
        F: FnOnce(
                TransportReader<ReadHalf<DuplexStream>>,
                TransportWriter<WriteHalf<DuplexStream>>,
                VersionMessage,
            ) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = Vec<String>> + Send,
    {
        let (ours, theirs) = duplex(64 * 1024);
        let (read, write) = split(ours);
        let (peer_read, peer_write) = split(theirs);
        let magic = Network::Regtest.magic();

        let handle = tokio::spawn(async move {
            let mut reader = TransportReader::new(magic, peer_read);
            let writer = TransportWriter::new(magic, peer_write);
            let version = match reader.read().await.unwrap() {
                NetworkMessage::Version(v) => v,
                other => panic!("Expected version first, got {other:?}"),
            };
            script(reader, writer, version).await
        });

        let endpoint: Endpoint = "127.0.0.1:18444".parse().unwrap();
        let config =
            ConnectionConfiguration::non_listening(PeerProtocolVersion::Known(70016), None);
        let connection =
            Connection::new(Peer::new(endpoint), Network::Regtest, config, read, write);
        (connection, handle)
    }

    async fn drain_commands(
        reader: &mut TransportReader<ReadHalf<DuplexStream>>,
        count: usize,
    ) -> Vec<String> {
        let mut commands = Vec::new();
        for _ in 0..count {
            commands.push(reader.read().await.unwrap().cmd().to_string());
        }
        commands
    }

    #[tokio::test]
    async fn test_handshake_records_peer_details() {
        let (mut connection, peer) = pipe(|mut reader, mut writer, version| async move {
            assert_eq!(version.version, 70016);
            assert_eq!(version.services, ServiceFlags::NONE);
            assert!(version.user_agent.starts_with("/nodescan:"));
            assert!(!version.relay);

            writer
                .write(NetworkMessage::Version(peer_version(70016, 99)))
                .await
                .unwrap();
            writer.write(NetworkMessage::Verack).await.unwrap();
            drain_commands(&mut reader, 2).await
        });

        connection.handshake().await.unwrap();
        let commands = peer.await.unwrap();
        assert_eq!(commands, vec!["sendaddrv2", "verack"]);

        let details = connection.peer();
        assert_eq!(details.version, PeerProtocolVersion::Known(70016));
        assert!(details.has_service(ServiceFlags::WITNESS));
        assert_eq!(details.user_agent.as_deref(), Some("/Satoshi:27.0.0/"));
    }

    #[tokio::test]
    async fn test_no_sendaddrv2_for_older_peers() {
        let (mut connection, peer) = pipe(|mut reader, mut writer, _| async move {
            // Verack first is allowed too.
            writer.write(NetworkMessage::Verack).await.unwrap();
            writer
                .write(NetworkMessage::Version(peer_version(70015, 5)))
                .await
                .unwrap();
            drain_commands(&mut reader, 1).await
        });

        connection.handshake().await.unwrap();
        assert_eq!(peer.await.unwrap(), vec!["verack"]);
        assert_eq!(connection.peer().version.known(), Some(70015));
    }

    #[tokio::test]
    async fn test_connection_loop_detected() {
        let (mut connection, _peer) = pipe(|_reader, mut writer, version| async move {
            writer
                .write(NetworkMessage::Version(peer_version(70016, version.nonce)))
                .await
                .unwrap();
            Vec::new()
        });

        let err = connection.handshake().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionLoop));
    }

    #[tokio::test]
    async fn test_obsolete_peer_rejected() {
        let (mut connection, _peer) = pipe(|_reader, mut writer, _| async move {
            writer
                .write(NetworkMessage::Version(peer_version(60002, 1)))
                .await
                .unwrap();
            Vec::new()
        });

        let err = connection.handshake().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ObsoleteVersion(60002)));
    }

    #[tokio::test]
    async fn test_unknown_messages_skipped_during_handshake() {
        let (mut connection, peer) = pipe(|mut reader, mut writer, _| async move {
            writer
                .write(NetworkMessage::Unknown {
                    command: CommandString::try_from_static("mystery").unwrap(),
                    payload: vec![0xAB; 4],
                })
                .await
                .unwrap();
            writer
                .write(NetworkMessage::Version(peer_version(70016, 2)))
                .await
                .unwrap();
            writer.write(NetworkMessage::SendHeaders).await.unwrap();
            writer.write(NetworkMessage::Verack).await.unwrap();
            drain_commands(&mut reader, 2).await
        });

        connection.handshake().await.unwrap();
        assert_eq!(peer.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_peer_hangup_during_handshake() {
        let (mut connection, _peer) = pipe(|_reader, writer, _| async move {
            drop(writer);
            Vec::new()
        });

        let err = connection.handshake().await.unwrap_err();
        assert!(err.is_end_of_stream());
    }

    #[test]
    fn test_nonces_are_distinct_and_non_zero() {
        let nonces: HashSet<u64> = (0..1000).map(|_| generate_nonce()).collect();
        assert_eq!(nonces.len(), 1000);
        assert!(!nonces.contains(&0));
    }
}
