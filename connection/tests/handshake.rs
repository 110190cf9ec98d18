//! Dial a scripted peer over loopback TCP.

use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use bitcoin::Network;
use nodescan_connection::{
    ConnectionConfiguration, Endpoint, PeerProtocolVersion, PeerServices, TcpConnection,
    TransportReader, TransportWriter,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

const NETWORK: Network = Network::Regtest;

fn config() -> ConnectionConfiguration {
    ConnectionConfiguration::non_listening(PeerProtocolVersion::Known(70016), None)
        .with_connection_timeout(Duration::from_secs(2))
}

/// Accept one connection, handshake as a recent node, answer one ping, then
/// announce a single address.
async fn scripted_peer(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, write) = stream.into_split();
    let mut reader = TransportReader::new(NETWORK.magic(), read);
    let mut writer = TransportWriter::new(NETWORK.magic(), write);

    let theirs = match reader.read().await.unwrap() {
        NetworkMessage::Version(v) => v,
        other => panic!("Expected version, got {other:?}"),
    };
    let local = listener.local_addr().unwrap();
    writer
        .write(NetworkMessage::Version(VersionMessage {
            version: 70016,
            services: ServiceFlags::NETWORK,
            timestamp: theirs.timestamp,
            receiver: theirs.sender.clone(),
            sender: Address::new(&local, ServiceFlags::NETWORK),
            nonce: theirs.nonce.wrapping_add(1),
            user_agent: "/Satoshi:26.1.0/".to_string(),
            start_height: 0,
            relay: true,
        }))
        .await
        .unwrap();
    writer.write(NetworkMessage::Verack).await.unwrap();

    loop {
        match reader.read().await.unwrap() {
            NetworkMessage::Ping(nonce) => {
                writer.write(NetworkMessage::Pong(nonce)).await.unwrap();
                let announced = "10.1.2.3:18444".parse().unwrap();
                writer
                    .write(NetworkMessage::Addr(vec![(
                        0,
                        Address::new(&announced, ServiceFlags::NETWORK),
                    )]))
                    .await
                    .unwrap();
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_tcp_handshake_and_ping() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::from(listener.local_addr().unwrap());
    let peer = tokio::spawn(scripted_peer(listener));

    let mut connection = TcpConnection::connect(endpoint, NETWORK, config())
        .await
        .expect("Failed to establish connection");
    assert_eq!(connection.peer().endpoint, endpoint);
    assert_eq!(
        connection.peer().services,
        PeerServices::Known(ServiceFlags::NETWORK)
    );

    connection.send(NetworkMessage::Ping(42)).await.unwrap();
    let mut saw_pong = false;
    loop {
        let message = timeout(Duration::from_secs(5), connection.receive())
            .await
            .expect("Timeout waiting for response")
            .expect("Failed to receive message");
        match message {
            NetworkMessage::Pong(nonce) => {
                assert_eq!(nonce, 42);
                saw_pong = true;
            }
            NetworkMessage::Addr(entries) => {
                assert_eq!(entries.len(), 1);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_pong);
    peer.await.unwrap();

    let err = timeout(Duration::from_secs(5), connection.receive())
        .await
        .expect("Timeout waiting for close")
        .unwrap_err();
    assert!(err.is_end_of_stream());
}

#[tokio::test]
async fn test_refused_dial_fails() {
    // Grab a free port, then close the listener so nothing is there.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::from(listener.local_addr().unwrap());
    drop(listener);

    let result = TcpConnection::connect(endpoint, NETWORK, config()).await;
    assert!(result.is_err());
}
