//! Bitcoin p2p building blocks for the nodescan crawler.
//!
//! Endpoint identity, v1 message framing, TCP dialing and the version
//! handshake. Everything above a single connection lives in the `nodescan`
//! crate.

mod connection;
mod peer;
mod transport;
pub mod user_agent;

pub use connection::{
    default_user_agent, generate_nonce, Connection, ConnectionConfiguration, ConnectionError,
    TcpConnection, DEFAULT_CONNECTION_TIMEOUT, NON_LISTENING_ADDRESS,
};
pub use peer::{
    Endpoint, EndpointParseError, Peer, PeerProtocolVersion, PeerServices,
    ADDRV2_MIN_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};
pub use transport::{TransportError, TransportReader, TransportWriter, MAX_PAYLOAD_SIZE};
pub use user_agent::{UserAgent, UserAgentError};
