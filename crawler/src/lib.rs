//! Bitcoin network crawler.
//!
//! Dials every peer it learns about through `addr` and `addrv2`
//! announcements, with a fixed bound on concurrent connections, and sorts
//! each endpoint into good (handshake completed) or dead.

mod aggregator;
mod builder;
mod connection;
mod crawler;
mod dispatcher;
mod node;
mod registry;
pub mod seeds;
mod snapshot;
mod store;
mod worker;

pub use aggregator::Outcome;
pub use builder::{
    CrawlerBuilder, CrawlerBuilderError, CrawlerConfig, DEFAULT_CONNECTION_LIMIT,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_PEER_TIMEOUT, DEFAULT_PROTOCOL_VERSION,
    DEFAULT_SNAPSHOT_INTERVAL,
};
pub use connection::{Connector, PeerConnection, PeerConnector};
pub use crawler::{CrawlSession, Crawler, ShutdownError};
pub use dispatcher::{DispatchExit, PeerMessage};
pub use node::{Node, NodeState, PongOutcome};
pub use registry::{NodeRegistry, RegistryCounts, RegistryError};
pub use snapshot::{Metrics, Snapshot};
pub use store::{JsonFileStore, NodeRecord, NodeStore, StoreError};

// Re-exports.
pub use nodescan_connection::{
    ConnectionConfiguration, ConnectionError, Endpoint, EndpointParseError, Peer,
    PeerProtocolVersion, PeerServices, UserAgent,
};
