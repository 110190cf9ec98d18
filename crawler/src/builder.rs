//! Crawler configuration and its builder.

use crate::crawler::Crawler;
use bitcoin::Network;
use nodescan_connection::{
    ConnectionConfiguration, PeerProtocolVersion, UserAgent, UserAgentError,
    DEFAULT_CONNECTION_TIMEOUT,
};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default protocol version advertised to peers.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 70016;
/// Default number of concurrent connections.
pub const DEFAULT_CONNECTION_LIMIT: usize = 8;
/// Default time allowed for dial plus handshake.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(20);
/// Default time a live session may stay silent before it is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Default interval between snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a crawl needs to know up front.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub network: Network,
    /// Falls back to the connection crate's default when `None`.
    pub user_agent: Option<UserAgent>,
    pub protocol_version: u32,
    /// Number of workers, and the bound on simultaneous connections.
    pub connection_limit: usize,
    /// Budget for dial plus handshake.
    pub peer_timeout: Duration,
    /// `None` keeps silent sessions open until the peer or a cancel ends them.
    pub idle_timeout: Option<Duration>,
    pub snapshot_interval: Duration,
    /// Where good nodes are saved. Nothing is saved when `None`.
    pub output_path: Option<PathBuf>,
}

impl CrawlerConfig {
    pub fn new(network: Network) -> Self {
        CrawlerConfig {
            network,
            user_agent: None,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            output_path: None,
        }
    }

    /// How each connection presents the crawler to peers.
    ///
    /// The TCP dial timeout never exceeds the peer timeout.
    pub fn connection_configuration(&self) -> ConnectionConfiguration {
        ConnectionConfiguration::non_listening(
            PeerProtocolVersion::Known(self.protocol_version),
            self.user_agent.clone(),
        )
        .with_connection_timeout(DEFAULT_CONNECTION_TIMEOUT.min(self.peer_timeout))
    }
}

/// Errors that can occur during crawler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlerBuilderError {
    /// User agent doesn't follow the required format.
    InvalidUserAgent(UserAgentError),
    /// A crawl needs at least one worker.
    ZeroConnectionLimit,
}

impl fmt::Display for CrawlerBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlerBuilderError::InvalidUserAgent(err) => {
                write!(f, "Invalid user agent: {err}")
            }
            CrawlerBuilderError::ZeroConnectionLimit => {
                write!(f, "Connection limit must be at least 1")
            }
        }
    }
}

impl std::error::Error for CrawlerBuilderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlerBuilderError::InvalidUserAgent(err) => Some(err),
            CrawlerBuilderError::ZeroConnectionLimit => None,
        }
    }
}

/// Builder for a [`Crawler`].
///
/// # Example
///
/// ```
/// # fn main() -> Result<(), nodescan::CrawlerBuilderError> {
/// use std::time::Duration;
/// use bitcoin::Network;
/// use nodescan::CrawlerBuilder;
///
/// let crawler = CrawlerBuilder::new(Network::Bitcoin)
///     .with_user_agent("/my-crawler:1.0/")?
///     .with_connection_limit(32)?
///     .with_peer_timeout(Duration::from_secs(10))
///     .with_output_path("nodes.json")
///     .build();
/// assert_eq!(crawler.config().connection_limit, 32);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CrawlerBuilder {
    config: CrawlerConfig,
}

impl CrawlerBuilder {
    pub fn new(network: Network) -> Self {
        CrawlerBuilder {
            config: CrawlerConfig::new(network),
        }
    }

    /// Set the user agent, which must look like `/name:version/`.
    pub fn with_user_agent<S: Into<String>>(
        mut self,
        user_agent: S,
    ) -> Result<Self, CrawlerBuilderError> {
        let user_agent =
            UserAgent::new(user_agent.into()).map_err(CrawlerBuilderError::InvalidUserAgent)?;
        self.config.user_agent = Some(user_agent);
        Ok(self)
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Set how many endpoints may be connecting or connected at once.
    ///
    /// Higher values crawl faster at the cost of sockets and bandwidth.
    pub fn with_connection_limit(mut self, limit: usize) -> Result<Self, CrawlerBuilderError> {
        if limit == 0 {
            return Err(CrawlerBuilderError::ZeroConnectionLimit);
        }
        self.config.connection_limit = limit;
        Ok(self)
    }

    /// Set the budget for dialing and handshaking one peer (default 20s).
    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.config.peer_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.config.snapshot_interval = interval;
        self
    }

    /// Save good nodes as JSON to `path` on every snapshot tick.
    pub fn with_output_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.output_path = Some(path.into());
        self
    }

    /// The validated configuration, without building a crawler.
    pub fn config(self) -> CrawlerConfig {
        self.config
    }

    pub fn build(self) -> Crawler {
        Crawler::new(self.config)
    }
}
