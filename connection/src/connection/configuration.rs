//! How the crawler presents itself to peers.

use crate::peer::PeerProtocolVersion;
use crate::user_agent::UserAgent;
use bitcoin::p2p::ServiceFlags;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// User agent sent when none is configured, `/nodescan:<crate version>/`.
pub fn default_user_agent() -> UserAgent {
    UserAgent::from_name_version("nodescan", env!("CARGO_PKG_VERSION"))
}

/// Sender address for version messages, telling peers not to advertise us.
pub const NON_LISTENING_ADDRESS: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Default timeout for the TCP dial.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration used to build a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfiguration {
    /// Protocol version advertised in our version message.
    pub protocol_version: PeerProtocolVersion,
    /// Custom user agent. Falls back to [`default_user_agent`] if `None`.
    pub user_agent: Option<UserAgent>,
    /// Service flags advertised by this node.
    pub services: ServiceFlags,
    /// Address advertised as the sender in version messages.
    pub sender_address: SocketAddr,
    /// Block height advertised in version messages.
    pub start_height: i32,
    /// Whether the peer should relay transactions to us.
    pub relay: bool,
    /// Send `sendaddrv2` during the handshake when the peer supports it.
    pub request_addrv2: bool,
    /// Timeout for the TCP dial.
    pub connection_timeout: Duration,
}

impl ConnectionConfiguration {
    /// Configuration for a node that accepts no inbound connections.
    ///
    /// Advertises no services and a non-listening sender address, doesn't
    /// ask for transaction relay, and requests addrv2 announcements.
    pub fn non_listening(
        protocol_version: PeerProtocolVersion,
        user_agent: Option<UserAgent>,
    ) -> Self {
        Self {
            protocol_version,
            user_agent,
            services: ServiceFlags::NONE,
            sender_address: NON_LISTENING_ADDRESS,
            start_height: 0,
            relay: false,
            request_addrv2: true,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    /// Set the timeout for the TCP dial.
    ///
    /// ```
    /// use std::time::Duration;
    /// use nodescan_connection::{ConnectionConfiguration, PeerProtocolVersion};
    ///
    /// let config = ConnectionConfiguration::non_listening(PeerProtocolVersion::Known(70016), None)
    ///     .with_connection_timeout(Duration::from_secs(3));
    /// assert_eq!(config.connection_timeout, Duration::from_secs(3));
    /// ```
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// The user agent string to advertise.
    pub fn user_agent_string(&self) -> String {
        match &self.user_agent {
            Some(user_agent) => user_agent.to_string(),
            None => default_user_agent().to_string(),
        }
    }
}

impl fmt::Display for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol {}, user agent {}, services {}, addrv2 {}, relay {}",
            self.protocol_version,
            self.user_agent_string(),
            self.services,
            self.request_addrv2,
            self.relay
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_listening_defaults() {
        let config =
            ConnectionConfiguration::non_listening(PeerProtocolVersion::Known(70016), None);
        assert_eq!(config.services, ServiceFlags::NONE);
        assert_eq!(config.sender_address.port(), 0);
        assert!(config.sender_address.ip().is_unspecified());
        assert!(!config.relay);
        assert!(config.request_addrv2);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(
            config.user_agent_string(),
            format!("/nodescan:{}/", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn test_custom_user_agent() {
        let agent = UserAgent::from_name_version("scanner", "1.0");
        let config =
            ConnectionConfiguration::non_listening(PeerProtocolVersion::Unknown, Some(agent));
        assert_eq!(config.user_agent_string(), "/scanner:1.0/");
        assert!(config.to_string().contains("/scanner:1.0/"));
    }
}
