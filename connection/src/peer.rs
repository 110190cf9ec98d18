//! Bitcoin peer endpoints and the details learned about them during a handshake.

use bitcoin::p2p::address::{AddrV2, Address};
use bitcoin::p2p::ServiceFlags;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Minimum protocol version for basic compatibility with modern bitcoin nodes.
pub const MIN_PROTOCOL_VERSION: u32 = 70001;
/// Minimum protocol version that supports AddrV2 messages (BIP155).
///
/// Bitcoin Core implemented this in version 0.21.0 with protocol version 70016.
pub const ADDRV2_MIN_PROTOCOL_VERSION: u32 = 70016;

/// A dialable peer address.
///
/// The endpoint is the identity of a node: two announcements of the same
/// address and port, in either the legacy or the BIP155 format, produce equal
/// endpoints. Its [`Display`](fmt::Display) form is the familiar `host:port`
/// string, with IPv6 hosts in brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Create an endpoint, collapsing IPv4-mapped IPv6 addresses to IPv4.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V6(ipv6) => ipv6.to_canonical(),
            ipv4 => ipv4,
        };
        Endpoint(SocketAddr::new(ip, port))
    }

    /// Extract an endpoint from a legacy `addr` entry.
    ///
    /// Returns `None` for entries that can't be dialed.
    pub fn from_address(address: &Address) -> Option<Self> {
        let socket_addr = address.socket_addr().ok()?;
        Self::announced(socket_addr.ip(), socket_addr.port())
    }

    /// Extract an endpoint from an `addrv2` entry.
    ///
    /// Only IPv4 and IPv6 networks are reachable over plain TCP, so Tor, I2P
    /// and CJDNS entries return `None`.
    pub fn from_addr_v2(address: &AddrV2, port: u16) -> Option<Self> {
        match address {
            AddrV2::Ipv4(ipv4) => Self::announced(IpAddr::V4(*ipv4), port),
            AddrV2::Ipv6(ipv6) => Self::announced(IpAddr::V6(*ipv6), port),
            _ => None,
        }
    }

    fn announced(ip: IpAddr, port: u16) -> Option<Self> {
        let endpoint = Self::new(ip, port);
        if endpoint.port() == 0 || endpoint.ip().is_unspecified() {
            return None;
        }
        Some(endpoint)
    }

    /// The socket address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(socket_addr: SocketAddr) -> Self {
        Endpoint::new(socket_addr.ip(), socket_addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when a string is not a `host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointParseError(String);

impl fmt::Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid endpoint '{}', expected host:port", self.0)
    }
}

impl std::error::Error for EndpointParseError {}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Endpoint::from)
            .map_err(|_| EndpointParseError(s.to_string()))
    }
}

/// Represents the service state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerServices {
    /// Known services with specific ServiceFlags.
    Known(ServiceFlags),
    /// Unknown services state.
    Unknown,
}

/// Represents the protocol version of a peer.
///
/// * **70001** - BIP 0031, absolute minimum for modern nodes.
/// * **70012** - BIP 0065, added CheckLockTimeVerify.
/// * **70013** - BIP 0130/BIP 0133, added sendheaders and feefilter.
/// * **70015** - BIP 0141/BIP 0143/BIP 0147, SegWit support.
/// * **70016** - BIP 155, addrv2 messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerProtocolVersion {
    /// Known protocol version.
    Known(u32),
    /// Unknown protocol version.
    Unknown,
}

impl PeerProtocolVersion {
    /// Returns the protocol version value if known, or `default` otherwise.
    pub fn unwrap_or(self, default: u32) -> u32 {
        match self {
            PeerProtocolVersion::Known(v) => v,
            PeerProtocolVersion::Unknown => default,
        }
    }

    /// The version number, if known.
    pub fn known(self) -> Option<u32> {
        match self {
            PeerProtocolVersion::Known(v) => Some(v),
            PeerProtocolVersion::Unknown => None,
        }
    }
}

impl fmt::Display for PeerProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerProtocolVersion::Known(v) => write!(f, "{v}"),
            PeerProtocolVersion::Unknown => write!(f, "unknown"),
        }
    }
}

/// A bitcoin peer and what it told us about itself.
///
/// Services, version and user agent start unknown and are filled in from the
/// peer's `version` message during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Where the peer listens.
    pub endpoint: Endpoint,
    /// The service flags advertised by the peer.
    pub services: PeerServices,
    /// The protocol version of the peer.
    pub version: PeerProtocolVersion,
    /// The user agent the peer announced.
    pub user_agent: Option<String>,
}

impl Peer {
    /// Create a new peer with unknown services and version.
    pub fn new(endpoint: Endpoint) -> Self {
        Peer {
            endpoint,
            services: PeerServices::Unknown,
            version: PeerProtocolVersion::Unknown,
            user_agent: None,
        }
    }

    /// Checks if the peer advertises the specified service.
    pub fn has_service(&self, service: ServiceFlags) -> bool {
        match self.services {
            PeerServices::Known(flags) => flags.has(service),
            PeerServices::Unknown => false,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ([peer] services: {}, version: {}, agent: {})",
            self.endpoint,
            match self.services {
                PeerServices::Known(flags) => flags.to_string(),
                PeerServices::Unknown => "unknown".to_string(),
            },
            self.version,
            self.user_agent.as_deref().unwrap_or("unknown"),
        )
    }
}
