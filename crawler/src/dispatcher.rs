//! Per-connection message loop.
//!
//! After the handshake a worker hands its connection to a [`Dispatcher`],
//! which reads until the peer hangs up, goes idle, or the crawl is
//! cancelled. It never sends anything: discovery only comes from what peers
//! announce on their own.

use crate::connection::PeerConnection;
use crate::node::PongOutcome;
use crate::registry::NodeRegistry;
use crate::snapshot::Metrics;
use bitcoin::p2p::message::NetworkMessage;
use log::{debug, error, info, warn};
use nodescan_connection::Endpoint;
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// The messages the dispatcher tells apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Version,
    Verack,
    Ping(u64),
    Pong(u64),
    /// Dialable endpoints from a legacy `addr`.
    Addr(Vec<Endpoint>),
    /// Dialable endpoints from an `addrv2`.
    AddrV2(Vec<Endpoint>),
    /// Number of inventory entries.
    Inventory(usize),
    /// Minimum fee rate in sat/kvB.
    FeeFilter(i64),
    /// Number of locator hashes.
    GetHeaders(usize),
    /// Anything else, by command name.
    Other(&'static str),
}

impl From<NetworkMessage> for PeerMessage {
    fn from(message: NetworkMessage) -> Self {
        match message {
            NetworkMessage::Version(_) => PeerMessage::Version,
            NetworkMessage::Verack => PeerMessage::Verack,
            NetworkMessage::Ping(nonce) => PeerMessage::Ping(nonce),
            NetworkMessage::Pong(nonce) => PeerMessage::Pong(nonce),
            NetworkMessage::Addr(entries) => PeerMessage::Addr(
                entries
                    .iter()
                    .filter_map(|(_, address)| Endpoint::from_address(address))
                    .collect(),
            ),
            NetworkMessage::AddrV2(entries) => PeerMessage::AddrV2(
                entries
                    .iter()
                    .filter_map(|entry| Endpoint::from_addr_v2(&entry.addr, entry.port))
                    .collect(),
            ),
            NetworkMessage::Inv(inventory) => PeerMessage::Inventory(inventory.len()),
            NetworkMessage::FeeFilter(rate) => PeerMessage::FeeFilter(rate),
            NetworkMessage::GetHeaders(request) => {
                PeerMessage::GetHeaders(request.locator_hashes.len())
            }
            other => PeerMessage::Other(other.cmd()),
        }
    }
}

/// Why a dispatcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// The peer closed the connection.
    Closed,
    /// The crawl was cancelled.
    Cancelled,
    /// Nothing arrived within the idle timeout.
    Idle,
    /// A non-recoverable error: an oversized frame or a socket error.
    ///
    /// Malformed frames of normal size are skipped and the session goes on.
    /// An oversized frame is not, because its length can't be trusted and
    /// the reader can't find the next frame boundary.
    Failed,
}

impl fmt::Display for DispatchExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DispatchExit::Closed => "closed by peer",
            DispatchExit::Cancelled => "cancelled",
            DispatchExit::Idle => "idle timeout",
            DispatchExit::Failed => "connection failed",
        };
        f.write_str(reason)
    }
}

pub(crate) struct Dispatcher<'a> {
    endpoint: Endpoint,
    registry: &'a NodeRegistry,
    metrics: &'a Metrics,
    idle_timeout: Option<Duration>,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(
        endpoint: Endpoint,
        registry: &'a NodeRegistry,
        metrics: &'a Metrics,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            endpoint,
            registry,
            metrics,
            idle_timeout,
        }
    }

    /// Read and handle messages until the session ends.
    pub(crate) async fn run<C: PeerConnection>(
        &self,
        connection: &mut C,
        cancel: &CancellationToken,
    ) -> DispatchExit {
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return DispatchExit::Cancelled,
                received = self.next(connection) => received,
            };

            let message = match received {
                Some(Ok(message)) => message,
                Some(Err(e)) if e.is_recoverable() => {
                    warn!("Skipping message from {}: {e}", self.endpoint);
                    continue;
                }
                Some(Err(e)) if e.is_end_of_stream() => return DispatchExit::Closed,
                Some(Err(e)) => {
                    debug!("Connection to {} failed: {e}", self.endpoint);
                    return DispatchExit::Failed;
                }
                None => return DispatchExit::Idle,
            };

            self.metrics.record_inbound();
            self.handle(PeerMessage::from(message)).await;
        }
    }

    /// `None` when the idle timeout expires first.
    async fn next<C: PeerConnection>(
        &self,
        connection: &mut C,
    ) -> Option<Result<NetworkMessage, nodescan_connection::ConnectionError>> {
        match self.idle_timeout {
            Some(idle) => timeout(idle, connection.receive()).await.ok(),
            None => Some(connection.receive().await),
        }
    }

    async fn handle(&self, message: PeerMessage) {
        let endpoint = self.endpoint;
        match message {
            PeerMessage::Version | PeerMessage::Verack => {
                debug!("Late handshake message from {endpoint}, ignoring")
            }
            // Deliberately unanswered.
            PeerMessage::Ping(nonce) => debug!("Ping {nonce} from {endpoint}"),
            PeerMessage::Pong(nonce) => match self.registry.record_pong(endpoint, nonce).await {
                Ok(PongOutcome::Matched { count }) => {
                    debug!("Pong from {endpoint}, {count} round trips")
                }
                Ok(PongOutcome::Mismatched { expected }) => {
                    warn!("Pong from {endpoint} has nonce {nonce}, expected {expected}")
                }
                Ok(PongOutcome::Unsolicited) => warn!("Unsolicited pong from {endpoint}"),
                Err(e) => error!("Failed to record pong: {e}"),
            },
            PeerMessage::Addr(endpoints) | PeerMessage::AddrV2(endpoints) => {
                let announced = endpoints.len();
                let added = self.registry.add_discovered(endpoints).await;
                info!("{endpoint} announced {announced} addresses, {added} new");
            }
            PeerMessage::Inventory(count) => debug!("{endpoint} announced {count} inventory items"),
            PeerMessage::FeeFilter(rate) => debug!("{endpoint} set fee filter {rate}"),
            PeerMessage::GetHeaders(locators) => {
                debug!("{endpoint} asked for headers with {locators} locators")
            }
            PeerMessage::Other(command) => debug!("Ignoring {command} from {endpoint}"),
        }
    }
}
