//! A single discovered endpoint and its classification.

use crate::registry::RegistryError;
use nodescan_connection::{Endpoint, Peer};
use std::fmt;

/// Where a node is in the crawl.
///
/// Transitions only move forward:
/// `Discovered -> Queued -> Connecting -> {Good, Dead}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Announced, waiting in the discovery queue.
    Discovered,
    /// Handed to the bounded work queue.
    Queued,
    /// A worker is dialing or handshaking.
    Connecting,
    /// Completed a handshake. Terminal.
    Good,
    /// Dial or handshake failed. Terminal.
    Dead,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Good | NodeState::Dead)
    }

    fn can_advance_to(self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (NodeState::Discovered, NodeState::Queued)
                | (NodeState::Queued, NodeState::Connecting)
                | (NodeState::Connecting, NodeState::Good)
                | (NodeState::Connecting, NodeState::Dead)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Discovered => "discovered",
            NodeState::Queued => "queued",
            NodeState::Connecting => "connecting",
            NodeState::Good => "good",
            NodeState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Result of matching a pong against the outstanding ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    /// Nonce matched; `count` is the new round-trip total.
    Matched { count: u64 },
    /// A ping is outstanding but the nonce differs.
    Mismatched { expected: u64 },
    /// No ping is outstanding.
    Unsolicited,
}

/// One endpoint known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    endpoint: Endpoint,
    state: NodeState,
    /// Outstanding keepalive nonce, 0 when none.
    ping_nonce: u64,
    ping_count: u64,
    /// Filled in once the handshake succeeds.
    peer: Option<Peer>,
}

impl Node {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Node {
            endpoint,
            state: NodeState::Discovered,
            ping_nonce: 0,
            ping_count: 0,
            peer: None,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn ping_nonce(&self) -> u64 {
        self.ping_nonce
    }

    pub fn ping_count(&self) -> u64 {
        self.ping_count
    }

    /// What the peer said about itself during the handshake.
    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_ref()
    }

    pub(crate) fn advance(&mut self, next: NodeState) -> Result<(), RegistryError> {
        if !self.state.can_advance_to(next) {
            return Err(RegistryError::InvalidTransition {
                endpoint: self.endpoint,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn set_peer(&mut self, peer: Peer) {
        self.peer = Some(peer);
    }

    pub(crate) fn set_ping_nonce(&mut self, nonce: u64) {
        self.ping_nonce = nonce;
    }

    pub(crate) fn record_pong(&mut self, nonce: u64) -> PongOutcome {
        match self.ping_nonce {
            0 => PongOutcome::Unsolicited,
            expected if expected == nonce => {
                self.ping_nonce = 0;
                self.ping_count += 1;
                PongOutcome::Matched {
                    count: self.ping_count,
                }
            }
            expected => PongOutcome::Mismatched { expected },
        }
    }
}
