//! The deduplicated set of every endpoint the crawl has heard of.
//!
//! The registry is append-only: nodes are never removed, only advanced
//! through their states. Identity is the [`Endpoint`], so an endpoint
//! announced by many peers at once is still inserted exactly once.
//!
//! Writers are split by phase. Dispatchers add discoveries, the feeder moves
//! nodes to `Queued`, workers move them to `Connecting`, and only the result
//! aggregator makes the terminal `Good`/`Dead` transitions.

use crate::node::{Node, NodeState, PongOutcome};
use crate::store::NodeRecord;
use log::debug;
use nodescan_connection::{Endpoint, Peer};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tokio::sync::{Mutex, Notify};

/// Errors raised when a caller breaks the registry's contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The endpoint was never added.
    UnknownEndpoint(Endpoint),
    /// The requested state change doesn't follow the allowed transitions.
    InvalidTransition {
        endpoint: Endpoint,
        from: NodeState,
        to: NodeState,
    },
    /// The operation needs a node with a live connection, i.e. one that is
    /// `Connecting` or `Good`.
    NotLive {
        endpoint: Endpoint,
        state: NodeState,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownEndpoint(endpoint) => {
                write!(f, "Endpoint {endpoint} is not in the registry")
            }
            RegistryError::InvalidTransition { endpoint, from, to } => {
                write!(f, "Invalid transition for {endpoint}: {from} -> {to}")
            }
            RegistryError::NotLive { endpoint, state } => {
                write!(f, "No live connection to {endpoint}, node is {state}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Per-state node counts at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub total: usize,
    /// Nodes waiting in the discovery queue.
    pub discovered: usize,
    pub queued: usize,
    pub connecting: usize,
    pub good: usize,
    pub dead: usize,
}

impl RegistryCounts {
    /// Nodes not yet classified.
    pub fn pending(&self) -> usize {
        self.discovered + self.queued + self.connecting
    }
}

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<Endpoint, Node>,
    /// Endpoints in state `Discovered`, oldest first.
    discovery_queue: VecDeque<Endpoint>,
    good: Vec<Endpoint>,
    dead: usize,
    queued: usize,
    connecting: usize,
}

impl Inner {
    fn node_mut(&mut self, endpoint: Endpoint) -> Result<&mut Node, RegistryError> {
        self.nodes
            .get_mut(&endpoint)
            .ok_or(RegistryError::UnknownEndpoint(endpoint))
    }
}

/// Owner of every [`Node`] in the crawl.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    inner: Mutex<Inner>,
    /// Signalled whenever the discovery queue gains entries.
    discovered: Notify,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a discovery batch, returning how many endpoints were new.
    ///
    /// Endpoints already known in any state are ignored, as are duplicates
    /// within the batch.
    pub async fn add_discovered<I>(&self, endpoints: I) -> usize
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let added = {
            let mut inner = self.inner.lock().await;
            let mut added = 0;
            for endpoint in endpoints {
                if inner.nodes.contains_key(&endpoint) {
                    continue;
                }
                inner.nodes.insert(endpoint, Node::new(endpoint));
                inner.discovery_queue.push_back(endpoint);
                added += 1;
            }
            added
        };

        if added > 0 {
            self.discovered.notify_one();
        }
        added
    }

    /// Pop the oldest discovered endpoint and mark it `Queued`, waiting until
    /// one is available.
    ///
    /// Cancellation safe: an endpoint is only removed from the queue in the
    /// same step that returns it.
    pub(crate) async fn next_discovered(&self) -> Endpoint {
        loop {
            {
                let mut inner = self.inner.lock().await;
                while let Some(endpoint) = inner.discovery_queue.pop_front() {
                    let queued = inner
                        .nodes
                        .get_mut(&endpoint)
                        .map(|node| node.advance(NodeState::Queued));
                    match queued {
                        Some(Ok(())) => {
                            inner.queued += 1;
                            return endpoint;
                        }
                        // The queue only ever holds discovered nodes.
                        _ => debug!("Dropping stale discovery entry {endpoint}"),
                    }
                }
            }
            self.discovered.notified().await;
        }
    }

    pub(crate) async fn mark_connecting(&self, endpoint: Endpoint) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        inner.node_mut(endpoint)?.advance(NodeState::Connecting)?;
        inner.queued -= 1;
        inner.connecting += 1;
        Ok(())
    }

    /// Terminal success. Only the result aggregator calls this.
    pub(crate) async fn mark_good(
        &self,
        endpoint: Endpoint,
        peer: Peer,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let node = inner.node_mut(endpoint)?;
        node.advance(NodeState::Good)?;
        node.set_peer(peer);
        inner.connecting -= 1;
        inner.good.push(endpoint);
        Ok(())
    }

    /// Terminal failure. Only the result aggregator calls this.
    pub(crate) async fn mark_dead(&self, endpoint: Endpoint) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        inner.node_mut(endpoint)?.advance(NodeState::Dead)?;
        inner.connecting -= 1;
        inner.dead += 1;
        Ok(())
    }

    /// Record the keepalive nonce sent to a freshly handshaken node.
    pub(crate) async fn set_ping_nonce(
        &self,
        endpoint: Endpoint,
        nonce: u64,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let node = inner.node_mut(endpoint)?;
        match node.state() {
            NodeState::Connecting | NodeState::Good => {
                node.set_ping_nonce(nonce);
                Ok(())
            }
            state => Err(RegistryError::NotLive { endpoint, state }),
        }
    }

    /// Match a pong from `endpoint` against its outstanding ping.
    pub async fn record_pong(
        &self,
        endpoint: Endpoint,
        nonce: u64,
    ) -> Result<PongOutcome, RegistryError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.node_mut(endpoint)?.record_pong(nonce))
    }

    pub async fn counts(&self) -> RegistryCounts {
        let inner = self.inner.lock().await;
        RegistryCounts {
            total: inner.nodes.len(),
            discovered: inner.discovery_queue.len(),
            queued: inner.queued,
            connecting: inner.connecting,
            good: inner.good.len(),
            dead: inner.dead,
        }
    }

    /// Records for every good node, in the order they were classified.
    pub async fn good_records(&self) -> Vec<NodeRecord> {
        let inner = self.inner.lock().await;
        inner
            .good
            .iter()
            .filter_map(|endpoint| inner.nodes.get(endpoint))
            .map(NodeRecord::from)
            .collect()
    }

    /// A copy of the node for `endpoint`, if known.
    pub async fn node(&self, endpoint: Endpoint) -> Option<Node> {
        self.inner.lock().await.nodes.get(&endpoint).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    fn endpoint(last: u8) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 8333)
    }

    async fn connecting(registry: &NodeRegistry, endpoint: Endpoint) {
        registry.add_discovered([endpoint]).await;
        assert_eq!(registry.next_discovered().await, endpoint);
        registry.mark_connecting(endpoint).await.unwrap();
    }

    fn assert_invariant(counts: RegistryCounts) {
        assert_eq!(counts.total, counts.good + counts.dead + counts.pending());
    }

    #[tokio::test]
    async fn test_dedup_within_and_across_batches() {
        let registry = NodeRegistry::new();

        let added = registry
            .add_discovered([endpoint(1), endpoint(2), endpoint(1), endpoint(3)])
            .await;
        assert_eq!(added, 3);

        let added = registry
            .add_discovered([endpoint(3), endpoint(4), endpoint(2)])
            .await;
        assert_eq!(added, 1);

        let counts = registry.counts().await;
        assert_eq!(counts.total, 4);
        assert_eq!(counts.discovered, 4);
        assert_invariant(counts);
    }

    #[tokio::test]
    async fn test_known_endpoints_are_not_requeued() {
        let registry = NodeRegistry::new();
        connecting(&registry, endpoint(1)).await;
        registry.mark_dead(endpoint(1)).await.unwrap();

        assert_eq!(registry.add_discovered([endpoint(1)]).await, 0);
        let counts = registry.counts().await;
        assert_eq!(counts.discovered, 0);
        assert_eq!(counts.dead, 1);
        assert_invariant(counts);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let registry = NodeRegistry::new();
        registry
            .add_discovered([endpoint(3), endpoint(1), endpoint(2)])
            .await;

        assert_eq!(registry.next_discovered().await, endpoint(3));
        assert_eq!(registry.next_discovered().await, endpoint(1));
        assert_eq!(registry.next_discovered().await, endpoint(2));

        let counts = registry.counts().await;
        assert_eq!(counts.queued, 3);
        assert_eq!(counts.discovered, 0);
    }

    #[tokio::test]
    async fn test_next_discovered_waits_for_discovery() {
        let registry = Arc::new(NodeRegistry::new());
        let waiter = tokio::spawn({
            let registry = registry.clone();
            async move { registry.next_discovered().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.add_discovered([endpoint(9)]).await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(got, endpoint(9));
    }

    #[tokio::test]
    async fn test_terminal_transitions() {
        let registry = NodeRegistry::new();
        connecting(&registry, endpoint(1)).await;
        connecting(&registry, endpoint(2)).await;
        assert_eq!(registry.counts().await.connecting, 2);

        registry
            .mark_good(endpoint(1), Peer::new(endpoint(1)))
            .await
            .unwrap();
        registry.mark_dead(endpoint(2)).await.unwrap();

        let counts = registry.counts().await;
        assert_eq!(counts.good, 1);
        assert_eq!(counts.dead, 1);
        assert_eq!(counts.connecting, 0);
        assert_invariant(counts);

        let records = registry.good_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, "10.0.0.1:8333");
    }

    #[tokio::test]
    async fn test_contract_violations_are_errors() {
        let registry = NodeRegistry::new();
        assert_eq!(
            registry.mark_dead(endpoint(1)).await,
            Err(RegistryError::UnknownEndpoint(endpoint(1)))
        );

        registry.add_discovered([endpoint(1)]).await;
        let err = registry.mark_dead(endpoint(1)).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidTransition {
                from: NodeState::Discovered,
                to: NodeState::Dead,
                ..
            }
        ));

        registry.next_discovered().await;
        registry.mark_connecting(endpoint(1)).await.unwrap();
        registry
            .mark_good(endpoint(1), Peer::new(endpoint(1)))
            .await
            .unwrap();
        assert!(registry.mark_dead(endpoint(1)).await.is_err());
        let peer = Peer::new(endpoint(1));
        assert!(registry.mark_good(endpoint(1), peer).await.is_err());

        let counts = registry.counts().await;
        assert_eq!((counts.good, counts.dead), (1, 0));
        assert_invariant(counts);
    }

    #[tokio::test]
    async fn test_pong_bookkeeping() {
        let registry = NodeRegistry::new();
        connecting(&registry, endpoint(1)).await;
        registry.set_ping_nonce(endpoint(1), 1234).await.unwrap();

        assert_eq!(
            registry.record_pong(endpoint(1), 4321).await.unwrap(),
            PongOutcome::Mismatched { expected: 1234 }
        );
        assert_eq!(
            registry.record_pong(endpoint(1), 1234).await.unwrap(),
            PongOutcome::Matched { count: 1 }
        );
        let node = registry.node(endpoint(1)).await.unwrap();
        assert_eq!(node.ping_count(), 1);
        assert_eq!(node.ping_nonce(), 0);
    }

    #[tokio::test]
    async fn test_ping_nonce_needs_live_node() {
        let registry = NodeRegistry::new();
        registry.add_discovered([endpoint(2)]).await;

        let err = registry.set_ping_nonce(endpoint(2), 99).await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::NotLive {
                endpoint: endpoint(2),
                state: NodeState::Discovered,
            }
        );
        assert_eq!(
            err.to_string(),
            "No live connection to 10.0.0.2:8333, node is discovered"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overlapping_discovery() {
        let registry = Arc::new(NodeRegistry::new());
        let mut tasks = Vec::new();

        // Eight writers, each announcing 200 endpoints, overlapping by half
        // with the previous writer.
        for writer in 0..8u32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let start = writer * 100;
                let batch: Vec<Endpoint> = (start..start + 200)
                    .map(|i| {
                        let [_, _, hi, lo] = i.to_be_bytes();
                        Endpoint::new(IpAddr::V4(Ipv4Addr::new(172, 16, hi, lo)), 8333)
                    })
                    .collect();
                let mut added = 0;
                for chunk in batch.chunks(7) {
                    added += registry.add_discovered(chunk.iter().copied()).await;
                    tokio::task::yield_now().await;
                }
                added
            }));
        }

        let mut total_added = 0;
        for task in tasks {
            total_added += task.await.unwrap();
        }

        // Union of [0, 900).
        assert_eq!(total_added, 900);
        let counts = registry.counts().await;
        assert_eq!(counts.total, 900);
        assert_eq!(counts.discovered, 900);

        let mut drained = HashSet::new();
        for _ in 0..900 {
            assert!(drained.insert(registry.next_discovered().await));
        }
        assert_eq!(drained.len(), 900);
    }
}
