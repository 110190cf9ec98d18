//! Single consumer of connection outcomes.
//!
//! Workers never touch the good/dead bookkeeping directly. They send an
//! [`Outcome`] here and this task, the only caller of the registry's
//! terminal transitions, applies it.
//!
//! The loop ends when the channel closes, i.e. once every worker has exited,
//! so an outcome reported while the crawl is being cancelled is still
//! recorded.

use crate::registry::NodeRegistry;
use log::{debug, error};
use nodescan_connection::{Endpoint, Peer};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Terminal result of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handshake completed.
    Good(Peer),
    /// Dial, timeout or handshake failure.
    Dead(Endpoint),
}

pub(crate) async fn aggregate(
    registry: Arc<NodeRegistry>,
    mut outcomes: mpsc::UnboundedReceiver<Outcome>,
) {
    debug!("Result aggregator started");
    while let Some(outcome) = outcomes.recv().await {
        apply(&registry, outcome).await;
    }
    debug!("Result aggregator exited");
}

async fn apply(registry: &NodeRegistry, outcome: Outcome) {
    let result = match outcome {
        Outcome::Good(peer) => registry.mark_good(peer.endpoint, peer).await,
        Outcome::Dead(endpoint) => registry.mark_dead(endpoint).await,
    };
    if let Err(e) = result {
        error!("Crawl invariant violated: {e}");
    }
}
