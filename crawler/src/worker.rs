//! Queue feeder and connector workers.
//!
//! The feeder moves endpoints from the registry's discovery queue into a
//! bounded channel sized to the connection limit. A fixed pool of workers
//! drains that channel, one endpoint at a time each, so at most
//! `connection_limit` endpoints are ever `Connecting`.

use crate::aggregator::Outcome;
use crate::connection::{Connector, PeerConnection};
use crate::dispatcher::Dispatcher;
use crate::registry::NodeRegistry;
use crate::snapshot::Metrics;
use bitcoin::p2p::message::NetworkMessage;
use log::{debug, error, info};
use nodescan_connection::{generate_nonce, Endpoint};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Work queue receiver shared by the worker pool.
pub(crate) type WorkQueue = Arc<Mutex<mpsc::Receiver<Endpoint>>>;

/// Feed discovered endpoints into the work queue until cancelled.
///
/// A queue slot is reserved before an endpoint is taken from the registry,
/// so cancellation never strands an endpoint between the two.
pub(crate) async fn feed(
    registry: Arc<NodeRegistry>,
    queue: mpsc::Sender<Endpoint>,
    cancel: CancellationToken,
) {
    debug!("Queue feeder started");
    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = queue.reserve() => match permit {
                Ok(permit) => permit,
                // Every worker is gone.
                Err(_) => break,
            },
        };

        let endpoint = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            endpoint = registry.next_discovered() => endpoint,
        };
        debug!("Queued {endpoint}");
        permit.send(endpoint);
    }
    debug!("Queue feeder exited");
}

/// Settings and handles one worker needs.
pub(crate) struct Worker<C: Connector> {
    pub id: usize,
    pub connector: C,
    pub registry: Arc<NodeRegistry>,
    pub metrics: Arc<Metrics>,
    pub outcomes: mpsc::UnboundedSender<Outcome>,
    pub peer_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl<C: Connector> Worker<C> {
    pub(crate) async fn run(self, queue: WorkQueue, cancel: CancellationToken) {
        debug!("Worker {} started", self.id);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = async { queue.lock().await.recv().await } => next,
            };
            let Some(endpoint) = next else {
                break;
            };
            self.process(endpoint, &cancel).await;
        }
        debug!("Worker {} exited", self.id);
    }

    /// Dial, handshake and then serve one endpoint until its session ends.
    async fn process(&self, endpoint: Endpoint, cancel: &CancellationToken) {
        if let Err(e) = self.registry.mark_connecting(endpoint).await {
            error!("Worker {} can't dial {endpoint}: {e}", self.id);
            return;
        }
        let _active = self.metrics.connection_started();

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Dial to {endpoint} abandoned on shutdown");
                return;
            }
            attempt = timeout(self.peer_timeout, self.connector.connect(endpoint)) => attempt,
        };

        let mut connection = match attempt {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                debug!("{endpoint} is unreachable: {e}");
                self.report(Outcome::Dead(endpoint));
                return;
            }
            Err(_) => {
                debug!("{endpoint} timed out after {:?}", self.peer_timeout);
                self.report(Outcome::Dead(endpoint));
                return;
            }
        };

        let peer = connection.peer();
        info!("Handshake with {peer}");
        self.report(Outcome::Good(peer));

        let nonce = generate_nonce();
        if let Err(e) = self.registry.set_ping_nonce(endpoint, nonce).await {
            error!("Failed to record ping for {endpoint}: {e}");
        }
        if let Err(e) = connection.send(NetworkMessage::Ping(nonce)).await {
            debug!("Failed to ping {endpoint}: {e}");
            return;
        }
        self.metrics.record_outbound();

        let exit = Dispatcher::new(endpoint, &self.registry, &self.metrics, self.idle_timeout)
            .run(&mut connection, cancel)
            .await;
        debug!("Session with {endpoint} ended: {exit}");
    }

    fn report(&self, outcome: Outcome) {
        if self.outcomes.send(outcome).is_err() {
            debug!("Result aggregator is gone, dropping outcome");
        }
    }
}
