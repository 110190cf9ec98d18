use crate::aggregator::aggregate;
use crate::builder::CrawlerConfig;
use crate::connection::{Connector, PeerConnector};
use crate::registry::NodeRegistry;
use crate::snapshot::{Metrics, Persistence, Publisher, Snapshot};
use crate::store::{JsonFileStore, NodeStore};
use crate::worker::{feed, WorkQueue, Worker};
use log::{debug, error, info, warn};
use nodescan_connection::Endpoint;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Snapshots buffered for a slow consumer before ticks are dropped.
const SNAPSHOT_BUFFER: usize = 16;

/// A crawler for the bitcoin peer-to-peer network.
///
/// The crawler dials every endpoint it learns about, at most
/// `connection_limit` at a time, and classifies each one as good (handshake
/// completed) or dead. Endpoints announced by good peers are queued for
/// their own visit, so the crawl grows until cancelled.
///
/// The connector is generic so the engine can run against scripted
/// connections. Production code uses the default [`PeerConnector`].
pub struct Crawler<C: Connector = PeerConnector> {
    config: Arc<CrawlerConfig>,
    connector: C,
    store: Option<Arc<dyn NodeStore>>,
    registry: Arc<NodeRegistry>,
    metrics: Arc<Metrics>,
}

impl Crawler {
    /// Create a crawler dialing real peers over TCP.
    ///
    /// Good nodes are saved as JSON when the configuration names an output
    /// path.
    pub fn new(config: CrawlerConfig) -> Self {
        let connector = PeerConnector::new(config.network, config.connection_configuration());
        let store = config
            .output_path
            .as_ref()
            .map(|_| Arc::new(JsonFileStore) as Arc<dyn NodeStore>);
        Crawler {
            config: Arc::new(config),
            connector,
            store,
            registry: Arc::new(NodeRegistry::new()),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

impl<C: Connector> Crawler<C> {
    /// Swap the way connections are made.
    pub fn with_connector<D: Connector>(self, connector: D) -> Crawler<D> {
        Crawler {
            config: self.config,
            connector,
            store: self.store,
            registry: self.registry,
            metrics: self.metrics,
        }
    }

    /// Swap the persistence collaborator. Only used when an output path is
    /// configured.
    pub fn with_store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Current counts, outside the publisher's schedule.
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.registry, &self.metrics).await
    }

    /// Start crawling from `seeds`.
    ///
    /// Seeds already known to the registry are ignored. The crawl runs in
    /// background tasks until `cancel` fires or the returned session is shut
    /// down. Dropping the session aborts every task.
    ///
    /// # Arguments
    ///
    /// * `seeds` - Endpoints to visit first.
    /// * `cancel` - Shared stop signal. Child tokens derived from it work too.
    pub async fn crawl<I>(&self, seeds: I, cancel: CancellationToken) -> CrawlSession
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let added = self.registry.add_discovered(seeds).await;
        info!(
            "Crawling {} with {} connections from {added} seeds",
            self.config.network, self.config.connection_limit
        );

        let mut tasks = JoinSet::new();
        let limit = self.config.connection_limit.max(1);

        let (queue_tx, queue_rx) = mpsc::channel(limit);
        tasks.spawn(feed(self.registry.clone(), queue_tx, cancel.clone()));

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let queue: WorkQueue = Arc::new(Mutex::new(queue_rx));
        for id in 0..limit {
            let worker = Worker {
                id,
                connector: self.connector.clone(),
                registry: self.registry.clone(),
                metrics: self.metrics.clone(),
                outcomes: outcome_tx.clone(),
                peer_timeout: self.config.peer_timeout,
                idle_timeout: self.config.idle_timeout,
            };
            tasks.spawn(worker.run(queue.clone(), cancel.clone()));
        }
        // Workers hold the only senders, so the aggregator sees a close once
        // they have all exited.
        drop(outcome_tx);
        let (settled_tx, settled_rx) = oneshot::channel();
        let registry = self.registry.clone();
        tasks.spawn(async move {
            aggregate(registry, outcome_rx).await;
            let _ = settled_tx.send(());
        });

        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let persistence = match (&self.store, &self.config.output_path) {
            (Some(store), Some(path)) => Some(Persistence {
                store: store.clone(),
                path: path.clone(),
            }),
            _ => None,
        };
        let publisher = Publisher {
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            persistence,
            snapshots: snapshot_tx,
            interval: self.config.snapshot_interval,
            saving: Arc::new(Mutex::new(())),
        };
        tasks.spawn(publisher.run(cancel.clone(), settled_rx));

        CrawlSession {
            snapshots: snapshot_rx,
            tasks,
            cancel,
        }
    }
}

impl<C: Connector> fmt::Debug for Crawler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crawler")
            .field("config", &self.config)
            .field("persisting", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

/// Errors from stopping a crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// Some tasks were still running when the grace period ran out and had
    /// to be aborted.
    GraceExceeded { remaining: usize },
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownError::GraceExceeded { remaining } => {
                write!(f, "{remaining} crawl tasks aborted after grace period")
            }
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Handle to a running crawl.
#[derive(Debug)]
pub struct CrawlSession {
    snapshots: mpsc::Receiver<Snapshot>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl CrawlSession {
    /// Wait for the next periodic snapshot.
    ///
    /// Returns `None` once the publisher has stopped.
    pub async fn next_snapshot(&mut self) -> Option<Snapshot> {
        self.snapshots.recv().await
    }

    /// Signal every crawl task to stop without waiting for them.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the crawl and wait up to `grace` for its tasks to finish.
    ///
    /// Once every outcome has been recorded the good nodes are saved one
    /// last time, so a clean shutdown loses nothing. Tasks still running
    /// after `grace` are aborted.
    pub async fn shutdown(mut self, grace: Duration) -> Result<(), ShutdownError> {
        self.cancel.cancel();
        if timeout(grace, join_all(&mut self.tasks)).await.is_ok() {
            debug!("Crawl stopped");
            return Ok(());
        }

        let remaining = self.tasks.len();
        warn!("Aborting {remaining} crawl tasks");
        self.tasks.abort_all();
        join_all(&mut self.tasks).await;
        Err(ShutdownError::GraceExceeded { remaining })
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Crawl task panicked: {e}");
            }
        }
    }
}
