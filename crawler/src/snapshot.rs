//! Crawl metrics and the periodic snapshot publisher.

use crate::registry::NodeRegistry;
use crate::store::{NodeRecord, NodeStore};
use log::{debug, error};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counters shared by every worker.
#[derive(Debug, Default)]
pub struct Metrics {
    active_connections: AtomicUsize,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection as active until the returned guard drops.
    pub(crate) fn connection_started(&self) -> ActiveConnection<'_> {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        ActiveConnection { metrics: self }
    }

    pub(crate) fn record_inbound(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outbound(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn messages_in(&self) -> u64 {
        self.messages_in.load(Ordering::Relaxed)
    }

    pub fn messages_out(&self) -> u64 {
        self.messages_out.load(Ordering::Relaxed)
    }
}

/// Decrements the active connection count on drop, whichever way the
/// connection attempt ends.
#[derive(Debug)]
pub(crate) struct ActiveConnection<'a> {
    metrics: &'a Metrics,
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.metrics
            .active_connections
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// Crawl progress at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub active_connections: usize,
    pub total_nodes: usize,
    /// Endpoints waiting in the discovery queue.
    pub queued_nodes: usize,
    pub good_nodes: usize,
    pub dead_nodes: usize,
    pub messages_in: u64,
    pub messages_out: u64,
}

impl Snapshot {
    pub async fn capture(registry: &NodeRegistry, metrics: &Metrics) -> Self {
        let counts = registry.counts().await;
        Snapshot {
            active_connections: metrics.active_connections(),
            total_nodes: counts.total,
            queued_nodes: counts.discovered,
            good_nodes: counts.good,
            dead_nodes: counts.dead,
            messages_in: metrics.messages_in(),
            messages_out: metrics.messages_out(),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total: {}, queued: {}, connected: {}, good: {}, dead: {}, msgs in/out: {}/{}",
            self.total_nodes,
            self.queued_nodes,
            self.active_connections,
            self.good_nodes,
            self.dead_nodes,
            self.messages_in,
            self.messages_out
        )
    }
}

/// Where the publisher persists good nodes.
#[derive(Clone)]
pub(crate) struct Persistence {
    pub store: Arc<dyn NodeStore>,
    pub path: PathBuf,
}

/// Emits a [`Snapshot`] every tick and saves the good nodes.
pub(crate) struct Publisher {
    pub registry: Arc<NodeRegistry>,
    pub metrics: Arc<Metrics>,
    pub persistence: Option<Persistence>,
    pub snapshots: mpsc::Sender<Snapshot>,
    pub interval: Duration,
    /// Held while a save is running on the blocking pool.
    pub saving: Arc<Mutex<()>>,
}

impl Publisher {
    /// Publish until cancelled, then write the good nodes one last time once
    /// `settled` reports that every outcome has been recorded.
    pub(crate) async fn run(self, cancel: CancellationToken, settled: oneshot::Receiver<()>) {
        debug!("Snapshot publisher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.publish().await,
            }
        }

        if settled.await.is_err() {
            debug!("Result aggregator stopped early, saving what was recorded");
        }
        self.flush().await;
        debug!("Snapshot publisher exited");
    }

    async fn publish(&self) {
        let snapshot = Snapshot::capture(&self.registry, &self.metrics).await;
        debug!("{snapshot}");

        match self.snapshots.try_send(snapshot) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Snapshot consumer is behind, dropping tick"),
            Err(TrySendError::Closed(_)) => {}
        }

        if snapshot.good_nodes > 0 {
            self.save().await;
        }
    }

    /// Start a save in the background unless one is already running.
    async fn save(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let Ok(guard) = self.saving.clone().try_lock_owned() else {
            debug!("Previous save still running, skipping");
            return;
        };

        let records = self.registry.good_records().await;
        spawn_save(persistence.clone(), records, guard);
    }

    /// Wait for any running save, then save and wait for that too.
    async fn flush(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let guard = self.saving.clone().lock_owned().await;
        let records = self.registry.good_records().await;
        if records.is_empty() {
            return;
        }
        if let Err(e) = spawn_save(persistence.clone(), records, guard).await {
            error!("Final save of good nodes failed: {e}");
        }
    }
}

fn spawn_save(
    persistence: Persistence,
    records: Vec<NodeRecord>,
    guard: OwnedMutexGuard<()>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let Persistence { store, path } = persistence;
        if let Err(e) = store.save(&path, &records) {
            error!("Failed to save good nodes to {}: {e}", path.display());
        }
        drop(guard);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use nodescan_connection::{Endpoint, Peer};
    use std::path::Path;

    #[derive(Default)]
    struct RecordingStore {
        saves: std::sync::Mutex<Vec<Vec<NodeRecord>>>,
    }

    impl NodeStore for RecordingStore {
        fn save(&self, _path: &Path, records: &[NodeRecord]) -> Result<(), StoreError> {
            self.saves.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_active_guard_releases() {
        let metrics = Metrics::new();
        {
            let _a = metrics.connection_started();
            let _b = metrics.connection_started();
            assert_eq!(metrics.active_connections(), 2);
        }
        assert_eq!(metrics.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_capture_reads_registry_and_metrics() {
        let registry = NodeRegistry::new();
        let metrics = Metrics::new();
        let first: Endpoint = "1.1.1.1:8333".parse().unwrap();
        let second: Endpoint = "2.2.2.2:8333".parse().unwrap();
        registry.add_discovered([first, second]).await;
        metrics.record_inbound();
        metrics.record_outbound();
        metrics.record_outbound();

        let snapshot = Snapshot::capture(&registry, &metrics).await;
        assert_eq!(snapshot.total_nodes, 2);
        assert_eq!(snapshot.queued_nodes, 2);
        assert_eq!(snapshot.good_nodes, 0);
        assert_eq!((snapshot.messages_in, snapshot.messages_out), (1, 2));
    }

    fn publisher(
        registry: Arc<NodeRegistry>,
        store: Arc<RecordingStore>,
    ) -> (Publisher, mpsc::Receiver<Snapshot>) {
        let (tx, rx) = mpsc::channel(4);
        let publisher = Publisher {
            registry,
            metrics: Arc::new(Metrics::new()),
            persistence: Some(Persistence {
                store,
                path: PathBuf::from("unused.json"),
            }),
            snapshots: tx,
            interval: Duration::from_millis(10),
            saving: Arc::new(Mutex::new(())),
        };
        (publisher, rx)
    }

    #[tokio::test]
    async fn test_no_save_without_good_nodes() {
        let registry = Arc::new(NodeRegistry::new());
        let store = Arc::new(RecordingStore::default());
        let (publisher, mut rx) = publisher(registry, store.clone());

        publisher.publish().await;
        assert!(rx.recv().await.is_some());
        tokio::task::yield_now().await;
        assert!(store.saves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_saves_good_nodes() {
        let registry = Arc::new(NodeRegistry::new());
        good(&registry, "3.3.3.3:8333".parse().unwrap()).await;

        let store = Arc::new(RecordingStore::default());
        let (publisher, mut rx) = publisher(registry, store.clone());
        let saving = publisher.saving.clone();
        publisher.publish().await;

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.good_nodes, 1);

        // Wait for the blocking save to finish.
        drop(saving.lock().await);
        let saves = store.saves.lock().unwrap();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0][0].endpoint, "3.3.3.3:8333");
    }

    #[tokio::test]
    async fn test_full_channel_does_not_block() {
        let registry = Arc::new(NodeRegistry::new());
        let store = Arc::new(RecordingStore::default());
        let (publisher, _rx) = publisher(registry, store);

        for _ in 0..10 {
            tokio::time::timeout(Duration::from_secs(1), publisher.publish())
                .await
                .expect("publish must not wait on the consumer");
        }
    }

    async fn good(registry: &NodeRegistry, endpoint: Endpoint) {
        registry.add_discovered([endpoint]).await;
        registry.next_discovered().await;
        registry.mark_connecting(endpoint).await.unwrap();
        registry
            .mark_good(endpoint, Peer::new(endpoint))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let registry = Arc::new(NodeRegistry::new());
        let store = Arc::new(RecordingStore::default());
        let (publisher, mut rx) = publisher(registry, store.clone());
        let cancel = CancellationToken::new();
        let (settled_tx, settled_rx) = oneshot::channel();

        let handle = tokio::spawn(publisher.run(cancel.clone(), settled_rx));
        assert!(rx.recv().await.is_some());
        cancel.cancel();
        settled_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("publisher should exit")
            .unwrap();
        // Nothing good to save.
        assert!(store.saves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_saves_results_recorded_after_last_tick() {
        let registry = Arc::new(NodeRegistry::new());
        let store = Arc::new(RecordingStore::default());
        let (mut publisher, mut rx) = publisher(registry.clone(), store.clone());
        publisher.interval = Duration::from_secs(3600);
        let cancel = CancellationToken::new();
        let (settled_tx, settled_rx) = oneshot::channel();

        let handle = tokio::spawn(publisher.run(cancel.clone(), settled_rx));
        // The first tick fires at once, before anything is good.
        assert_eq!(rx.recv().await.unwrap().good_nodes, 0);
        cancel.cancel();

        // Classified after cancel, before the aggregator finishes.
        good(&registry, "4.4.4.4:8333".parse().unwrap()).await;
        settled_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("publisher should exit")
            .unwrap();

        let saves = store.saves.lock().unwrap();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0][0].endpoint, "4.4.4.4:8333");
    }

    #[tokio::test]
    async fn test_final_save_waits_for_running_save() {
        let registry = Arc::new(NodeRegistry::new());
        good(&registry, "5.5.5.5:8333".parse().unwrap()).await;
        let store = Arc::new(RecordingStore::default());
        let (publisher, _rx) = publisher(registry, store.clone());

        // A tick's save is in flight.
        let held = publisher.saving.clone().lock_owned().await;
        publisher.save().await;
        assert!(store.saves.lock().unwrap().is_empty());

        let flush = tokio::spawn(async move { publisher.flush().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!flush.is_finished());
        drop(held);
        flush.await.unwrap();
        assert_eq!(store.saves.lock().unwrap().len(), 1);
    }
}
