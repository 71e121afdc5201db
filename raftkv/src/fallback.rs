//! Fallback supervision: keep service available on a standalone local
//! store while the cluster is unreachable.
//!
//! The supervisor owns a clustered database and a separate standalone
//! store. A background monitor probes the cluster with periodic
//! linearizable read-only transactions; after enough consecutive failures
//! new transactions are directed at the standalone store, and after enough
//! consecutive successes they move back. The current direction is exposed
//! on a `watch` channel. Data written while fallen back is the
//! application's to reconcile on rejoin, which is why the thresholds favor
//! staying on the cluster.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::CommitError;
use crate::mvcc::Writes;
use crate::raft::RaftKv;
use crate::raft_types::LogId;
use crate::storage::KvSnapshot;
use crate::storage::KvStore;
use crate::txn::Transaction;
use crate::Transport;

/// Which side of the supervisor new transactions land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackTarget {
    Cluster,
    Standalone,
}

/// Tuning for the availability monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// How often to probe the cluster, in milliseconds.
    pub probe_interval: u64,
    /// How long one probe may take before counting as failed, in
    /// milliseconds.
    pub probe_timeout: u64,
    /// Consecutive probe failures before falling back.
    pub fallback_threshold: u32,
    /// Consecutive probe successes before rejoining.
    pub recovery_threshold: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        FallbackConfig {
            probe_interval: 1_000,
            probe_timeout: 2_000,
            fallback_threshold: 3,
            recovery_threshold: 2,
        }
    }
}

/// A database handle that degrades to a standalone local store when the
/// cluster is unavailable.
pub struct FallbackKv<N: Transport, S: KvStore> {
    cluster: RaftKv<N, S>,
    standalone: Arc<dyn KvStore>,
    rx_target: watch::Receiver<FallbackTarget>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<N: Transport, S: KvStore> FallbackKv<N, S> {
    /// Wrap a clustered database with a standalone fallback store.
    pub fn new(cluster: RaftKv<N, S>, standalone: Arc<dyn KvStore>, config: FallbackConfig) -> Self {
        let (tx_target, rx_target) = watch::channel(FallbackTarget::Cluster);
        let monitor = tokio::spawn(monitor_loop(cluster.clone(), config, tx_target));
        FallbackKv {
            cluster,
            standalone,
            rx_target,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    /// The side new transactions currently land on.
    pub fn target(&self) -> FallbackTarget {
        *self.rx_target.borrow()
    }

    /// Subscribe to direction changes.
    pub fn watch_target(&self) -> watch::Receiver<FallbackTarget> {
        self.rx_target.clone()
    }

    /// Open a transaction against whichever side is active.
    pub async fn begin(&self) -> Result<FallbackTransaction, CommitError> {
        match self.target() {
            FallbackTarget::Cluster => Ok(FallbackTransaction::Cluster(self.cluster.begin().await?)),
            FallbackTarget::Standalone => {
                let snapshot = self
                    .standalone
                    .snapshot()
                    .await
                    .map_err(|err| CommitError::Fatal(format!("error opening standalone snapshot: {}", err)))?;
                Ok(FallbackTransaction::Standalone(StandaloneTransaction {
                    store: self.standalone.clone(),
                    snapshot,
                    writes: Writes::new(),
                }))
            }
        }
    }

    /// Stop the monitor and shut the clustered database down.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
        self.cluster.shutdown().await
    }
}

async fn monitor_loop<N: Transport, S: KvStore>(
    cluster: RaftKv<N, S>,
    config: FallbackConfig,
    tx_target: watch::Sender<FallbackTarget>,
) {
    let mut failures = 0u32;
    let mut successes = 0u32;
    let mut target = FallbackTarget::Cluster;
    loop {
        tokio::time::sleep(Duration::from_millis(config.probe_interval)).await;

        let available = probe(&cluster, Duration::from_millis(config.probe_timeout)).await;
        if available {
            successes += 1;
            failures = 0;
        } else {
            failures += 1;
            successes = 0;
        }

        let next = match target {
            FallbackTarget::Cluster if failures >= config.fallback_threshold => FallbackTarget::Standalone,
            FallbackTarget::Standalone if successes >= config.recovery_threshold => FallbackTarget::Cluster,
            current => current,
        };
        if next != target {
            tracing::warn!(from=?target, to=?next, "fallback direction changed");
            target = next;
            if tx_target.send(target).is_err() {
                return;
            }
        }
    }
}

/// One availability probe: a linearizable read-only commit, which requires
/// a live leader lease (or a majority round trip) to succeed.
async fn probe<N: Transport, S: KvStore>(cluster: &RaftKv<N, S>, limit: Duration) -> bool {
    let attempt = async {
        let tx = cluster.begin().await?;
        tx.commit().await
    };
    matches!(timeout(limit, attempt).await, Ok(Ok(_)))
}

/// A transaction against either side of a [`FallbackKv`].
#[derive(derive_more::From)]
pub enum FallbackTransaction {
    Cluster(Transaction),
    Standalone(StandaloneTransaction),
}

impl FallbackTransaction {
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        match self {
            FallbackTransaction::Cluster(tx) => tx.get(key),
            FallbackTransaction::Standalone(tx) => tx.get(key),
        }
    }

    pub fn put(&mut self, key: &[u8], value: Bytes) -> Result<(), CommitError> {
        match self {
            FallbackTransaction::Cluster(tx) => tx.put(key, value),
            FallbackTransaction::Standalone(tx) => {
                tx.put(key, value);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<(), CommitError> {
        match self {
            FallbackTransaction::Cluster(tx) => tx.remove(key),
            FallbackTransaction::Standalone(tx) => {
                tx.remove(key);
                Ok(())
            }
        }
    }

    pub async fn commit(self) -> Result<Option<LogId>, CommitError> {
        match self {
            FallbackTransaction::Cluster(tx) => tx.commit().await.map(Some),
            FallbackTransaction::Standalone(tx) => {
                tx.commit().await?;
                Ok(None)
            }
        }
    }

    pub fn rollback(self) {
        if let FallbackTransaction::Cluster(tx) = self {
            tx.rollback();
        }
    }
}

/// A minimal transaction against the standalone store: snapshot reads
/// under a local write overlay, committed as one atomic batch with no
/// conflict detection (the standalone store has a single writer by
/// construction).
pub struct StandaloneTransaction {
    store: Arc<dyn KvStore>,
    snapshot: Box<dyn KvSnapshot>,
    writes: Writes,
}

impl StandaloneTransaction {
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        if let Some(found) = self.writes.get(key) {
            return found;
        }
        self.snapshot.get(key)
    }

    pub fn put(&mut self, key: &[u8], value: Bytes) {
        self.writes.put(key, value);
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.writes.remove(key);
    }

    pub async fn commit(self) -> Result<(), CommitError> {
        self.store
            .mutate(self.writes, true)
            .await
            .map_err(|err| CommitError::Fatal(format!("error committing standalone transaction: {}", err)))
    }
}
