//! Public interface to a running Raft key/value node.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::CommitError;
use crate::error::RaftResult;
use crate::log::LogEntry;
use crate::message::Message;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::mvcc::KeyRanges;
use crate::mvcc::Writes;
use crate::raft_types::ConfigChange;
use crate::raft_types::LogId;
use crate::raft_types::MessageSummary;
use crate::storage::KvSnapshot;
use crate::storage::KvStore;
use crate::txn::Consistency;
use crate::txn::Transaction;
use crate::Transport;

struct RaftKvInner<N: Transport, S: KvStore> {
    config: Arc<Config>,
    tx_api: mpsc::UnboundedSender<CoreMsg>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// A replicated, transactional key/value database node.
///
/// This type spawns the Raft core task and is the interface to it: open
/// transactions with [`RaftKv::begin`], hand incoming peer messages to
/// [`RaftKv::deliver`], observe progress through [`RaftKv::metrics`].
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any interface returns [`CommitError::ShuttingDown`], the node is
/// stopping (possibly for data safety after a storage error) and
/// [`RaftKv::shutdown`] should be awaited to complete the teardown.
pub struct RaftKv<N: Transport, S: KvStore> {
    inner: Arc<RaftKvInner<N, S>>,
}

impl<N: Transport, S: KvStore> RaftKv<N, S> {
    /// Create and spawn a new Raft node.
    ///
    /// ### `config`
    /// The node's runtime config, carrying its identity and log directory.
    /// The same `Config` must be reused across restarts of the same node.
    ///
    /// ### `network`
    /// The [`Transport`] used to send framed messages to peers. Incoming
    /// messages are the application's responsibility: decode frames off the
    /// wire and pass them to [`RaftKv::deliver`].
    ///
    /// ### `storage`
    /// The [`KvStore`] holding the node's durable state.
    #[tracing::instrument(level = "debug", skip(config, network, storage), fields(id=%config.identity))]
    pub fn new(config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(config.identity.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(config.clone(), network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftKvInner {
            config,
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Open a new linearizable transaction.
    pub async fn begin(&self) -> Result<Transaction, CommitError> {
        self.begin_with(Consistency::Linearizable).await
    }

    /// Open a new transaction at the given consistency level.
    ///
    /// The returned handle captures the node's current `(term, index)` base
    /// and a view of the state machine with all unapplied log entries
    /// layered on top. Reads and writes on the handle are local; only
    /// `commit` contacts the cluster.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn begin_with(&self, consistency: Consistency) -> Result<Transaction, CommitError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(CoreMsg::Begin { consistency, tx })
            .map_err(|_| CommitError::ShuttingDown)?;
        let seed = rx.await.map_err(|_| CommitError::ShuttingDown)??;
        Ok(Transaction::new(
            seed.tx_id,
            consistency,
            seed.base,
            seed.snapshot,
            seed.layers,
            Duration::from_millis(self.inner.config.commit_timeout),
            self.inner.tx_api.clone(),
        ))
    }

    /// Hand an incoming peer message to the node.
    ///
    /// This is the receive half of the transport contract: the application
    /// decodes frames (for instance with
    /// [`MessageCodec`](crate::message::MessageCodec)) and delivers them
    /// here. Messages arriving for a stopped node are dropped.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub fn deliver(&self, msg: Message) {
        let _ = self.inner.tx_api.send(CoreMsg::Recv(msg));
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// // wait for the node to apply log entry 2:
    /// node.wait(None).applied(2, "catch up").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut this node down.
    ///
    /// All open commits fail with [`CommitError::ShuttingDown`], timers and
    /// replication streams are cancelled, and the core task is joined.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: Transport, S: KvStore> Clone for RaftKv<N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type CommitResponder = oneshot::Sender<Result<LogId, CommitError>>;

/// The seed state for a new transaction, assembled by the core.
pub(crate) struct TxSeed {
    pub tx_id: u64,
    pub base: LogId,
    pub snapshot: Box<dyn KvSnapshot>,
    pub layers: Vec<Arc<LogEntry>>,
}

/// A transaction commit handed from the client to the core.
pub(crate) struct CommitHandoff {
    pub tx_id: u64,
    pub base: LogId,
    pub read_only: bool,
    pub reads: KeyRanges,
    pub writes: Writes,
    pub config_change: Option<ConfigChange>,
    pub deadline: Instant,
    pub responder: CommitResponder,
}

/// A message coming into the Raft core.
pub(crate) enum CoreMsg {
    /// A decoded frame from a peer.
    Recv(Message),
    /// Open a transaction.
    Begin {
        consistency: Consistency,
        tx: oneshot::Sender<Result<TxSeed, CommitError>>,
    },
    /// Commit an open transaction.
    Commit(Box<CommitHandoff>),
    /// Abandon an open transaction.
    Rollback { tx_id: u64 },
}
