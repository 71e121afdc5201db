//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::config::MAX_CLOCK_DRIFT;
use crate::core::install_snapshot::SnapshotReceive;
use crate::error::CommitError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::LogStore;
use crate::message::Header;
use crate::message::Message;
use crate::message::Ping;
use crate::metrics::RaftMetrics;
use crate::mvcc::KeyRanges;
use crate::mvcc::Writes;
use crate::quorum;
use crate::raft::CommitHandoff;
use crate::raft::CommitResponder;
use crate::raft::CoreMsg;
use crate::raft::TxSeed;
use crate::raft_types::Clock;
use crate::raft_types::ClusterId;
use crate::raft_types::ConfigChange;
use crate::raft_types::LogId;
use crate::raft_types::Membership;
use crate::raft_types::MessageSummary;
use crate::raft_types::NodeId;
use crate::raft_types::Timestamp;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage;
use crate::storage::KvStore;
use crate::txn::next_tx_id;
use crate::txn::Consistency;
use crate::Transport;

/// The cap on retained unapplied log entries, complementing the configured
/// memory bound.
const MAX_RETAINED_ENTRIES: usize = 1024;

/// All possible roles of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating entries from a leader (or is unconfigured
    /// and waiting to be initialized or adopted into a cluster).
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the cluster leader.
    Leader,
    /// The node is shutting down.
    Shutdown,
}

impl State {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// An open, executing transaction tracked by the core.
///
/// Its base pins the apply floor so conflict checks against it keep working
/// for as long as the retention policy allows.
pub(crate) struct OpenTx {
    pub base: LogId,
    #[allow(dead_code)]
    pub created_at: Instant,
}

/// Where a pending commit stands.
pub(crate) enum CommitStage {
    /// Accepted, not yet assigned commit coordinates.
    Ready,
    /// Assigned commit coordinates; completes once `commit_index` covers
    /// them (and the lease promise, if any, is met).
    Waiting {
        commit: LogId,
        min_lease: Option<Timestamp>,
    },
}

/// A locally originated commit in flight.
pub(crate) struct PendingCommit {
    pub base: LogId,
    pub read_only: bool,
    pub reads: KeyRanges,
    pub writes: Writes,
    pub config_change: Option<ConfigChange>,
    pub deadline: Instant,
    pub stage: CommitStage,
    pub responder: Option<CommitResponder>,
    /// Follower side: whether a `CommitRequest` has been sent to the
    /// current leader.
    pub forwarded: bool,
    /// Follower side: the fsynced temp file staging this commit's
    /// mutations.
    pub temp_file: Option<std::path::PathBuf>,
}

/// The core type implementing the Raft protocol.
pub struct RaftCore<N: Transport, S: KvStore> {
    /// This node's identity.
    pub(crate) id: NodeId,
    /// This node's runtime config.
    pub(crate) config: Arc<Config>,
    pub(crate) network: Arc<N>,
    pub(crate) storage: Arc<S>,
    /// The persistent log plus its in-memory tail.
    pub(crate) log: Arc<LogStore>,
    pub(crate) clock: Clock,

    /// The target role of the node; role loops exit when it changes.
    pub(crate) target_state: State,

    /// The cluster this node belongs to; zero while unconfigured.
    pub(crate) cluster_id: ClusterId,
    /// The current cluster membership: the last applied config with every
    /// unapplied entry's config change folded in, in log order.
    pub(crate) membership: Membership,
    pub(crate) last_applied_config: Membership,

    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) current_leader: Option<NodeId>,

    /// The highest index known to be committed cluster-wide. Volatile.
    pub(crate) commit_index: u64,
    /// The identity of the last entry applied to the state machine.
    pub(crate) last_applied: LogId,

    /// The active leader lease: on the leader, derived from follower acks;
    /// on a follower, the latest value advertised by the leader.
    pub(crate) lease: Option<Timestamp>,

    /// When the current leader was last heard from.
    pub(crate) last_leader_contact: Option<Instant>,
    pub(crate) next_election_timeout: Option<Instant>,

    /// Executing transactions, by ID.
    pub(crate) open_txs: HashMap<u64, OpenTx>,
    /// Commits in flight, by transaction ID.
    pub(crate) commits: HashMap<u64, PendingCommit>,
    /// An in-progress snapshot install, if any.
    pub(crate) snapshot_rx: Option<SnapshotReceive>,

    pub(crate) rx_api: mpsc::UnboundedReceiver<CoreMsg>,
    pub(crate) tx_metrics: watch::Sender<RaftMetrics>,
    pub(crate) rx_shutdown: oneshot::Receiver<()>,
}

impl<N: Transport, S: KvStore> RaftCore<N, S> {
    pub(crate) fn spawn(
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<CoreMsg>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        tokio::spawn(
            async move {
                let core = Self::init(config, network, storage, rx_api, tx_metrics, rx_shutdown).await?;
                core.main().await
            }
            .instrument(tracing::debug_span!("spawn")),
        )
    }

    /// Recover durable state and assemble the core.
    async fn init(
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<CoreMsg>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> RaftResult<Self> {
        let stored = storage::read_stored_state(storage.as_ref()).await.map_err(RaftError::Storage)?;
        let log = LogStore::open(config.log_dir.clone(), stored.last_applied).await.map_err(RaftError::Storage)?;

        let mut core = RaftCore {
            id: config.identity.clone(),
            config,
            network,
            storage,
            log: Arc::new(log),
            clock: Clock::new(),
            target_state: State::Follower,
            cluster_id: stored.cluster_id,
            membership: Membership::new(),
            last_applied_config: stored.last_applied_config,
            current_term: stored.current_term,
            voted_for: stored.voted_for,
            current_leader: None,
            // Entries at or below the applied floor were committed by
            // definition; everything beyond must be re-proven.
            commit_index: stored.last_applied.index,
            last_applied: stored.last_applied,
            lease: None,
            last_leader_contact: None,
            next_election_timeout: None,
            open_txs: HashMap::new(),
            commits: HashMap::new(),
            snapshot_rx: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        core.rebuild_membership();

        core.target_state = if !core.membership.contains_key(&core.id) {
            // Unconfigured, or configured out: passively replicate.
            State::Follower
        } else if core.membership.len() == 1 {
            // A single-member cluster campaigns immediately and wins.
            State::Candidate
        } else {
            State::Follower
        };

        tracing::info!(
            id = %core.id,
            cluster = core.cluster_id,
            term = core.current_term,
            last_applied = %core.last_applied,
            last_log = %core.log.last_log_id(),
            members = core.membership.len(),
            "raft node initialized"
        );
        Ok(core)
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.id))]
    async fn main(mut self) -> RaftResult<()> {
        self.report_metrics();
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    self.drain_on_shutdown().await;
                    tracing::info!(id=%self.id, "node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Fail everything still open; called once on the way out.
    async fn drain_on_shutdown(&mut self) {
        for (_, commit) in self.commits.drain() {
            if let Some(path) = &commit.temp_file {
                self.log.remove_temp(path).await;
            }
            if let Some(tx) = commit.responder {
                let _ = tx.send(Err(CommitError::ShuttingDown));
            }
        }
        self.open_txs.clear();
        self.report_metrics();
    }

    /// Report a metrics payload on the current state of the node.
    pub(crate) fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id.clone(),
            state: self.target_state,
            cluster_id: self.cluster_id,
            current_term: self.current_term,
            last_log_index: self.log.last_log_id().index,
            last_applied: self.last_applied.index,
            commit_index: self.commit_index,
            current_leader: self.current_leader.clone(),
            membership: self.membership.clone(),
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=%self.id, "error reporting metrics");
        }
    }

    /// Update the target role, which causes the active role loop to exit.
    pub(crate) fn set_target_state(&mut self, state: State) {
        if state != self.target_state {
            tracing::debug!(id=%self.id, from=?self.target_state, to=?state, "role transition");
        }
        self.target_state = state;
    }

    /// Durably advance the current term, atomically rewriting the vote in
    /// the same batch, then update the in-memory copies.
    pub(crate) async fn persist_term(&mut self, term: u64, voted_for: Option<NodeId>) -> RaftResult<()> {
        let mut batch = Writes::new();
        storage::put_term(&mut batch, term, voted_for.as_deref());
        self.storage.mutate(batch, true).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Durably record a vote within the current term.
    pub(crate) async fn persist_vote(&mut self, voted_for: NodeId) -> RaftResult<()> {
        let mut batch = Writes::new();
        storage::put_voted_for(&mut batch, Some(&voted_for));
        self.storage.mutate(batch, true).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.voted_for = Some(voted_for);
        Ok(())
    }

    /// Durably adopt a cluster ID (happens at most once per store).
    pub(crate) async fn persist_cluster_id(&mut self, cluster_id: ClusterId) -> RaftResult<()> {
        let mut batch = Writes::new();
        storage::put_cluster_id(&mut batch, cluster_id);
        self.storage.mutate(batch, true).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.cluster_id = cluster_id;
        Ok(())
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage
    /// error.
    pub(crate) fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error=?err, id=%self.id, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::Storage(err)
    }

    /// Recompute the current membership from the applied config plus the
    /// unapplied log tail, in order.
    pub(crate) fn rebuild_membership(&mut self) {
        let mut membership = self.last_applied_config.clone();
        for entry in self.log.tail() {
            if let Some(change) = &entry.data.config_change {
                change.apply_to(&mut membership);
            }
        }
        self.membership = membership;
    }

    /// Whether this node takes part in elections.
    pub(crate) fn is_voting_member(&self) -> bool {
        self.membership.contains_key(&self.id)
    }

    /// Get the next election timeout, generating a new value if unset.
    pub(crate) fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Reset the election timeout; with `heartbeat = true` also record the
    /// leader contact used for vote suppression.
    pub(crate) fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_leader_contact = Some(now);
        }
    }

    /// Monotonically advance the active lease under wrapping comparison.
    pub(crate) fn advance_lease(&mut self, lease: Timestamp) {
        self.lease = Some(match self.lease {
            Some(current) if !current.before(lease) => current,
            _ => lease,
        });
    }

    /// The lease term added to an ack quorum: the minimum election timeout
    /// discounted by the worst assumed clock drift.
    pub(crate) fn lease_extension(&self) -> i64 {
        (self.config.min_election_timeout as f64 * (1.0 - MAX_CLOCK_DRIFT)) as i64
    }

    /// True while the node holds (or observes) an unexpired lease.
    pub(crate) fn lease_valid(&self) -> bool {
        match self.lease {
            Some(lease) => self.clock.now().before(lease),
            None => false,
        }
    }

    /// A header for a message to `recipient` at the current term.
    pub(crate) fn header_to(&self, recipient: &NodeId) -> Header {
        Header {
            cluster_id: self.cluster_id,
            sender: self.id.clone(),
            recipient: recipient.clone(),
            term: self.current_term,
        }
    }

    /// Send a message to a peer at its configured address; failures are
    /// logged and otherwise ignored (the protocol retries by design).
    ///
    /// The address hint is empty for peers outside the current membership
    /// (e.g. replying to a leader this node has not yet been configured to
    /// know); transports fall back to the live connection in that case.
    pub(crate) async fn send_to(&self, target: &NodeId, msg: Message) {
        let address = self.membership.get(target).cloned().unwrap_or_default();
        if let Err(err) = self.network.send(target, &address, msg).await {
            tracing::warn!(target=%target, error=%err, "error sending message to peer");
        }
    }

    /// Apply the common preprocessing rules shared by every role. Returns
    /// `true` when the message should be processed further.
    pub(crate) async fn preprocess(&mut self, msg: &Message) -> RaftResult<bool> {
        let header = msg.header();
        if header.cluster_id == 0 {
            tracing::debug!(msg=%msg.summary(), "dropping message without cluster id");
            return Ok(false);
        }
        if self.cluster_id != 0 && header.cluster_id != self.cluster_id {
            tracing::warn!(msg=%msg.summary(), "dropping message from foreign cluster");
            return Ok(false);
        }
        if header.recipient != self.id || header.sender == self.id {
            tracing::debug!(msg=%msg.summary(), "dropping misaddressed message");
            return Ok(false);
        }
        if self.cluster_id == 0 {
            // An unconfigured node adopts the cluster of the first leader
            // that speaks to it; everything else is premature.
            if !msg.is_leader_message() {
                tracing::debug!(msg=%msg.summary(), "unconfigured node ignoring non-leader message");
                return Ok(false);
            }
            self.persist_cluster_id(header.cluster_id).await?;
            tracing::info!(id=%self.id, cluster=self.cluster_id, "adopted cluster id from leader");
        }
        if header.term < self.current_term {
            tracing::debug!(msg=%msg.summary(), "dropping message from stale term");
            return Ok(false);
        }
        if header.term > self.current_term {
            // Refuse to let a disconnected peer disrupt a healthy leader:
            // a RequestVote may not advance our term while we have heard
            // from the leader within the minimum election timeout.
            if matches!(msg, Message::Vote(_)) && self.heard_from_leader_recently() {
                tracing::debug!(msg=%msg.summary(), "suppressing vote request while leader is live");
                return Ok(false);
            }
            self.persist_term(header.term, None).await?;
            if msg.is_leader_message() {
                self.current_leader = Some(header.sender.clone());
            } else {
                self.current_leader = None;
            }
            if !self.target_state.is_follower() {
                self.set_target_state(State::Follower);
            }
            self.report_metrics();
        }
        Ok(true)
    }

    pub(crate) fn heard_from_leader_recently(&self) -> bool {
        match self.last_leader_contact {
            Some(at) => at.elapsed() < Duration::from_millis(self.config.min_election_timeout),
            None => false,
        }
    }

    /// Answer a reachability probe.
    pub(crate) async fn handle_ping(&mut self, ping: Ping) {
        let reply = Message::Pong(Ping {
            header: self.header_to(&ping.header.sender),
            timestamp: ping.timestamp,
        });
        self.send_to(&ping.header.sender, reply).await;
    }

    /// Open a new transaction view for a client. The view is built the
    /// same way at either consistency level; the difference is all in how
    /// the commit is handled.
    pub(crate) async fn handle_begin(
        &mut self,
        _consistency: Consistency,
        tx: oneshot::Sender<Result<TxSeed, CommitError>>,
    ) {
        let snapshot = match self.storage.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(error=?err, "error opening store snapshot");
                let _ = tx.send(Err(CommitError::Fatal(format!("error opening snapshot: {}", err))));
                return;
            }
        };
        let tx_id = next_tx_id();
        let base = self.log.last_log_id();
        self.open_txs.insert(tx_id, OpenTx {
            base,
            created_at: Instant::now(),
        });
        let _ = tx.send(Ok(TxSeed {
            tx_id,
            base,
            snapshot,
            layers: self.log.tail(),
        }));
    }

    /// Abandon an open transaction.
    pub(crate) async fn handle_rollback(&mut self, tx_id: u64) {
        self.open_txs.remove(&tx_id);
        if let Some(commit) = self.commits.remove(&tx_id) {
            if let Some(path) = &commit.temp_file {
                self.log.remove_temp(path).await;
            }
        }
    }

    /// Accept a commit handoff; the active role decides how to progress it.
    pub(crate) fn register_commit(&mut self, handoff: Box<CommitHandoff>) {
        let handoff = *handoff;
        self.open_txs.remove(&handoff.tx_id);
        self.commits.insert(handoff.tx_id, PendingCommit {
            base: handoff.base,
            read_only: handoff.read_only,
            reads: handoff.reads,
            writes: handoff.writes,
            config_change: handoff.config_change,
            deadline: handoff.deadline,
            stage: CommitStage::Ready,
            responder: Some(handoff.responder),
            forwarded: false,
            temp_file: None,
        });
    }

    /// Complete one pending commit.
    pub(crate) async fn finish_commit(&mut self, tx_id: u64, result: Result<LogId, CommitError>) {
        if let Some(commit) = self.commits.remove(&tx_id) {
            if let Some(path) = &commit.temp_file {
                self.log.remove_temp(path).await;
            }
            if let Some(tx) = commit.responder {
                let _ = tx.send(result);
            }
        }
    }

    /// The earliest commit deadline, for the role loops' timer branch.
    pub(crate) fn next_commit_deadline(&self) -> tokio::time::Instant {
        let fallback = Instant::now() + Duration::from_secs(3600);
        let earliest = self.commits.values().map(|c| c.deadline).min().unwrap_or(fallback);
        tokio::time::Instant::from_std(earliest)
    }

    /// Fail commits whose deadline has passed with the retry error.
    pub(crate) async fn expire_commits(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> =
            self.commits.iter().filter(|(_, c)| c.deadline <= now).map(|(id, _)| *id).collect();
        for tx_id in expired {
            tracing::debug!(tx = tx_id, "commit timed out");
            self.finish_commit(tx_id, Err(CommitError::Conflict("commit timed out".into()))).await;
        }
    }

    /// Check waiting commits against the current commit index, log
    /// contents, and lease.
    pub(crate) async fn check_waiting_commits(&mut self) {
        let candidates: Vec<(u64, LogId, Option<Timestamp>)> = self
            .commits
            .iter()
            .filter_map(|(id, c)| match &c.stage {
                CommitStage::Waiting { commit, min_lease } => Some((*id, *commit, *min_lease)),
                CommitStage::Ready => None,
            })
            .collect();

        for (tx_id, commit, min_lease) in candidates {
            // The entry may have been overwritten by a conflicting entry
            // from a newer term, or lost to a snapshot install.
            let verdict = match self.log.term_at(commit.index) {
                Some(term) if term == commit.term => {
                    if self.commit_index >= commit.index {
                        Some(Ok(()))
                    } else {
                        None
                    }
                }
                Some(term) => Some(Err(format!(
                    "log entry {} was overwritten by term {}",
                    commit, term
                ))),
                None => {
                    if commit.index <= self.last_applied.index {
                        // Gone below the floor before we could verify it.
                        Some(Err(format!(
                            "log entry {} is no longer verifiable after state transfer",
                            commit
                        )))
                    } else {
                        // Beyond our log: on a follower the entry simply
                        // has not arrived yet. Keep waiting; a conflicting
                        // term or the commit deadline settles it.
                        None
                    }
                }
            };
            match verdict {
                Some(Ok(())) => {
                    if let Some(min_lease) = min_lease {
                        let covered = match self.lease {
                            Some(lease) => !lease.before(min_lease),
                            None => false,
                        };
                        if !covered {
                            continue;
                        }
                    }
                    self.finish_commit(tx_id, Ok(commit)).await;
                }
                Some(Err(reason)) => {
                    self.finish_commit(tx_id, Err(CommitError::Conflict(reason))).await;
                }
                None => {}
            }
        }
    }

    /// The lowest log index still needed by an open transaction or pending
    /// commit, used to hold back application of the log.
    fn transaction_floor(&self) -> Option<u64> {
        let open = self.open_txs.values().map(|t| t.base.index);
        let pending = self.commits.values().map(|c| c.base.index);
        open.chain(pending).min()
    }

    /// Apply committed entries to the state machine, honoring the log
    /// retention policy.
    ///
    /// Committed entries are retained in memory to keep conflict checks
    /// possible for open transactions, and (on the leader) to keep slow
    /// followers fed without a snapshot install. The floors are overridden
    /// once the retained tail exceeds its memory/count budget or its oldest
    /// entry outlives `max_transaction_duration`.
    pub(crate) async fn maybe_apply_log(&mut self, follower_floor: Option<u64>) -> RaftResult<()> {
        let committed = std::cmp::min(self.commit_index, self.log.last_log_id().index);
        if committed <= self.last_applied.index {
            return Ok(());
        }

        let mut target = committed;
        if let Some(floor) = follower_floor {
            target = std::cmp::min(target, floor);
        }
        if let Some(floor) = self.transaction_floor() {
            target = std::cmp::min(target, floor);
        }

        let forced = self.log.retained_bytes() > self.config.max_applied_log_memory
            || self.log.len() > MAX_RETAINED_ENTRIES
            || self
                .log
                .oldest_age()
                .map(|age| age > Duration::from_millis(self.config.max_transaction_duration))
                .unwrap_or(false);
        if forced {
            target = committed;
        }
        if target <= self.last_applied.index {
            return Ok(());
        }

        self.apply_log_entries(target).await
    }

    /// Apply entries through `target` in one atomic, durable batch.
    async fn apply_log_entries(&mut self, target: u64) -> RaftResult<()> {
        let mut batch = Writes::new();
        let mut applied_config = self.last_applied_config.clone();
        let mut config_changed = false;
        let mut applied = self.last_applied;

        for index in (self.last_applied.index + 1)..=target {
            let entry = match self.log.entry(index) {
                Some(entry) => entry,
                None => {
                    return Err(self.map_fatal_storage_error(anyhow::anyhow!(
                        "committed log entry {} missing from retained tail",
                        index
                    )))
                }
            };
            batch.absorb(&storage::prefix_writes(&entry.data.writes));
            if let Some(change) = &entry.data.config_change {
                change.apply_to(&mut applied_config);
                config_changed = true;
            }
            applied = entry.log_id;
        }

        storage::put_last_applied(&mut batch, applied);
        if config_changed {
            storage::put_last_applied_config(&mut batch, &applied_config);
        }
        self.storage.mutate(batch, true).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.log.discard_applied(applied).await.map_err(|err| self.map_fatal_storage_error(err))?;

        tracing::debug!(id=%self.id, applied=%applied, "applied log entries to state machine");
        self.last_applied = applied;
        self.last_applied_config = applied_config;
        self.rebuild_membership();
        Ok(())
    }

    /// Run the post-commit-advance pipeline: settle waiting commits, then
    /// apply what retention allows.
    pub(crate) async fn advance(&mut self, follower_floor: Option<u64>) -> RaftResult<()> {
        self.check_waiting_commits().await;
        self.maybe_apply_log(follower_floor).await?;
        self.report_metrics();
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Leader-side state for one follower.
pub(crate) struct FollowerRep {
    /// The channel into the follower's replication stream task.
    pub repl: ReplicationStream,
    /// The highest index known replicated to the follower.
    pub matched: u64,
    /// The latest of our own timestamps the follower has echoed.
    pub timestamp: Option<Timestamp>,
    /// When set, terminate this stream once `matched` covers the given
    /// config entry (the peer was removed from the cluster).
    pub remove_after_commit: Option<u64>,
}

/// Volatile state specific to the cluster leader.
pub(crate) struct LeaderState<'a, N: Transport, S: KvStore> {
    pub(crate) core: &'a mut RaftCore<N, S>,
    /// Replication state per peer.
    pub(crate) nodes: BTreeMap<NodeId, FollowerRep>,
    /// The index of an appended but not yet committed config-change entry;
    /// at most one may be in flight.
    pub(crate) pending_config_change: Option<u64>,
    /// Set once a committed config change removed this node: finish up and
    /// step down.
    pub(crate) stepping_down: bool,

    pub(crate) replication_tx: mpsc::UnboundedSender<ReplicaEvent>,
    pub(crate) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
}

impl<'a, N: Transport, S: KvStore> LeaderState<'a, N, S> {
    pub(crate) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            pending_config_change: None,
            stepping_down: false,
            replication_tx,
            replication_rx,
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="leader"))]
    pub(crate) async fn run(mut self) -> RaftResult<()> {
        let targets: Vec<NodeId> =
            self.core.membership.keys().filter(|id| **id != self.core.id).cloned().collect();
        for target in targets {
            self.spawn_replication_stream(&target);
        }

        self.core.last_leader_contact = None;
        self.core.next_election_timeout = None;
        self.core.current_leader = Some(self.core.id.clone());
        self.recompute_lease();
        self.core.report_metrics();

        // Per §5.4.2 an entry from a prior term can not be proven committed
        // by counting replicas; appending a no-op in the new term makes the
        // whole prefix provable.
        if self.core.log.last_log_id().term != self.core.current_term {
            self.append_entry(crate::log::EntryData::no_op(), None).await?;
        }

        // A prior leader may have left a config-change entry uncommitted;
        // it occupies the single in-flight slot until it commits.
        self.pending_config_change = self
            .core
            .log
            .tail()
            .iter()
            .filter(|e| e.data.config_change.is_some() && e.log_id.index > self.core.commit_index)
            .map(|e| e.log_id.index)
            .max();

        // Anything accepted before we took over can now make progress.
        self.check_ready_commits().await?;
        self.leader_advance().await?;

        loop {
            if !self.core.target_state.is_leader() {
                for node in self.nodes.values() {
                    let _ = node.repl.repl_tx.send(RaftEvent::Terminate);
                }
                return Ok(());
            }

            let commit_deadline = self.core.next_commit_deadline();
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    CoreMsg::Recv(msg) => {
                        if self.core.preprocess(&msg).await? {
                            self.handle_msg(msg).await?;
                        }
                    }
                    CoreMsg::Begin { consistency, tx } => self.core.handle_begin(consistency, tx).await,
                    CoreMsg::Commit(handoff) => {
                        self.core.register_commit(handoff);
                        self.check_ready_commits().await?;
                        self.leader_advance().await?;
                    }
                    CoreMsg::Rollback { tx_id } => self.core.handle_rollback(tx_id).await,
                },
                Some(event) = self.replication_rx.recv() => {
                    self.handle_replica_event(event).await?;
                }
                _ = sleep_until(commit_deadline) => {
                    self.core.expire_commits().await;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    /// Dispatch one preprocessed message while leading.
    async fn handle_msg(&mut self, msg: Message) -> RaftResult<()> {
        match msg {
            Message::Append(req) => self.core.handle_append_request(req).await,
            Message::Snapshot(req) => self.core.handle_install_snapshot(req).await,
            Message::Vote(req) => self.core.handle_request_vote(req).await,
            Message::Ping(ping) => {
                self.core.handle_ping(ping).await;
                Ok(())
            }
            Message::AppendReply(resp) => self.handle_append_response(resp).await,
            Message::Commit(req) => self.handle_commit_request(req).await,
            Message::CommitReply(resp) => {
                tracing::debug!(msg=%resp.header.sender, "leader ignoring commit response");
                Ok(())
            }
            Message::Grant(_) | Message::Pong(_) => Ok(()),
        }
    }

    /// Spawn a replication stream for `target`.
    pub(crate) fn spawn_replication_stream(&mut self, target: &NodeId) {
        let address = self.core.membership.get(target).cloned().unwrap_or_default();
        let stream = ReplicationStream::new(
            self.core.id.clone(),
            target.clone(),
            address,
            self.core.cluster_id,
            self.core.current_term,
            self.core.config.clone(),
            self.core.clock,
            self.core.log.clone(),
            self.core.network.clone(),
            self.core.commit_index,
            self.core.lease,
            self.replication_tx.clone(),
        );
        self.nodes.insert(target.clone(), FollowerRep {
            repl: stream,
            matched: 0,
            timestamp: None,
            remove_after_commit: None,
        });
    }

    /// Handle an `AppendResponse` from a follower: account the ack for the
    /// lease, advance the match index, and relay transmission state to the
    /// stream task.
    async fn handle_append_response(&mut self, resp: crate::message::AppendResponse) -> RaftResult<()> {
        let target = resp.header.sender.clone();
        let node = match self.nodes.get_mut(&target) {
            Some(node) => node,
            None => return Ok(()),
        };

        let newer_ack = match node.timestamp {
            Some(current) => current.before(resp.leader_timestamp),
            None => true,
        };
        if newer_ack {
            node.timestamp = Some(resp.leader_timestamp);
        }

        let mut matched_advanced = false;
        if resp.success && resp.match_index > node.matched {
            node.matched = resp.match_index;
            matched_advanced = true;
        }
        let _ = node.repl.repl_tx.send(RaftEvent::Response(resp));

        if newer_ack && self.recompute_lease() {
            // Read-only commits parked on a lease promise may now complete.
            self.core.check_waiting_commits().await;
        }
        if matched_advanced {
            self.drop_acked_removed_peers();
            self.advance_commit_index().await?;
        }
        Ok(())
    }

    async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::NeedsSnapshot { target, tx } => {
                tracing::info!(target=%target, "follower needs a snapshot install");
                let snapshot = self
                    .core
                    .storage
                    .snapshot()
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
                let _ = tx.send(crate::replication::SnapshotHandle {
                    snapshot,
                    meta: self.core.last_applied,
                    config: self.core.last_applied_config.clone(),
                });
                Ok(())
            }
        }
    }

    /// Recompute the leader lease: the ack timestamp covered by a strict
    /// majority of members, plus the discounted minimum election timeout.
    /// Returns whether the lease advanced.
    pub(crate) fn recompute_lease(&mut self) -> bool {
        let members: Vec<&NodeId> = self.core.membership.keys().collect();
        if members.is_empty() || !self.core.membership.contains_key(&self.core.id) {
            return false;
        }
        let now = self.core.clock.now();
        // Age of each member's newest ack, self being current by
        // definition; smaller is fresher.
        let mut ages: Vec<i64> = Vec::with_capacity(members.len());
        for member in members {
            if *member == self.core.id {
                ages.push(0);
            } else if let Some(ts) = self.nodes.get(member).and_then(|n| n.timestamp) {
                ages.push(now.since(ts) as i64);
            }
        }
        let needed = quorum::majority_of(self.core.membership.len());
        if ages.len() < needed {
            return false;
        }
        ages.sort_unstable();
        let quorum_age = ages[needed - 1];
        let lease = now.offset(self.core.lease_extension() - quorum_age);
        let advanced = match self.core.lease {
            Some(current) => current.before(lease),
            None => true,
        };
        if advanced {
            self.core.advance_lease(lease);
            self.broadcast_state();
        }
        advanced
    }

    /// Push the current commit index and lease to every stream so
    /// heartbeats carry fresh values.
    pub(crate) fn broadcast_state(&self) {
        for node in self.nodes.values() {
            let _ = node.repl.repl_tx.send(RaftEvent::UpdateState {
                commit_index: self.core.commit_index,
                lease: self.core.lease,
            });
        }
    }

    /// Terminate streams for removed peers that have acknowledged their
    /// removal entry.
    fn drop_acked_removed_peers(&mut self) {
        let done: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| matches!(node.remove_after_commit, Some(idx) if node.matched >= idx))
            .map(|(id, _)| id.clone())
            .collect();
        for target in done {
            tracing::info!(target=%target, "removed peer acknowledged removal, stopping heartbeats");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.repl.repl_tx.send(RaftEvent::Terminate);
            }
        }
    }

    /// Recompute the commit index from the member match indexes: the
    /// highest `N` replicated on a strict majority whose entry carries the
    /// current term.
    pub(crate) async fn advance_commit_index(&mut self) -> RaftResult<()> {
        let last_log = self.core.log.last_log_id().index;
        let mut indexes: Vec<u64> = self
            .core
            .membership
            .keys()
            .map(|member| {
                if *member == self.core.id {
                    last_log
                } else {
                    self.nodes.get(member).map(|n| n.matched).unwrap_or(0)
                }
            })
            .collect();
        if indexes.is_empty() {
            return Ok(());
        }
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = indexes[quorum::majority_of(indexes.len()) - 1];

        if quorum_index > self.core.commit_index && self.core.log.term_at(quorum_index) == Some(self.core.current_term)
        {
            tracing::debug!(id=%self.core.id, commit=quorum_index, "commit index advanced");
            self.core.commit_index = quorum_index;
            self.broadcast_state();
            self.leader_advance().await?;
        }
        Ok(())
    }

    /// The leader's post-advance pipeline, including config-change
    /// commitment effects and the slow-follower apply floor.
    pub(crate) async fn leader_advance(&mut self) -> RaftResult<()> {
        self.handle_committed_config_change().await?;

        let follower_floor = self
            .core
            .membership
            .keys()
            .filter(|id| **id != self.core.id)
            .map(|id| self.nodes.get(id).map(|n| n.matched).unwrap_or(0))
            .min();
        self.core.advance(follower_floor).await?;

        if self.stepping_down && self.core.target_state.is_leader() {
            tracing::info!(id=%self.core.id, "stepping down after committed self-removal");
            self.core.current_leader = None;
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a campaigning node.
pub(crate) struct CandidateState<'a, N: Transport, S: KvStore> {
    core: &'a mut RaftCore<N, S>,
    /// Peers that granted their vote this term, self included.
    votes: BTreeSet<NodeId>,
}

impl<'a, N: Transport, S: KvStore> CandidateState<'a, N, S> {
    pub(crate) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        Self {
            core,
            votes: BTreeSet::new(),
        }
    }

    /// Run the candidate loop. Each iteration of the outer loop is a new
    /// term.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="candidate"))]
    pub(crate) async fn run(mut self) -> RaftResult<()> {
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            self.votes.clear();
            self.votes.insert(self.core.id.clone());
            self.core.update_next_election_timeout(false);
            let new_term = self.core.current_term + 1;
            let id = self.core.id.clone();
            self.core.persist_term(new_term, Some(id)).await?;
            self.core.current_leader = None;
            self.core.report_metrics();
            tracing::info!(id=%self.core.id, term=self.core.current_term, "campaigning for leadership");

            self.spawn_vote_requests();

            if self.has_majority() {
                // A single-member cluster elects itself.
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout = sleep_until(tokio::time::Instant::from_std(self.core.get_next_election_timeout()));
                let commit_deadline = self.core.next_commit_deadline();

                tokio::select! {
                    // The election timed out; start over with a new term.
                    _ = timeout => break,
                    Some(msg) = self.core.rx_api.recv() => match msg {
                        CoreMsg::Recv(msg) => {
                            if self.core.preprocess(&msg).await? {
                                self.handle_msg(msg).await?;
                            }
                        }
                        CoreMsg::Begin { consistency, tx } => self.core.handle_begin(consistency, tx).await,
                        CoreMsg::Commit(handoff) => {
                            // No leader: commits queue as ready until a role
                            // that can progress them takes over.
                            self.core.register_commit(handoff);
                        }
                        CoreMsg::Rollback { tx_id } => self.core.handle_rollback(tx_id).await,
                    },
                    _ = sleep_until(commit_deadline) => {
                        self.core.expire_commits().await;
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_target_state(State::Shutdown);
                    }
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: Message) -> RaftResult<()> {
        match msg {
            Message::Append(req) => self.core.handle_append_request(req).await,
            Message::Snapshot(req) => self.core.handle_install_snapshot(req).await,
            Message::Vote(req) => self.core.handle_request_vote(req).await,
            Message::Ping(ping) => {
                self.core.handle_ping(ping).await;
                Ok(())
            }
            Message::Grant(grant) => {
                self.votes.insert(grant.header.sender);
                if self.has_majority() {
                    tracing::info!(id=%self.core.id, term=self.core.current_term, "won election");
                    self.core.set_target_state(State::Leader);
                }
                Ok(())
            }
            Message::AppendReply(_) | Message::Commit(_) | Message::CommitReply(_) | Message::Pong(_) => Ok(()),
        }
    }

    fn has_majority(&self) -> bool {
        let members = &self.core.membership;
        let granted = self.votes.iter().filter(|id| members.contains_key(*id)).count();
        granted >= quorum::majority_of(members.len())
    }

    /// Fire vote requests at every other member in parallel.
    fn spawn_vote_requests(&self) {
        let last_log = self.core.log.last_log_id();
        for (target, address) in self.core.membership.iter() {
            if *target == self.core.id {
                continue;
            }
            let msg = Message::Vote(crate::message::RequestVote {
                header: self.core.header_to(target),
                last_log_term: last_log.term,
                last_log_index: last_log.index,
            });
            let network = self.core.network.clone();
            let target = target.clone();
            let address = address.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = network.send(&target, &address, msg).await {
                        tracing::warn!(target=%target, error=%err, "error sending vote request");
                    }
                }
                .instrument(tracing::debug_span!("vote-request")),
            );
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// A pre-election probing round: ping every peer and only campaign once a
/// majority proves reachable.
struct ProbeRound {
    acks: BTreeSet<NodeId>,
    deadline: Instant,
}

/// Volatile state specific to a follower.
pub(crate) struct FollowerState<'a, N: Transport, S: KvStore> {
    pub(crate) core: &'a mut RaftCore<N, S>,
    probe: Option<ProbeRound>,
}

impl<'a, N: Transport, S: KvStore> FollowerState<'a, N, S> {
    pub(crate) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        Self { core, probe: None }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="follower"))]
    pub(crate) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        self.forward_ready_commits().await?;

        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }

            // Only voting members run an election timer; an unconfigured
            // node (or one configured out) replicates passively.
            let far_future = Instant::now() + Duration::from_secs(3600);
            let election_at = if self.core.is_voting_member() {
                self.core.get_next_election_timeout()
            } else {
                far_future
            };
            let probe_at = self.probe.as_ref().map(|p| p.deadline).unwrap_or(far_future);
            let commit_deadline = self.core.next_commit_deadline();

            tokio::select! {
                _ = sleep_until(tokio::time::Instant::from_std(election_at)) => {
                    self.handle_election_timeout().await?;
                }
                _ = sleep_until(tokio::time::Instant::from_std(probe_at)), if self.probe.is_some() => {
                    // Not enough peers reachable; stand down and re-arm.
                    let acks = self.probe.take().map(|p| p.acks.len()).unwrap_or(0);
                    tracing::info!(id=%self.core.id, acks, "probe round failed, deferring election");
                    self.core.update_next_election_timeout(false);
                }
                Some(msg) = self.core.rx_api.recv() => match msg {
                    CoreMsg::Recv(msg) => {
                        if self.core.preprocess(&msg).await? {
                            self.handle_msg(msg).await?;
                        }
                    }
                    CoreMsg::Begin { consistency, tx } => self.core.handle_begin(consistency, tx).await,
                    CoreMsg::Commit(handoff) => {
                        self.core.register_commit(handoff);
                        self.progress_commits().await?;
                    }
                    CoreMsg::Rollback { tx_id } => self.core.handle_rollback(tx_id).await,
                },
                _ = sleep_until(commit_deadline) => {
                    self.core.expire_commits().await;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: Message) -> RaftResult<()> {
        match msg {
            Message::Append(req) => {
                let had_leader = self.core.current_leader.clone();
                self.probe = None;
                self.core.handle_append_request(req).await?;
                if self.core.current_leader != had_leader {
                    self.on_new_leader().await?;
                }
                self.progress_commits().await
            }
            Message::Snapshot(req) => {
                self.probe = None;
                self.core.handle_install_snapshot(req).await?;
                self.progress_commits().await
            }
            Message::Vote(req) => self.core.handle_request_vote(req).await,
            Message::Ping(ping) => {
                self.core.handle_ping(ping).await;
                Ok(())
            }
            Message::Pong(pong) => {
                self.handle_probe_ack(pong.header.sender);
                Ok(())
            }
            Message::CommitReply(resp) => self.handle_commit_reply(resp).await,
            Message::Commit(req) => {
                tracing::debug!(from=%req.header.sender, "follower can not serve commit requests");
                Ok(())
            }
            Message::AppendReply(_) | Message::Grant(_) => Ok(()),
        }
    }

    /// A new leader came into view: previously forwarded commits must be
    /// re-sent to it.
    async fn on_new_leader(&mut self) -> RaftResult<()> {
        for commit in self.core.commits.values_mut() {
            if matches!(commit.stage, CommitStage::Ready) {
                commit.forwarded = false;
            }
        }
        self.forward_ready_commits().await
    }

    async fn handle_election_timeout(&mut self) -> RaftResult<()> {
        if self.probe.is_some() {
            // Already probing; leave the round to its own deadline.
            self.core.update_next_election_timeout(false);
            return Ok(());
        }
        if !self.core.config.follower_probing_enabled || self.core.membership.len() == 1 {
            self.core.set_target_state(State::Candidate);
            return Ok(());
        }

        tracing::info!(id=%self.core.id, "election timeout, probing peers before campaigning");
        let deadline = Instant::now() + Duration::from_millis(self.core.config.min_election_timeout);
        let mut acks = BTreeSet::new();
        acks.insert(self.core.id.clone());
        self.probe = Some(ProbeRound { acks, deadline });

        let timestamp = self.core.clock.now();
        let targets: Vec<NodeId> =
            self.core.membership.keys().filter(|id| **id != self.core.id).cloned().collect();
        for target in targets {
            let msg = Message::Ping(Ping {
                header: self.core.header_to(&target),
                timestamp,
            });
            self.core.send_to(&target, msg).await;
        }
        self.core.update_next_election_timeout(false);
        Ok(())
    }

    fn handle_probe_ack(&mut self, from: NodeId) {
        let majority = quorum::majority_of(self.core.membership.len());
        if let Some(probe) = &mut self.probe {
            if self.core.membership.contains_key(&from) {
                probe.acks.insert(from);
            }
            if probe.acks.len() >= majority {
                tracing::info!(id=%self.core.id, "majority reachable, converting to candidate");
                self.probe = None;
                self.core.set_target_state(State::Candidate);
            }
        }
    }
}
