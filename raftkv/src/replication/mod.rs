//! Replication streams: one spawned task per follower, owning that
//! follower's transmission state.
//!
//! The leader loop appends entries and fans them out as events; each stream
//! decides between pipelined replication, probe-based catch-up, and a full
//! snapshot transmit, pacing itself on the transport's backpressure. Acks
//! flow back through the core (which owns match indexes and the lease) and
//! are relayed here to advance the transmission window.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;

use crate::config::Config;
use crate::log::LogEntry;
use crate::log::LogStore;
use crate::message::put_lp_bytes;
use crate::message::AppendEntry;
use crate::message::AppendRequest;
use crate::message::AppendResponse;
use crate::message::Header;
use crate::message::InstallSnapshot;
use crate::message::Message;
use crate::raft_types::Clock;
use crate::raft_types::ClusterId;
use crate::raft_types::LogId;
use crate::raft_types::Membership;
use crate::raft_types::NodeId;
use crate::raft_types::Timestamp;
use crate::storage::KvSnapshot;
use crate::storage::STATE_MACHINE_END;
use crate::storage::STATE_MACHINE_PREFIX;
use crate::Transport;

/// Snapshot chunks aim for this many bytes of key/value data.
const SNAPSHOT_CHUNK_SIZE: usize = 10 * 1024;

/// An event from the leader loop to a replication stream.
pub(crate) enum RaftEvent {
    /// A freshly appended entry to transmit.
    Replicate {
        entry: Arc<LogEntry>,
        commit_index: u64,
        lease: Option<Timestamp>,
        /// The target originated this entry's mutations and holds them
        /// locally; send it once without the data.
        skip_data: bool,
    },
    /// New commit index / lease values for subsequent heartbeats.
    UpdateState {
        commit_index: u64,
        lease: Option<Timestamp>,
    },
    /// The follower's reply to one of our appends, relayed by the core.
    Response(AppendResponse),
    /// The leader is stepping down or the peer is gone; stop.
    Terminate,
}

/// An event from a replication stream to the leader loop.
pub(crate) enum ReplicaEvent {
    /// The follower is behind the retained log; a snapshot transfer is
    /// needed.
    NeedsSnapshot {
        target: NodeId,
        tx: oneshot::Sender<SnapshotHandle>,
    },
}

/// Everything needed to stream one consistent snapshot.
pub(crate) struct SnapshotHandle {
    pub snapshot: Box<dyn KvSnapshot>,
    /// The coordinates the snapshot covers.
    pub meta: LogId,
    /// The membership as of `meta`.
    pub config: Membership,
}

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<RaftEvent>,
}

impl ReplicationStream {
    /// Spawn a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: Transport>(
        id: NodeId,
        target: NodeId,
        address: String,
        cluster_id: ClusterId,
        term: u64,
        config: Arc<Config>,
        clock: Clock,
        log: Arc<LogStore>,
        network: Arc<N>,
        commit_index: u64,
        lease: Option<Timestamp>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat = interval(Duration::from_millis(config.heartbeat_timeout));
        let last_log = log.last_log_id();
        let this = ReplicationCore {
            id,
            target,
            address,
            cluster_id,
            term,
            clock,
            log,
            network,
            raft_core_tx,
            repl_rx,
            target_state: TargetReplState::Lagging,
            synced: false,
            next_index: last_log.index + 1,
            commit_index,
            lease,
            buffer: VecDeque::new(),
            heartbeat,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));
        ReplicationStream { repl_tx }
    }
}

/// The replication state of the target follower.
enum TargetReplState {
    /// Caught up; entries are pipelined as they arrive.
    LineRate,
    /// Probing for the match point, then streaming retained entries.
    Lagging,
    /// The follower's next entry predates the retained log.
    Snapshotting,
    Shutdown,
}

/// A task responsible for replicating the log to one target follower.
///
/// Appends carry at most one entry each; while the target is synced the
/// stream advances its own view of `next_index` without waiting for acks,
/// bounded by the log head, and falls back to probing when an ack reports a
/// mismatch.
struct ReplicationCore<N: Transport> {
    id: NodeId,
    target: NodeId,
    address: String,
    cluster_id: ClusterId,
    /// The leader's term; fixed for the lifetime of this stream.
    term: u64,
    clock: Clock,
    log: Arc<LogStore>,
    network: Arc<N>,

    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,

    target_state: TargetReplState,
    /// Whether the target's log is known to match ours at
    /// `next_index - 1`.
    synced: bool,
    /// The index of the next entry to send.
    next_index: u64,
    commit_index: u64,
    lease: Option<Timestamp>,

    /// Entries fanned out by the leader loop, awaiting transmission.
    buffer: VecDeque<(Arc<LogEntry>, bool)>,
    heartbeat: Interval,
}

impl<N: Transport> ReplicationCore<N> {
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.id, target=%self.target))]
    async fn main(mut self) {
        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Lagging => self.lagging_loop().await,
                TargetReplState::Snapshotting => self.snapshotting_loop().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Process one event; returns `false` when the stream should stop.
    fn handle_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::Replicate {
                entry,
                commit_index,
                lease,
                skip_data,
            } => {
                self.commit_index = commit_index;
                self.lease = lease;
                self.buffer.push_back((entry, skip_data));
            }
            RaftEvent::UpdateState { commit_index, lease } => {
                self.commit_index = commit_index;
                self.lease = lease;
            }
            RaftEvent::Response(resp) => {
                if resp.success {
                    if !self.synced {
                        self.synced = true;
                        self.next_index = std::cmp::max(self.next_index, resp.match_index + 1);
                    }
                } else {
                    // The conservative reset point is the follower's
                    // applied floor, reported as its match index.
                    self.synced = false;
                    self.next_index =
                        std::cmp::min(resp.match_index + 1, resp.last_log_index + 1).max(1);
                    self.target_state = TargetReplState::Lagging;
                }
            }
            RaftEvent::Terminate => {
                self.target_state = TargetReplState::Shutdown;
            }
        }
    }

    /// Drain any queued events without blocking.
    fn drain_events(&mut self) {
        while let Ok(event) = self.repl_rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn is_line_rate(&self) -> bool {
        matches!(self.target_state, TargetReplState::LineRate)
    }

    /// The steady state: ship buffered entries as they arrive, heartbeat
    /// in the gaps.
    async fn line_rate_loop(&mut self) {
        loop {
            if !self.is_line_rate() {
                return;
            }

            while let Some((entry, skip_data)) = self.buffer.front().cloned() {
                if entry.log_id.index < self.next_index {
                    self.buffer.pop_front();
                    continue;
                }
                if entry.log_id.index > self.next_index {
                    // Entries were appended while this stream was not
                    // synced; fetch them from the log instead.
                    self.target_state = TargetReplState::Lagging;
                    return;
                }
                if !self.send_entry(entry, skip_data).await {
                    break;
                }
                self.buffer.pop_front();
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.send_probe().await;
                }
                event = self.repl_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => self.target_state = TargetReplState::Shutdown,
                },
            }
        }
    }

    /// Catch-up: probe for the match point, then stream entries straight
    /// from the retained log.
    async fn lagging_loop(&mut self) {
        loop {
            match &self.target_state {
                TargetReplState::Lagging => {}
                _ => return,
            }

            if self.next_index <= self.log.floor().index {
                self.target_state = TargetReplState::Snapshotting;
                return;
            }

            if !self.synced {
                self.send_probe().await;
                tokio::select! {
                    _ = self.heartbeat.tick() => {}
                    event = self.repl_rx.recv() => match event {
                        Some(event) => self.handle_event(event),
                        None => self.target_state = TargetReplState::Shutdown,
                    },
                }
                continue;
            }

            let last_log = self.log.last_log_id().index;
            if self.next_index > last_log {
                // Caught up; anything still buffered is already sent.
                self.buffer.clear();
                self.target_state = TargetReplState::LineRate;
                return;
            }
            let entry = match self.log.entry(self.next_index) {
                Some(entry) => entry,
                None => {
                    // Applied out from under us while catching up.
                    self.target_state = TargetReplState::Snapshotting;
                    return;
                }
            };
            if !self.send_entry(entry, false).await {
                // Transient transport trouble; wait a beat.
                self.heartbeat.tick().await;
            }
            self.drain_events();
        }
    }

    /// Full state transfer, then fall back to probing from the snapshot
    /// index.
    async fn snapshotting_loop(&mut self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.raft_core_tx.send(ReplicaEvent::NeedsSnapshot {
            target: self.target.clone(),
            tx,
        });
        let handle = match rx.await {
            Ok(handle) => handle,
            Err(_) => {
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        };

        tracing::info!(target=%self.target, snapshot=%handle.meta, "streaming snapshot to follower");
        let snapshot = handle.snapshot;
        let mut pairs = snapshot.iter_range(&[STATE_MACHINE_PREFIX], Some(STATE_MACHINE_END)).peekable();
        let mut pair_index = 0u64;

        loop {
            let mut data = BytesMut::with_capacity(SNAPSHOT_CHUNK_SIZE + 256);
            let mut count = 0u64;
            while data.len() < SNAPSHOT_CHUNK_SIZE {
                match pairs.next() {
                    Some((key, value)) => {
                        // Keys travel in user space; the receiver re-prefixes.
                        put_lp_bytes(&mut data, &key[1..]);
                        put_lp_bytes(&mut data, &value);
                        count += 1;
                    }
                    None => break,
                }
            }
            let last_chunk = pairs.peek().is_none();

            let msg = Message::Snapshot(InstallSnapshot {
                header: self.header(),
                snapshot_term: handle.meta.term,
                snapshot_index: handle.meta.index,
                pair_index,
                config: if pair_index == 0 { Some(handle.config.clone()) } else { None },
                last_chunk,
                data: data.freeze(),
            });
            if let Err(err) = self.network.send(&self.target, &self.address, msg).await {
                tracing::warn!(target=%self.target, error=%err, "error streaming snapshot, will retry");
                self.synced = false;
                self.target_state = TargetReplState::Lagging;
                return;
            }
            pair_index += count;

            self.drain_events();
            if matches!(self.target_state, TargetReplState::Shutdown) {
                return;
            }
            if last_chunk {
                break;
            }
        }

        self.next_index = handle.meta.index + 1;
        self.synced = false;
        self.target_state = TargetReplState::Lagging;
    }

    /// Send one entry at `next_index`, optimistically advancing the
    /// window. Returns `false` if the transport rejected the send.
    async fn send_entry(&mut self, entry: Arc<LogEntry>, skip_data: bool) -> bool {
        let prev_index = entry.log_id.index - 1;
        let prev_term = match self.prev_term(prev_index) {
            Some(term) => term,
            None => {
                self.target_state = TargetReplState::Snapshotting;
                return false;
            }
        };
        let msg = Message::Append(AppendRequest {
            header: self.header(),
            leader_timestamp: self.clock.now(),
            leader_lease_timeout: self.lease,
            leader_commit: self.commit_index,
            prev_log_term: prev_term,
            prev_log_index: prev_index,
            entry: Some(AppendEntry {
                term: entry.log_id.term,
                data: if skip_data { None } else { Some(entry.encoded.clone()) },
            }),
        });
        match self.network.send(&self.target, &self.address, msg).await {
            Ok(()) => {
                self.next_index = entry.log_id.index + 1;
                true
            }
            Err(err) => {
                tracing::warn!(target=%self.target, error=%err, "error sending append to follower");
                false
            }
        }
    }

    /// Send an empty append: the heartbeat, doubling as the match-point
    /// probe while unsynced.
    async fn send_probe(&mut self) {
        let prev_index = self.next_index.saturating_sub(1);
        let prev_term = match self.prev_term(prev_index) {
            Some(term) => term,
            None => {
                self.target_state = TargetReplState::Snapshotting;
                return;
            }
        };
        let msg = Message::Append(AppendRequest {
            header: self.header(),
            leader_timestamp: self.clock.now(),
            leader_lease_timeout: self.lease,
            leader_commit: self.commit_index,
            prev_log_term: prev_term,
            prev_log_index: prev_index,
            entry: None,
        });
        if let Err(err) = self.network.send(&self.target, &self.address, msg).await {
            tracing::warn!(target=%self.target, error=%err, "error sending heartbeat to follower");
        }
    }

    fn prev_term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.term_at(index)
    }

    fn header(&self) -> Header {
        Header {
            cluster_id: self.cluster_id,
            sender: self.id.clone(),
            recipient: self.target.clone(),
            term: self.term,
        }
    }
}
