//! Receiving a streamed state-machine snapshot from the leader.

use bytes::Bytes;

use crate::core::RaftCore;
use crate::core::State;
use crate::error::ProtocolError;
use crate::error::RaftResult;
use crate::message::get_lp_bytes;
use crate::message::InstallSnapshot;
use crate::mvcc::Writes;
use crate::raft_types::LogId;
use crate::raft_types::Membership;
use crate::raft_types::MessageSummary;
use crate::storage;
use crate::storage::KvStore;
use crate::storage::STATE_MACHINE_END;
use crate::storage::STATE_MACHINE_PREFIX;
use crate::Transport;

/// The state of an in-progress snapshot install.
pub(crate) struct SnapshotReceive {
    /// The snapshot's coordinates.
    id: LogId,
    /// The membership covered by the snapshot, recorded with the final
    /// chunk.
    config: Membership,
    /// The pair index the next chunk must start at.
    next_pair_index: u64,
}

impl<N: Transport, S: KvStore> RaftCore<N, S> {
    /// Handle one chunk of a snapshot stream.
    ///
    /// A chunk with `pair_index = 0` always supersedes any in-progress
    /// install; any other chunk that does not line up with the install in
    /// progress is ignored. The final chunk atomically records the new
    /// applied coordinates and clears the log.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id=%self.id, req=%crate::message::Message::Snapshot(req.clone()).summary()))]
    pub(crate) async fn handle_install_snapshot(&mut self, req: InstallSnapshot) -> RaftResult<()> {
        let leader = req.header.sender.clone();
        if self.current_leader.as_ref() != Some(&leader) {
            self.current_leader = Some(leader);
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }
        self.update_next_election_timeout(true);

        let snapshot_id = LogId {
            term: req.snapshot_term,
            index: req.snapshot_index,
        };

        if req.pair_index == 0 {
            // Stale transfer: we already hold everything it covers.
            if snapshot_id.index <= self.commit_index {
                tracing::debug!(id=%self.id, snapshot=%snapshot_id, "dropping snapshot at or below commit index");
                self.snapshot_rx = None;
                return Ok(());
            }
            let config = match &req.config {
                Some(config) => config.clone(),
                // Decoding enforces this, but stay defensive at the seam.
                None => {
                    tracing::warn!(id=%self.id, "first snapshot chunk without config");
                    return Ok(());
                }
            };
            // Out with the entire old state machine.
            self.storage
                .remove_range(&[STATE_MACHINE_PREFIX], Some(STATE_MACHINE_END))
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.snapshot_rx = Some(SnapshotReceive {
                id: snapshot_id,
                config,
                next_pair_index: 0,
            });
            tracing::info!(id=%self.id, snapshot=%snapshot_id, "snapshot install started");
        }

        let (expected_id, expected_pair) = match &self.snapshot_rx {
            Some(rx) => (rx.id, rx.next_pair_index),
            None => {
                tracing::debug!(id=%self.id, "ignoring snapshot chunk with no install in progress");
                return Ok(());
            }
        };
        if expected_id != snapshot_id || expected_pair != req.pair_index {
            tracing::debug!(
                id=%self.id,
                expected=%expected_id,
                expected_pair,
                got=%snapshot_id,
                got_pair=req.pair_index,
                "ignoring out-of-sequence snapshot chunk"
            );
            return Ok(());
        }

        let (batch, count) = match decode_pairs(req.data) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(id=%self.id, error=%err, "malformed snapshot chunk");
                return Ok(());
            }
        };
        if count > 0 {
            self.storage.mutate(batch, false).await.map_err(|err| self.map_fatal_storage_error(err))?;
        }
        if let Some(rx) = &mut self.snapshot_rx {
            rx.next_pair_index += count;
        }

        if req.last_chunk {
            let rx = self.snapshot_rx.take().expect("install in progress");
            self.finalize_snapshot_install(rx).await?;
        }
        Ok(())
    }

    /// Atomically record the new applied coordinates and drop the log.
    async fn finalize_snapshot_install(&mut self, rx: SnapshotReceive) -> RaftResult<()> {
        let mut batch = Writes::new();
        storage::put_last_applied(&mut batch, rx.id);
        storage::put_last_applied_config(&mut batch, &rx.config);
        self.storage.mutate(batch, true).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.log.reset(rx.id).await.map_err(|err| self.map_fatal_storage_error(err))?;

        self.last_applied = rx.id;
        self.last_applied_config = rx.config;
        self.commit_index = std::cmp::max(self.commit_index, rx.id.index);
        self.rebuild_membership();
        tracing::info!(id=%self.id, applied=%self.last_applied, "snapshot install complete");

        // Commits whose entries the transfer skipped fail their checks.
        self.check_waiting_commits().await;
        self.report_metrics();
        Ok(())
    }
}

/// Decode a chunk of length-prefixed `(key, value)` pairs into a batch of
/// prefixed puts.
fn decode_pairs(data: Bytes) -> Result<(Writes, u64), ProtocolError> {
    let mut buf = data;
    let mut batch = Writes::new();
    let mut count = 0u64;
    while !buf.is_empty() {
        let key = get_lp_bytes(&mut buf)?;
        let value = get_lp_bytes(&mut buf)?;
        batch.put(&storage::prefixed_key(&key), value);
        count += 1;
    }
    Ok((batch, count))
}
