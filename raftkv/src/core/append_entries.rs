//! Handling of `AppendRequest` messages: log matching, conflict
//! truncation, entry append, and commit-index advance.

use crate::core::CommitStage;
use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftResult;
use crate::log::EntryData;
use crate::message::AppendRequest;
use crate::message::AppendResponse;
use crate::message::Message;
use crate::mvcc::Writes;
use crate::raft_types::LogId;
use crate::storage::KvStore;
use crate::Transport;

impl<N: Transport, S: KvStore> RaftCore<N, S> {
    /// Handle an `AppendRequest` from the current leader.
    ///
    /// By the time this runs the common rules have been applied, so the
    /// request's term equals ours; the sender is therefore the one
    /// legitimate leader of this term, whatever role we were playing.
    #[tracing::instrument(level = "trace", skip(self, req), fields(id=%self.id))]
    pub(crate) async fn handle_append_request(&mut self, req: AppendRequest) -> RaftResult<()> {
        let leader = req.header.sender.clone();
        if self.current_leader.as_ref() != Some(&leader) {
            tracing::info!(id=%self.id, leader=%leader, "observed leader");
            self.current_leader = Some(leader.clone());
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }
        self.update_next_election_timeout(true);
        if let Some(lease) = req.leader_lease_timeout {
            self.advance_lease(lease);
        }

        let prev = LogId {
            term: req.prev_log_term,
            index: req.prev_log_index,
        };
        let last_log = self.log.last_log_id();

        // Log matching: the prev coordinates must name an entry we hold
        // (or our applied floor). Everything at or below the floor was
        // committed, so it matches by definition.
        let prev_matches = if prev.index > last_log.index {
            false
        } else if prev.index < self.last_applied.index {
            true
        } else {
            self.log.term_at(prev.index) == Some(prev.term)
        };
        if !prev_matches {
            tracing::debug!(id=%self.id, prev=%prev, last=%last_log, "append prev coordinates do not match");
            self.send_append_response(&leader, req.leader_timestamp, false).await;
            return Ok(());
        }

        let mut match_index = std::cmp::max(prev.index, self.last_applied.index);
        if let Some(entry) = req.entry {
            let index = prev.index + 1;
            match self.accept_entry(index, entry).await? {
                Some(appended) => match_index = std::cmp::max(match_index, appended),
                None => {
                    self.send_append_response(&leader, req.leader_timestamp, false).await;
                    return Ok(());
                }
            }
        }

        // commitIndex advances monotonically, capped by what we hold.
        let last_log = self.log.last_log_id();
        let new_commit =
            std::cmp::min(std::cmp::max(req.leader_commit, self.commit_index), last_log.index);
        let advanced = new_commit > self.commit_index;
        self.commit_index = new_commit;

        self.send_append_response_with(&leader, req.leader_timestamp, true, match_index).await;

        if advanced {
            self.advance(None).await?;
        }
        Ok(())
    }

    /// Place one entry at `index`, truncating a conflicting suffix first.
    /// Returns the matched index on success, `None` when the entry could
    /// not be reconstructed (skip-data miss or malformed payload).
    async fn accept_entry(&mut self, index: u64, entry: crate::message::AppendEntry) -> RaftResult<Option<u64>> {
        if index <= self.last_applied.index {
            // Already applied; it was committed with exactly this content.
            return Ok(Some(index));
        }

        if let Some(existing) = self.log.entry(index) {
            if existing.log_id.term == entry.term {
                return Ok(Some(index));
            }
            // A conflicting entry from a different term: ours loses.
            tracing::info!(
                id=%self.id,
                index,
                ours = existing.log_id.term,
                theirs = entry.term,
                "truncating conflicting log suffix"
            );
            self.log.truncate_from(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.rebuild_membership();
            // Anything waiting on a truncated entry fails its term check.
            self.check_waiting_commits().await;
        }

        if self.log.last_log_id().index + 1 != index {
            // A gap: the retained tail ends before `index - 1`.
            return Ok(None);
        }

        let data = match entry.data {
            Some(bytes) => match EntryData::decode(bytes) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(id=%self.id, index, error=%err, "malformed entry payload");
                    return Ok(None);
                }
            },
            // No mutation bytes: this entry's writes originated here, in a
            // transaction whose commit coordinates we already know.
            None => match self.take_pending_write(entry.term, index).await {
                Some(data) => data,
                None => {
                    tracing::debug!(id=%self.id, index, "no pending write matches skip-data entry");
                    return Ok(None);
                }
            },
        };

        let log_id = LogId {
            term: entry.term,
            index,
        };
        let has_config_change = data.config_change.is_some();
        self.log.append(log_id, data).await.map_err(|err| self.map_fatal_storage_error(err))?;
        if has_config_change {
            self.rebuild_membership();
            self.report_metrics();
        }
        Ok(Some(index))
    }

    /// Recover the mutations of a locally originated transaction by its
    /// commit coordinates, for an entry sent without data.
    ///
    /// The bytes come from the fsynced temp file staged when the commit was
    /// forwarded, so the substitution does not depend on the transaction's
    /// in-memory state surviving. A missing or unreadable file simply fails
    /// the append; the leader retransmits with the data included.
    async fn take_pending_write(&self, term: u64, index: u64) -> Option<EntryData> {
        let path = self.commits.values().find_map(|commit| {
            if let CommitStage::Waiting { commit: id, .. } = &commit.stage {
                if id.term == term && id.index == index {
                    return commit.temp_file.clone();
                }
            }
            None
        })?;
        let staged = match self.log.read_temp(&path).await {
            Ok(staged) => staged,
            Err(err) => {
                tracing::warn!(id=%self.id, index, error=?err, "error reading staged mutations");
                return None;
            }
        };
        match Writes::from_bytes(staged) {
            Ok(writes) => Some(EntryData {
                writes,
                config_change: None,
            }),
            Err(err) => {
                tracing::warn!(id=%self.id, index, error=%err, "staged mutations are corrupt");
                None
            }
        }
    }

    async fn send_append_response(&mut self, leader: &str, echo: crate::raft_types::Timestamp, success: bool) {
        let match_index = self.last_applied.index;
        self.send_append_response_with(leader, echo, success, match_index).await;
    }

    async fn send_append_response_with(
        &mut self,
        leader: &str,
        echo: crate::raft_types::Timestamp,
        success: bool,
        match_index: u64,
    ) {
        let leader = leader.to_string();
        let msg = Message::AppendReply(AppendResponse {
            header: self.header_to(&leader),
            leader_timestamp: echo,
            success,
            match_index,
            last_log_index: self.log.last_log_id().index,
        });
        self.send_to(&leader, msg).await;
    }
}
