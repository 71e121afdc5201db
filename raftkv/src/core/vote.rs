//! Handling of `RequestVote` messages.

use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::message::GrantVote;
use crate::message::Message;
use crate::message::RequestVote;
use crate::storage::KvStore;
use crate::Transport;

impl<N: Transport, S: KvStore> RaftCore<N, S> {
    /// Decide whether to grant a vote. The protocol has no deny message:
    /// an unpersuaded node simply stays silent and the candidate's
    /// election times out.
    #[tracing::instrument(level = "trace", skip(self, req), fields(id=%self.id))]
    pub(crate) async fn handle_request_vote(&mut self, req: RequestVote) -> RaftResult<()> {
        // A healthy leader is protected from disconnected peers rejoining
        // with inflated terms: no votes within the minimum election
        // timeout of the last leader contact.
        if self.heard_from_leader_recently() {
            tracing::debug!(id=%self.id, candidate=%req.header.sender, "ignoring vote request, leader is live");
            return Ok(());
        }

        let candidate = req.header.sender.clone();
        let can_vote = match &self.voted_for {
            None => true,
            Some(voted) => *voted == candidate,
        };
        if !can_vote {
            tracing::debug!(id=%self.id, candidate=%candidate, voted_for=?self.voted_for, "vote already cast this term");
            return Ok(());
        }

        // §5.4.1: only vote for candidates whose log is at least as
        // up-to-date as ours.
        let last_log = self.log.last_log_id();
        let candidate_up_to_date = (req.last_log_term, req.last_log_index) >= (last_log.term, last_log.index);
        if !candidate_up_to_date {
            tracing::debug!(
                id=%self.id,
                candidate=%candidate,
                candidate_last=%format!("{}-{}", req.last_log_term, req.last_log_index),
                ours=%last_log,
                "candidate log is behind ours"
            );
            return Ok(());
        }

        if self.voted_for.is_none() {
            // The vote must be durable before the grant leaves this node.
            self.persist_vote(candidate.clone()).await?;
        }
        tracing::info!(id=%self.id, candidate=%candidate, term=self.current_term, "granting vote");
        let msg = Message::Grant(GrantVote {
            header: self.header_to(&candidate),
        });
        self.send_to(&candidate, msg).await;
        Ok(())
    }
}
