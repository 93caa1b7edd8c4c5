//! CommitNode -- transaction participant (TP).
//!
//! The node hosting a replica of a touched key validates the transaction's
//! entry against its record, takes the tentative lock iff validation
//! passes, registers with every manager, and proposes its vote in the
//! round-0 Paxos instance of its slot. The decision arrives later as a
//! commit reply; apply-or-release must stay idempotent because replies and
//! initializations can arrive in either order.

use super::*;

use crate::client::{TLogEntry, TxOp};
use crate::node::NodeId;
use crate::paxos::{make_ballot, Vote};
use crate::ring::RingKey;
use crate::utils::RingStoreError;

use tokio::time::Instant;

impl CommitNode {
    /// Handler of InitTp from a transaction manager.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn handle_init_tp(
        &mut self,
        item: ItemId,
        paxos: PaxosId,
        ring_key: RingKey,
        entry: TLogEntry,
        tm: NodeId,
        managers: Vec<NodeId>,
        acceptors: Vec<NodeId>,
        quorum: u8,
    ) -> Result<(), RingStoreError> {
        if self.decided_cache.contains_key(&paxos) {
            // the decision overtook this initialization; no lock was ever
            // taken here, so there is nothing to release
            pf_debug!("late init_TP for already-decided {}", paxos);
            return Ok(());
        }
        if self.pending_votes.contains_key(&paxos) {
            return Ok(()); // duplicate initialization
        }

        let vote = self.store.validate_and_lock(ring_key, &entry);
        pf_debug!("init_TP {} from {} validated {:?}", paxos, tm, vote);

        self.pending_votes.insert(
            paxos,
            PendingVote {
                ring_key,
                entry,
                vote,
            },
        );

        // register as the owner of this consensus slot with every manager
        for &mgr in &managers {
            self.route_send(
                PeerMsg::RegisterTp {
                    item,
                    paxos,
                    tp: self.id,
                },
                mgr,
            )?;
        }

        // drive the round-0 proposal of my vote
        let ballot = make_ballot(0, TP_TAG);
        let round =
            self.proposer.start_fast(paxos, ballot, vote, acceptors, quorum);
        for acc in round.acceptors {
            self.route_send(
                PeerMsg::PaxAccept {
                    paxos,
                    ballot,
                    vote,
                    learners: managers.clone(),
                },
                acc,
            )?;
        }
        Ok(())
    }

    /// Handler of the transaction decision at a participant: apply the
    /// write and bump the version on commit, release locks on abort.
    /// Replies arriving without a pending vote (late manager, duplicate
    /// delivery) only refresh the decision cache.
    pub(crate) fn handle_commit_reply_tp(
        &mut self,
        paxos: PaxosId,
        decision: Decision,
    ) -> Result<(), RingStoreError> {
        if let Some(pending) = self.pending_votes.remove(&paxos) {
            pf_debug!("commit_reply for {}: {:?}", paxos, decision);
            if pending.vote == Vote::Prepared {
                match (decision, pending.entry.op) {
                    (Decision::Commit, TxOp::Write) => {
                        let value =
                            pending.entry.value.as_deref().unwrap_or_default();
                        self.store.apply_write(
                            pending.ring_key,
                            value,
                            pending.entry.version_read + 1,
                        );
                    }
                    (Decision::Commit, TxOp::Read)
                    | (Decision::Abort, _) => {
                        self.store
                            .release_lock(pending.ring_key, pending.entry.op);
                    }
                    _ => {}
                }
            }
        }
        self.decided_cache
            .insert(paxos, (decision, Instant::now()));
        Ok(())
    }
}
