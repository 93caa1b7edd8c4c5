//! Learner role: counts accept notifications per instance and decides the
//! first value accepted under one ballot by a majority of acceptors.

use std::collections::{HashMap, HashSet};

use crate::commit::{ItemId, PaxosId, TxId};
use crate::node::NodeId;
use crate::paxos::{Ballot, Vote};

/// In-memory learner state for one Paxos instance.
#[derive(Debug)]
struct LearnerInst {
    /// The transaction item this instance votes on.
    item: ItemId,

    /// Majority threshold over the acceptor set.
    quorum: u8,

    /// Distinct acceptors seen per (ballot, value) accept.
    accepts: HashMap<(Ballot, Vote), HashSet<NodeId>>,

    /// Decided value, set at most once.
    decided: Option<Vote>,
}

/// The learner role of a node: a map of instances keyed by `PaxosId`.
/// Learners are co-located with the transaction managers; a decision is
/// handed to the manager state machine rather than sent on the wire.
#[derive(Debug, Default)]
pub(crate) struct LearnerRole {
    insts: HashMap<PaxosId, LearnerInst>,
}

impl LearnerRole {
    pub(crate) fn new() -> Self {
        LearnerRole {
            insts: HashMap::new(),
        }
    }

    /// Seeds a learner instance. Re-seeding an existing instance (takeover)
    /// keeps its counts and any decision already reached.
    pub(crate) fn seed(&mut self, id: PaxosId, item: ItemId, quorum: u8) {
        self.insts.entry(id).or_insert_with(|| LearnerInst {
            item,
            quorum,
            accepts: HashMap::new(),
            decided: None,
        });
    }

    /// True if this instance is seeded on this node.
    pub(crate) fn is_seeded(&self, id: &PaxosId) -> bool {
        self.insts.contains_key(id)
    }

    /// Handles an accept notification from an acceptor. Returns
    /// `Some((item, vote))` exactly once: when the instance first reaches a
    /// majority of acceptors on one (ballot, value).
    pub(crate) fn handle_accepted(
        &mut self,
        id: PaxosId,
        ballot: Ballot,
        vote: Vote,
        acceptor: NodeId,
    ) -> Option<(ItemId, Vote)> {
        let inst = self.insts.get_mut(&id)?;
        if inst.decided.is_some() {
            return None;
        }

        let seen = inst.accepts.entry((ballot, vote)).or_default();
        seen.insert(acceptor);
        if seen.len() >= inst.quorum as usize {
            inst.decided = Some(vote);
            Some((inst.item, vote))
        } else {
            None
        }
    }

    /// Decided value of an instance, if any.
    pub(crate) fn decided(&self, id: &PaxosId) -> Option<Vote> {
        self.insts.get(id).and_then(|inst| inst.decided)
    }

    /// Drops all instances belonging to a transaction (the delayed
    /// learner-delete after the drain period).
    pub(crate) fn gc_tx(&mut self, tx: TxId) {
        self.insts.retain(|id, _| id.tx != tx);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.insts.len()
    }
}

#[cfg(test)]
mod learner_tests {
    use super::*;

    fn ids(seq: u64, replica: u64) -> (PaxosId, ItemId) {
        let tx = TxId { tm: 1, seq };
        (PaxosId { tx, replica }, ItemId { tx, idx: 0 })
    }

    #[test]
    fn decide_at_quorum_once() {
        let mut lrn = LearnerRole::new();
        let (pid, item) = ids(1, 10);
        lrn.seed(pid, item, 2);

        assert_eq!(lrn.handle_accepted(pid, 1, Vote::Prepared, 0), None);
        // duplicate notification from the same acceptor does not count
        assert_eq!(lrn.handle_accepted(pid, 1, Vote::Prepared, 0), None);

        assert_eq!(
            lrn.handle_accepted(pid, 1, Vote::Prepared, 2),
            Some((item, Vote::Prepared))
        );
        assert_eq!(lrn.decided(&pid), Some(Vote::Prepared));

        // further notifications never re-decide
        assert_eq!(lrn.handle_accepted(pid, 1, Vote::Prepared, 3), None);
        assert_eq!(lrn.handle_accepted(pid, 0x0203, Vote::Abort, 3), None);
    }

    #[test]
    fn ballots_counted_separately() {
        let mut lrn = LearnerRole::new();
        let (pid, item) = ids(2, 20);
        lrn.seed(pid, item, 2);

        // same value under different ballots must not pool together
        assert_eq!(lrn.handle_accepted(pid, 1, Vote::Abort, 0), None);
        assert_eq!(lrn.handle_accepted(pid, 0x0203, Vote::Abort, 1), None);
        assert_eq!(
            lrn.handle_accepted(pid, 0x0203, Vote::Abort, 2),
            Some((item, Vote::Abort))
        );
    }

    #[test]
    fn reseed_keeps_progress() {
        let mut lrn = LearnerRole::new();
        let (pid, item) = ids(3, 30);
        lrn.seed(pid, item, 2);
        assert_eq!(lrn.handle_accepted(pid, 1, Vote::Prepared, 0), None);

        // takeover re-seeds the same instance; prior accepts still count
        lrn.seed(pid, item, 2);
        assert_eq!(
            lrn.handle_accepted(pid, 1, Vote::Prepared, 1),
            Some((item, Vote::Prepared))
        );
    }

    #[test]
    fn unseeded_ignored_and_gc() {
        let mut lrn = LearnerRole::new();
        let (pid, item) = ids(4, 40);
        assert_eq!(lrn.handle_accepted(pid, 1, Vote::Prepared, 0), None);

        lrn.seed(pid, item, 1);
        assert_eq!(lrn.len(), 1);
        lrn.gc_tx(item.tx);
        assert_eq!(lrn.len(), 0);
    }
}
