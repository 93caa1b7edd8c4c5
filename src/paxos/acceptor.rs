//! Acceptor role: per-instance promised ballot, accepted value, and the set
//! of learner nodes to notify on accept.

use std::collections::HashMap;

use crate::commit::{PaxosId, TxId};
use crate::node::NodeId;
use crate::paxos::{Ballot, Vote};

/// Reply to a Prepare carrying the acceptor's highest accepted value.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct PrepareAck {
    pub ballot: Ballot,
    pub voted: Option<(Ballot, Vote)>,
}

/// Notification of a fresh accept, to be sent to all registered learners.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct AcceptNotice {
    pub ballot: Ballot,
    pub vote: Vote,
    pub learners: Vec<NodeId>,
}

/// In-memory acceptor state for one Paxos instance.
#[derive(Debug, Clone, Default)]
struct AcceptorInst {
    /// Highest ballot promised or accepted.
    promised: Ballot,

    /// Highest ballot accepted and its value.
    accepted: Option<(Ballot, Vote)>,

    /// Learner nodes to notify on accept.
    learners: Vec<NodeId>,
}

/// The acceptor role of a node: a map of instances keyed by `PaxosId`.
#[derive(Debug, Default)]
pub(crate) struct AcceptorRole {
    insts: HashMap<PaxosId, AcceptorInst>,
}

impl AcceptorRole {
    pub(crate) fn new() -> Self {
        AcceptorRole {
            insts: HashMap::new(),
        }
    }

    /// Handles a Prepare: promises the ballot if strictly higher than any
    /// seen, replying with the highest accepted value for value adoption.
    pub(crate) fn handle_prepare(
        &mut self,
        id: PaxosId,
        ballot: Ballot,
    ) -> Option<PrepareAck> {
        let inst = self.insts.entry(id).or_default();
        if ballot > inst.promised {
            inst.promised = ballot;
            Some(PrepareAck {
                ballot,
                voted: inst.accepted,
            })
        } else {
            None
        }
    }

    /// Handles an Accept: accepts if the ballot is not below the promise,
    /// registers the carried learners, and returns the notice to fan out to
    /// every learner registered on this instance.
    pub(crate) fn handle_accept(
        &mut self,
        id: PaxosId,
        ballot: Ballot,
        vote: Vote,
        learners: &[NodeId],
    ) -> Option<AcceptNotice> {
        let inst = self.insts.entry(id).or_default();
        for &l in learners {
            if !inst.learners.contains(&l) {
                inst.learners.push(l);
            }
        }
        if ballot >= inst.promised {
            inst.promised = ballot;
            inst.accepted = Some((ballot, vote));
            Some(AcceptNotice {
                ballot,
                vote,
                learners: inst.learners.clone(),
            })
        } else {
            None
        }
    }

    /// Registers an additional learner (takeover re-seeding). Returns the
    /// accepted value, if any, for replay to the new learner; this is what
    /// lets a re-seeded learner catch up on a decision already underway.
    pub(crate) fn register_learner(
        &mut self,
        id: PaxosId,
        learner: NodeId,
    ) -> Option<(Ballot, Vote)> {
        let inst = self.insts.entry(id).or_default();
        if !inst.learners.contains(&learner) {
            inst.learners.push(learner);
        }
        inst.accepted
    }

    /// Drops all instances belonging to a transaction.
    pub(crate) fn gc_tx(&mut self, tx: TxId) {
        self.insts.retain(|id, _| id.tx != tx);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.insts.len()
    }
}

#[cfg(test)]
mod acceptor_tests {
    use super::*;

    fn pid(seq: u64, replica: u64) -> PaxosId {
        PaxosId {
            tx: TxId { tm: 0, seq },
            replica,
        }
    }

    #[test]
    fn accept_then_reject_stale() {
        let mut acc = AcceptorRole::new();
        let id = pid(1, 100);

        // round-0 fast accept goes through
        let notice = acc.handle_accept(id, 1, Vote::Prepared, &[0, 1]);
        assert_eq!(notice.unwrap().vote, Vote::Prepared);

        // a higher prepare blocks older accepts
        assert!(acc.handle_prepare(id, 0x0203).is_some());
        assert!(acc.handle_accept(id, 1, Vote::Abort, &[]).is_none());

        // but the prepared ballot's accept goes through
        let notice = acc.handle_accept(id, 0x0203, Vote::Prepared, &[]);
        assert_eq!(notice.unwrap().vote, Vote::Prepared);
    }

    #[test]
    fn prepare_replies_accepted_value() {
        let mut acc = AcceptorRole::new();
        let id = pid(2, 200);

        assert!(acc.handle_accept(id, 1, Vote::Abort, &[3]).is_some());
        let ack = acc.handle_prepare(id, 0x0104).unwrap();
        assert_eq!(ack.voted, Some((1, Vote::Abort)));

        // duplicate prepare at the same ballot is refused
        assert!(acc.handle_prepare(id, 0x0104).is_none());
    }

    #[test]
    fn learner_registration_replays() {
        let mut acc = AcceptorRole::new();
        let id = pid(3, 300);

        // nothing accepted yet: registration records, no replay
        assert_eq!(acc.register_learner(id, 5), None);

        let notice =
            acc.handle_accept(id, 1, Vote::Prepared, &[0]).unwrap();
        assert!(notice.learners.contains(&5));
        assert!(notice.learners.contains(&0));

        // late learner gets the accepted value replayed
        assert_eq!(acc.register_learner(id, 6), Some((1, Vote::Prepared)));
    }

    #[test]
    fn gc_drops_tx_instances() {
        let mut acc = AcceptorRole::new();
        acc.handle_accept(pid(7, 1), 1, Vote::Prepared, &[]);
        acc.handle_accept(pid(7, 2), 1, Vote::Prepared, &[]);
        acc.handle_accept(pid(8, 1), 1, Vote::Abort, &[]);
        assert_eq!(acc.len(), 3);

        acc.gc_tx(TxId { tm: 0, seq: 7 });
        assert_eq!(acc.len(), 1);
    }
}
