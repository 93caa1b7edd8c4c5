//! Proposer role: drives one Paxos instance toward a decision. The
//! transaction participant proposes its vote in the reserved round 0
//! (Accept-only); a takeover manager proposes `Abort` with a higher round
//! through the full two-phase protocol, adopting any value a quorum may
//! already have accepted.

use std::collections::{HashMap, HashSet};

use crate::commit::{PaxosId, TxId};
use crate::node::NodeId;
use crate::paxos::{Ballot, Vote};

/// An Accept broadcast to perform.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct AcceptRound {
    pub ballot: Ballot,
    pub vote: Vote,
    pub acceptors: Vec<NodeId>,
}

/// A Prepare broadcast to perform.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct PrepareRound {
    pub ballot: Ballot,
    pub acceptors: Vec<NodeId>,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum Phase {
    Preparing,
    Accepting,
}

/// In-memory proposer state for one Paxos instance.
#[derive(Debug)]
struct ProposerInst {
    ballot: Ballot,
    vote: Vote,
    acceptors: Vec<NodeId>,
    quorum: u8,
    phase: Phase,

    /// Acceptors that acked the Prepare of `ballot`.
    prepare_acks: HashSet<NodeId>,

    /// Highest previously-accepted value reported in Prepare acks.
    highest_voted: Option<(Ballot, Vote)>,
}

/// The proposer role of a node: a map of instances keyed by `PaxosId`.
#[derive(Debug, Default)]
pub(crate) struct ProposerRole {
    insts: HashMap<PaxosId, ProposerInst>,
}

impl ProposerRole {
    pub(crate) fn new() -> Self {
        ProposerRole {
            insts: HashMap::new(),
        }
    }

    /// Starts a round-0 proposal of the participant's own vote, skipping
    /// the Prepare phase. The returned Accept round goes to all acceptors.
    pub(crate) fn start_fast(
        &mut self,
        id: PaxosId,
        ballot: Ballot,
        vote: Vote,
        acceptors: Vec<NodeId>,
        quorum: u8,
    ) -> AcceptRound {
        let round = AcceptRound {
            ballot,
            vote,
            acceptors: acceptors.clone(),
        };
        self.insts.insert(
            id,
            ProposerInst {
                ballot,
                vote,
                acceptors,
                quorum,
                phase: Phase::Accepting,
                prepare_acks: HashSet::new(),
                highest_voted: None,
            },
        );
        round
    }

    /// Starts a takeover proposal with `fallback` as the value to propose
    /// if no acceptor reports a previously-accepted value. Returns `None`
    /// if an equal-or-higher proposal is already running here.
    pub(crate) fn start_prepare(
        &mut self,
        id: PaxosId,
        ballot: Ballot,
        fallback: Vote,
        acceptors: Vec<NodeId>,
        quorum: u8,
    ) -> Option<PrepareRound> {
        if let Some(inst) = self.insts.get(&id) {
            if inst.ballot >= ballot {
                return None;
            }
        }
        let round = PrepareRound {
            ballot,
            acceptors: acceptors.clone(),
        };
        self.insts.insert(
            id,
            ProposerInst {
                ballot,
                vote: fallback,
                acceptors,
                quorum,
                phase: Phase::Preparing,
                prepare_acks: HashSet::new(),
                highest_voted: None,
            },
        );
        Some(round)
    }

    /// Handles a Prepare ack. Once a quorum of acceptors acked, moves to
    /// the Accept phase proposing the highest previously-accepted value if
    /// any was reported, else the fallback value.
    pub(crate) fn handle_prepare_ack(
        &mut self,
        id: PaxosId,
        from: NodeId,
        ballot: Ballot,
        voted: Option<(Ballot, Vote)>,
    ) -> Option<AcceptRound> {
        let inst = self.insts.get_mut(&id)?;
        if inst.phase != Phase::Preparing || inst.ballot != ballot {
            return None;
        }

        inst.prepare_acks.insert(from);
        if let Some((bal, vote)) = voted {
            if inst.highest_voted.map_or(true, |(hb, _)| bal > hb) {
                inst.highest_voted = Some((bal, vote));
            }
        }

        if inst.prepare_acks.len() >= inst.quorum as usize {
            inst.phase = Phase::Accepting;
            if let Some((_, vote)) = inst.highest_voted {
                inst.vote = vote;
            }
            Some(AcceptRound {
                ballot: inst.ballot,
                vote: inst.vote,
                acceptors: inst.acceptors.clone(),
            })
        } else {
            None
        }
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
mod proposer_tests {
    use super::*;
    use crate::paxos::make_ballot;

    fn pid(seq: u64, replica: u64) -> PaxosId {
        PaxosId {
            tx: TxId { tm: 2, seq },
            replica,
        }
    }

    #[test]
    fn fast_round_proposes_own_vote() {
        let mut prp = ProposerRole::new();
        let id = pid(1, 10);
        let round = prp.start_fast(
            id,
            make_ballot(0, 1),
            Vote::Prepared,
            vec![0, 1, 2],
            2,
        );
        assert_eq!(round.vote, Vote::Prepared);
        assert_eq!(round.acceptors, vec![0, 1, 2]);
    }

    #[test]
    fn takeover_adopts_accepted_value() {
        let mut prp = ProposerRole::new();
        let id = pid(2, 20);
        let ballot = make_ballot(1, 3);
        assert!(prp
            .start_prepare(id, ballot, Vote::Abort, vec![0, 1, 2], 2)
            .is_some());

        // one acceptor reports it already accepted Prepared in round 0
        assert_eq!(
            prp.handle_prepare_ack(
                id,
                0,
                ballot,
                Some((make_ballot(0, 1), Vote::Prepared))
            ),
            None
        );
        let round = prp.handle_prepare_ack(id, 1, ballot, None).unwrap();

        // safety: the pre-existing value wins over the abort fallback
        assert_eq!(round.vote, Vote::Prepared);
        assert_eq!(round.ballot, ballot);
    }

    #[test]
    fn takeover_falls_back_to_abort() {
        let mut prp = ProposerRole::new();
        let id = pid(3, 30);
        let ballot = make_ballot(1, 4);
        prp.start_prepare(id, ballot, Vote::Abort, vec![0, 1, 2], 2);

        assert_eq!(prp.handle_prepare_ack(id, 2, ballot, None), None);
        // duplicate ack from the same acceptor does not count
        assert_eq!(prp.handle_prepare_ack(id, 2, ballot, None), None);

        let round = prp.handle_prepare_ack(id, 0, ballot, None).unwrap();
        assert_eq!(round.vote, Vote::Abort);
    }

    #[test]
    fn stale_restart_refused() {
        let mut prp = ProposerRole::new();
        let id = pid(4, 40);
        prp.start_prepare(id, make_ballot(2, 3), Vote::Abort, vec![0], 1);
        assert!(prp
            .start_prepare(id, make_ballot(1, 4), Vote::Abort, vec![0], 1)
            .is_none());
        assert_eq!(prp.len(), 1);
    }
}
