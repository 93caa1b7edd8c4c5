//! Consensus layer: one single-decree Paxos instance per key-replica per
//! transaction, deciding that replica's commit vote.
//!
//! Every node hosts one acceptor, one proposer, and one learner role; each
//! role is a map keyed by `PaxosId` owned by the node actor. The transaction
//! participant's initial vote is proposed in the reserved round 0 and skips
//! the Prepare phase; takeover proposers run full two-phase Paxos with
//! higher rounds, which preserves any pre-existing decision.

mod acceptor;
mod learner;
mod proposer;

use serde::{Deserialize, Serialize};

pub(crate) use acceptor::{AcceptNotice, AcceptorRole, PrepareAck};
pub(crate) use learner::LearnerRole;
pub(crate) use proposer::{AcceptRound, PrepareRound, ProposerRole};

/// Ballot number type. Use 0 as a null ballot number.
pub(crate) type Ballot = u64;

/// A replica's vote on one transaction item.
#[derive(
    Debug, PartialEq, Eq, Hash, Copy, Clone, Serialize, Deserialize,
)]
pub enum Vote {
    Prepared,
    Abort,
}

/// Composes a ballot from a round base and the proposer's owner tag, so
/// that concurrent proposers never collide on a ballot number. Tag 0 is
/// reserved (null ballot).
#[inline]
pub(crate) fn make_ballot(round_base: u64, owner_tag: u8) -> Ballot {
    (round_base << 8) | owner_tag as u64
}

#[cfg(test)]
mod ballot_tests {
    use super::*;

    #[test]
    fn ballot_ordering() {
        // any round base dominates owner tags of lower bases
        assert!(make_ballot(0, 1) < make_ballot(1, 2));
        assert!(make_ballot(1, 5) < make_ballot(2, 3));
        // same base, distinct tags stay distinct and ordered
        assert!(make_ballot(1, 3) < make_ballot(1, 4));
        assert_ne!(make_ballot(2, 3), make_ballot(2, 4));
    }
}
