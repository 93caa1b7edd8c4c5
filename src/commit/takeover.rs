//! CommitNode -- manager takeover and transaction timeouts.
//!
//! A standby manager replaces a suspected leader by re-seeding learners
//! for every still-undecided Paxos instance, propagating its learner
//! subscription to the acceptors, and driving full two-phase proposers
//! with value `Abort`. Paxos safety keeps any decision already reached;
//! only instances with no value accepted by a quorum can flip to abort.

use super::*;

use crate::node::NodeId;
use crate::paxos::{make_ballot, Vote};
use crate::ring::RingKey;
use crate::utils::RingStoreError;

impl CommitNode {
    /// Handler of the weak completion check armed at commit start. The
    /// check re-defers once when the transaction is visibly making Paxos
    /// progress; otherwise it triggers takeover.
    pub(crate) fn handle_tid_isdone(
        &mut self,
        tx: TxId,
    ) -> Result<(), RingStoreError> {
        let Some(state) = self.txs.get_mut(&tx) else {
            return Ok(());
        };
        if state.status != MgrStatus::Ok
            || state.decision != Decision::Undecided
        {
            return Ok(());
        }

        if !state.deferred && state.num_paxdecided > state.armed_paxdecided {
            state.deferred = true;
            state.armed_paxdecided = state.num_paxdecided;
            self.delayed_self(self.tx_timeout(), SelfMsg::TidIsDone { tx });
            pf_debug!("tid_isdone re-deferred for {}", tx);
            return Ok(());
        }

        pf_warn!("{} not done in time, taking over", tx);
        if state.role_tag == TM_TAG {
            // ask the standbys to drive the decision as well
            let rtm_nodes: Vec<NodeId> =
                state.rtms.iter().map(|&(_, node)| node).collect();
            for node in rtm_nodes {
                if node != self.id {
                    self.route_send(PeerMsg::ProposeYourself { tx }, node)?;
                }
            }
        }
        self.start_takeover(tx)
    }

    /// Handler of a failure-detector suspicion: take over every in-flight
    /// transaction led by the crashed peer.
    pub(crate) fn handle_crash(
        &mut self,
        node: NodeId,
    ) -> Result<(), RingStoreError> {
        pf_warn!("crash suspicion of peer {}", node);
        let led_by_crashed: Vec<TxId> = self
            .txs
            .values()
            .filter(|state| {
                state.status == MgrStatus::Ok
                    && state.decision == Decision::Undecided
                    && state.tm == node
                    && state.role_tag != TM_TAG
            })
            .map(|state| state.tx)
            .collect();
        for tx in led_by_crashed {
            self.start_takeover(tx)?;
        }
        Ok(())
    }

    /// Drives abort proposers for every undecided Paxos instance of a
    /// transaction, using this manager's role tag as the ballot seed so
    /// concurrent takeovers never collide.
    pub(crate) fn start_takeover(
        &mut self,
        tx: TxId,
    ) -> Result<(), RingStoreError> {
        let Some(state) = self.txs.get_mut(&tx) else {
            return Ok(());
        };
        if state.decision != Decision::Undecided {
            return Ok(());
        }
        state.took_over = true;
        let role_tag = state.role_tag;
        let acceptors = state.acceptors.clone();
        let item_ids = state.item_ids.clone();
        let quorum = self.config.quorum_factor;
        let ballot = make_ballot(role_tag as u64, role_tag);
        pf_warn!("abort takeover of {} at ballot {}", tx, ballot);

        for item in item_ids {
            let Some(item_state) = self.items.get(&item) else {
                continue;
            };
            let undecided: Vec<RingKey> = item_state
                .replicas
                .iter()
                .filter(|slot| slot.decided.is_none())
                .map(|slot| slot.ring_key)
                .collect();

            for ring_key in undecided {
                let paxos = PaxosId { tx, replica: ring_key };

                // re-seed my learner and propagate the subscription; the
                // acceptors replay anything they already accepted
                self.learner.seed(paxos, item, quorum);
                for &acc in &acceptors {
                    self.route_send(
                        PeerMsg::PaxRegisterLearner {
                            paxos,
                            learner: self.id,
                        },
                        acc,
                    )?;
                }

                if let Some(round) = self.proposer.start_prepare(
                    paxos,
                    ballot,
                    Vote::Abort,
                    acceptors.clone(),
                    quorum,
                ) {
                    for acc in round.acceptors {
                        self.route_send(
                            PeerMsg::PaxPrepare {
                                paxos,
                                ballot: round.ballot,
                            },
                            acc,
                        )?;
                    }
                }
            }
        }

        self.delayed_self(2 * self.tx_timeout(), SelfMsg::TidGiveUp { tx });
        Ok(())
    }

    /// Handler of the post-takeover completion check. If consensus still
    /// cannot decide (a majority of some replica set or of the acceptor
    /// set is unreachable), the transaction surfaces abort to the client
    /// rather than hang: no item can have committed, and every reachable
    /// participant gets told to release.
    pub(crate) fn handle_tid_giveup(
        &mut self,
        tx: TxId,
    ) -> Result<(), RingStoreError> {
        let Some(state) = self.txs.get_mut(&tx) else {
            return Ok(());
        };
        if state.decision != Decision::Undecided {
            return Ok(());
        }
        pf_warn!("{} undecidable after takeover, surfacing abort", tx);
        state.decision = Decision::Abort;
        self.propagate_decision(tx)
    }
}
