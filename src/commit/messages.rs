//! CommitNode -- peer message dispatch.
//!
//! Manager-plane messages race with `InitRtm`: any of them arriving for a
//! transaction this node does not know yet lands in a hold-back queue on a
//! placeholder entry and is replayed in FIFO order once the real state
//! arrives. Everything else (Paxos, reads, pub/sub) is state it owns
//! outright and handles immediately.

use super::*;

use std::collections::VecDeque;

use crate::node::NodeId;
use crate::utils::RingStoreError;

use tokio::time::Instant;

impl CommitNode {
    /// Dispatches a message received from a peer (or looped back to self).
    pub(crate) fn handle_peer_msg(
        &mut self,
        peer: NodeId,
        msg: PeerMsg,
    ) -> Result<(), RingStoreError> {
        match msg {
            PeerMsg::Heartbeat => {
                self.transport.send_msg(PeerMsg::HeartbeatReply, peer)
            }
            PeerMsg::HeartbeatReply => self.fd.heard(peer),

            PeerMsg::InitRtm {
                snapshot,
                items,
                role_index,
            } => self.handle_init_rtm(snapshot, items, role_index),

            PeerMsg::RegisterTp { item, paxos, tp } => {
                let tx = item.tx;
                if self.mgr_entry_ready(tx) {
                    self.handle_register_tp(item, paxos, tp)
                } else {
                    self.hold_back(
                        peer,
                        tx,
                        PeerMsg::RegisterTp { item, paxos, tp },
                    )
                }
            }

            PeerMsg::TmDelete { tx, decision } => {
                if self.mgr_entry_ready(tx) {
                    self.handle_tm_delete(tx, decision)
                } else if self.txs.contains_key(&tx) {
                    self.hold_back(peer, tx, PeerMsg::TmDelete { tx, decision })
                } else {
                    Ok(()) // nothing to delete here
                }
            }

            PeerMsg::ProposeYourself { tx } => {
                if self.mgr_entry_ready(tx) {
                    self.start_takeover(tx)
                } else {
                    self.hold_back(peer, tx, PeerMsg::ProposeYourself { tx })
                }
            }

            PeerMsg::GetRtm { index, ring_key } => {
                self.handle_get_rtm(peer, index, ring_key)
            }
            PeerMsg::GetRtmReply { index, ring_key } => {
                self.handle_get_rtm_reply(peer, index, ring_key)
            }

            PeerMsg::FwdCommit {
                origin,
                client,
                req,
                tlog,
                hops,
            } => self.handle_fwd_commit(origin, client, req, tlog, hops),
            PeerMsg::FwdCommitReply {
                client,
                req,
                result,
            } => self.handle_fwd_commit_reply(client, req, result),

            PeerMsg::InitTp {
                item,
                paxos,
                ring_key,
                entry,
                tm,
                managers,
                acceptors,
                quorum,
            } => self.handle_init_tp(
                item, paxos, ring_key, entry, tm, managers, acceptors, quorum,
            ),
            PeerMsg::CommitReplyTp { paxos, decision } => {
                self.handle_commit_reply_tp(paxos, decision)
            }

            PeerMsg::PaxPrepare { paxos, ballot } => {
                if let Some(ack) = self.acceptor.handle_prepare(paxos, ballot)
                {
                    pf_trace!("acceptor promised {} bal {}", paxos, ballot);
                    self.route_send(
                        PeerMsg::PaxPrepareReply {
                            paxos,
                            ballot: ack.ballot,
                            voted: ack.voted,
                        },
                        peer,
                    )?;
                }
                Ok(())
            }
            PeerMsg::PaxPrepareReply {
                paxos,
                ballot,
                voted,
            } => {
                if let Some(round) = self.proposer.handle_prepare_ack(
                    paxos, peer, ballot, voted,
                ) {
                    pf_debug!("takeover of {} enters accept phase bal {}",
                              paxos, round.ballot);
                    for acc in round.acceptors.clone() {
                        self.route_send(
                            PeerMsg::PaxAccept {
                                paxos,
                                ballot: round.ballot,
                                vote: round.vote,
                                learners: vec![],
                            },
                            acc,
                        )?;
                    }
                }
                Ok(())
            }
            PeerMsg::PaxAccept {
                paxos,
                ballot,
                vote,
                learners,
            } => {
                if let Some(notice) = self.acceptor.handle_accept(
                    paxos, ballot, vote, &learners,
                ) {
                    pf_trace!("acceptor accepted {} bal {} vote {:?}",
                              paxos, ballot, vote);
                    for learner in notice.learners {
                        self.route_send(
                            PeerMsg::PaxAccepted {
                                paxos,
                                ballot: notice.ballot,
                                vote: notice.vote,
                            },
                            learner,
                        )?;
                    }
                }
                Ok(())
            }
            PeerMsg::PaxAccepted {
                paxos,
                ballot,
                vote,
            } => {
                if self.learner.is_seeded(&paxos) {
                    if let Some((item, decided)) = self
                        .learner
                        .handle_accepted(paxos, ballot, vote, peer)
                    {
                        self.handle_learner_decide(item, paxos, decided)?;
                    }
                    Ok(())
                } else if self.mgr_entry_ready(paxos.tx) {
                    Ok(()) // learner already deleted; late traffic
                } else {
                    self.hold_back(
                        peer,
                        paxos.tx,
                        PeerMsg::PaxAccepted {
                            paxos,
                            ballot,
                            vote,
                        },
                    )
                }
            }
            PeerMsg::PaxRegisterLearner { paxos, learner } => {
                if let Some((ballot, vote)) =
                    self.acceptor.register_learner(paxos, learner)
                {
                    // replay my accepted value to the late learner
                    self.route_send(
                        PeerMsg::PaxAccepted {
                            paxos,
                            ballot,
                            vote,
                        },
                        learner,
                    )?;
                }
                Ok(())
            }

            PeerMsg::ReadKey { read_id, ring_key } => {
                let found = self
                    .store
                    .lookup(ring_key)
                    .map(|(value, version)| (value.to_string(), version));
                self.route_send(
                    PeerMsg::ReadKeyReply {
                        read_id,
                        ring_key,
                        found,
                    },
                    peer,
                )
            }
            PeerMsg::ReadKeyReply {
                read_id,
                ring_key,
                found,
            } => self.handle_read_reply(read_id, ring_key, found),

            PeerMsg::PubSubFwd { op_id, action } => {
                let result = self.apply_pubsub_action(action);
                self.route_send(
                    PeerMsg::PubSubFwdReply { op_id, result },
                    peer,
                )
            }
            PeerMsg::PubSubFwdReply { op_id, result } => {
                self.handle_pubsub_reply(op_id, result)
            }
        }
    }

    /// True if this transaction's manager entry exists and is promoted, so
    /// manager-plane messages may be handled directly.
    fn mgr_entry_ready(&self, tx: TxId) -> bool {
        self.txs
            .get(&tx)
            .map(|state| state.status == MgrStatus::Ok)
            .unwrap_or(false)
    }

    /// Appends a manager-plane message to the transaction's hold-back
    /// queue, creating an uninitialized placeholder entry if none exists.
    fn hold_back(
        &mut self,
        peer: NodeId,
        tx: TxId,
        msg: PeerMsg,
    ) -> Result<(), RingStoreError> {
        let state = self.txs.entry(tx).or_insert_with(|| TxState {
            tx,
            role_tag: 0,
            client: ClientRoute::Local { client: 0, req: 0 },
            tm: tx.tm,
            rtms: vec![],
            acceptors: vec![],
            item_ids: vec![],
            items_prepared: 0,
            items_abort: 0,
            num_paxdecided: 0,
            num_tps_registered: 0,
            num_informed: 0,
            decision: Decision::Undecided,
            status: MgrStatus::Uninitialized,
            hold_back: VecDeque::new(),
            tm_deleted: false,
            took_over: false,
            deferred: false,
            armed_paxdecided: 0,
            created_at: Instant::now(),
        });
        debug_assert_eq!(state.status, MgrStatus::Uninitialized);
        state.hold_back.push_back((peer, msg));
        pf_trace!("held back msg for uninitialized {}", tx);
        Ok(())
    }

    /// Drains a promoted transaction's hold-back queue in FIFO order.
    pub(crate) fn drain_hold_back(
        &mut self,
        tx: TxId,
    ) -> Result<(), RingStoreError> {
        let mut queued = VecDeque::new();
        if let Some(state) = self.txs.get_mut(&tx) {
            std::mem::swap(&mut queued, &mut state.hold_back);
        }
        for (peer, msg) in queued {
            self.handle_peer_msg(peer, msg)?;
        }
        Ok(())
    }
}
