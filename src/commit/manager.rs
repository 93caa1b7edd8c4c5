//! CommitNode -- transaction manager / standby manager state machine.
//!
//! The TM and its RTMs run the identical state machine differentiated only
//! by role tag: each hosts a learner per Paxos instance and converges on
//! the same per-item and per-transaction decisions. Only the acting leader
//! (the TM, or a standby that took over) propagates the decision to
//! participants, client, and peers.

use super::*;

use crate::node::{FailReason, NodeId, WireResult};
use crate::paxos::Vote;
use crate::utils::RingStoreError;

use tokio::time::Instant;

impl CommitNode {
    /// Handler of InitRtm from the leading manager: adopts the shipped
    /// transaction state as a standby, then drains any messages that
    /// arrived early.
    pub(crate) fn handle_init_rtm(
        &mut self,
        snapshot: TxSnapshot,
        items: Vec<ItemSnapshot>,
        role_index: u8,
    ) -> Result<(), RingStoreError> {
        let tx = snapshot.tx;
        if let Some(state) = self.txs.get(&tx) {
            if state.status == MgrStatus::Ok {
                pf_warn!("duplicate InitRtm for {}", tx);
                return Ok(());
            }
        }
        pf_debug!("init_RTM {} role_index {}", tx, role_index);

        // placeholder may hold early messages; carry its queue over
        let hold_back = self
            .txs
            .remove(&tx)
            .map(|placeholder| placeholder.hold_back)
            .unwrap_or_default();

        let state = TxState {
            tx,
            role_tag: TM_TAG + role_index,
            client: snapshot.client,
            tm: snapshot.tm,
            rtms: snapshot.rtms,
            acceptors: snapshot.acceptors.clone(),
            item_ids: items.iter().map(|snap| snap.item).collect(),
            items_prepared: 0,
            items_abort: 0,
            num_paxdecided: 0,
            num_tps_registered: 0,
            num_informed: 0,
            decision: Decision::Undecided,
            status: MgrStatus::Ok,
            hold_back,
            tm_deleted: false,
            took_over: false,
            deferred: false,
            armed_paxdecided: 0,
            created_at: Instant::now(),
        };
        let tm = state.tm;
        self.txs.insert(tx, state);

        for snap in items {
            let mut item_state = ItemState {
                item: snap.item,
                entry: snap.entry,
                replicas: Vec::with_capacity(snap.ring_keys.len()),
                num_prepared: 0,
                num_abort: 0,
                decision: None,
            };
            for ring_key in snap.ring_keys {
                let paxos = PaxosId { tx, replica: ring_key };
                self.learner.seed(paxos, snap.item, self.config.quorum_factor);
                item_state.replicas.push(ReplicaSlot {
                    ring_key,
                    tp: None,
                    decided: None,
                });
            }
            self.items.insert(snap.item, item_state);
        }

        // watch the leader; takeover right away if it is already suspected
        let tm_alive = self.fd.subscribe(tm);

        // weak completion check for this transaction
        self.delayed_self(2 * self.tx_timeout(), SelfMsg::TidIsDone { tx });

        self.drain_hold_back(tx)?;

        if !tm_alive {
            pf_warn!("leader {} of {} already suspected dead", tm, tx);
            self.start_takeover(tx)?;
        }
        Ok(())
    }

    /// Handler of a participant registration: records the TP as the owner
    /// of its consensus slot.
    pub(crate) fn handle_register_tp(
        &mut self,
        item: ItemId,
        paxos: PaxosId,
        tp: NodeId,
    ) -> Result<(), RingStoreError> {
        let Some(item_state) = self.items.get_mut(&item) else {
            return Ok(()); // transaction already cleaned up
        };
        let Some(slot) = item_state
            .replicas
            .iter_mut()
            .find(|slot| slot.ring_key == paxos.replica)
        else {
            return logged_err!(
                "unknown replica slot for {} of item {}",
                paxos,
                item_state.item
            );
        };
        if slot.tp.is_some() {
            return Ok(()); // duplicate registration
        }
        slot.tp = Some(tp);

        let Some(state) = self.txs.get_mut(&item.tx) else {
            return Ok(());
        };
        state.num_tps_registered += 1;
        pf_trace!("register_TP {} for {} ({} seen)",
                  tp, paxos, state.num_tps_registered);

        self.maybe_standby_delete(item.tx)
    }

    /// Handler of the leader's delete broadcast at a standby manager.
    pub(crate) fn handle_tm_delete(
        &mut self,
        tx: TxId,
        decision: Decision,
    ) -> Result<(), RingStoreError> {
        let Some(state) = self.txs.get_mut(&tx) else {
            return Ok(());
        };
        state.tm_deleted = true;
        if state.decision == Decision::Undecided {
            // adopt the leader's decision; our learners may lag behind
            state.decision = decision;
        } else if state.decision != decision {
            // can only happen when a surface-abort raced a slow leader
            pf_warn!("{} decision mismatch: local {:?}, leader {:?}",
                     tx, state.decision, decision);
        }

        self.maybe_standby_delete(tx)
    }

    /// A standby deletes its state as soon as it has observed all TP
    /// registrations and the leader's delete message. The stale-state sweep
    /// is the backstop when registrations never complete.
    fn maybe_standby_delete(&mut self, tx: TxId) -> Result<(), RingStoreError> {
        let Some(state) = self.txs.get(&tx) else {
            return Ok(());
        };
        if state.role_tag != TM_TAG
            && state.tm_deleted
            && state.num_tps_registered
                >= state.expected_tps(self.config.replication_factor)
        {
            pf_debug!("standby delete of {}", tx);
            self.gc_tx_state(tx)?;
        }
        Ok(())
    }

    /// A learner co-located with this manager decided one Paxos instance.
    pub(crate) fn handle_learner_decide(
        &mut self,
        item: ItemId,
        paxos: PaxosId,
        vote: Vote,
    ) -> Result<(), RingStoreError> {
        let Some(item_state) = self.items.get_mut(&item) else {
            return Ok(()); // late decide after cleanup
        };
        let Some(slot) = item_state
            .replicas
            .iter_mut()
            .find(|slot| slot.ring_key == paxos.replica)
        else {
            return logged_err!(
                "unknown replica slot for {} of item {}",
                paxos,
                item_state.item
            );
        };
        if slot.decided.is_some() {
            return Ok(());
        }
        slot.decided = Some(vote);
        pf_trace!("learner decided {} vote {:?}", paxos, vote);

        match vote {
            Vote::Prepared => item_state.num_prepared += 1,
            Vote::Abort => item_state.num_abort += 1,
        }
        debug_assert!(
            item_state.num_prepared + item_state.num_abort
                <= self.config.replication_factor
        );

        let item_decision = if item_state.decision.is_none() {
            if item_state.num_prepared >= self.config.quorum_factor {
                item_state.decision = Some(Vote::Prepared);
                Some(Vote::Prepared)
            } else if item_state.num_abort >= self.config.quorum_factor {
                item_state.decision = Some(Vote::Abort);
                Some(Vote::Abort)
            } else {
                None
            }
        } else {
            None
        };

        if let Some(state) = self.txs.get_mut(&item.tx) {
            state.num_paxdecided += 1;
        }

        if let Some(vote) = item_decision {
            pf_debug!("item {} decided {:?}", item, vote);
            self.on_item_decided(item.tx, vote)?;
        }
        Ok(())
    }

    /// An item of this transaction newly decided; re-evaluate the
    /// transaction decision.
    fn on_item_decided(
        &mut self,
        tx: TxId,
        vote: Vote,
    ) -> Result<(), RingStoreError> {
        let Some(state) = self.txs.get_mut(&tx) else {
            return Ok(());
        };
        match vote {
            Vote::Prepared => state.items_prepared += 1,
            Vote::Abort => state.items_abort += 1,
        }

        if state.decision != Decision::Undecided {
            return Ok(());
        }
        // commit iff every item is prepared; any abort item aborts
        if vote == Vote::Abort {
            state.decision = Decision::Abort;
        } else if state.items_prepared as usize == state.item_ids.len() {
            state.decision = Decision::Commit;
        } else {
            return Ok(());
        }

        let acting =
            state.role_tag == TM_TAG || state.took_over;
        pf_info!("{} decided {:?} ({} prepared / {} abort items)",
                 tx, state.decision, state.items_prepared, state.items_abort);
        if acting {
            self.propagate_decision(tx)?;
        }
        Ok(())
    }

    /// Pushes a reached decision out: commit replies to every participant,
    /// the single reply to the client, the delete broadcast to standbys,
    /// then schedules the delayed Paxos-state deletion.
    pub(crate) fn propagate_decision(
        &mut self,
        tx: TxId,
    ) -> Result<(), RingStoreError> {
        let Some(state) = self.txs.get(&tx) else {
            return Ok(());
        };
        let decision = state.decision;
        debug_assert_ne!(decision, Decision::Undecided);
        let client = state.client;
        let is_leader = state.role_tag == TM_TAG;
        let rtm_nodes: Vec<NodeId> =
            state.rtms.iter().map(|&(_, node)| node).collect();

        // inform every participant slot; unregistered slots are addressed
        // by ring routing so their locks still get released
        let mut inform = Vec::new();
        for item_id in &state.item_ids {
            if let Some(item_state) = self.items.get(item_id) {
                for slot in &item_state.replicas {
                    let target =
                        slot.tp.unwrap_or_else(|| self.ring.route(slot.ring_key));
                    inform.push((
                        PaxosId { tx, replica: slot.ring_key },
                        target,
                    ));
                }
            }
        }
        let num_informed = inform.len() as u16;
        for (paxos, target) in inform {
            self.route_send(
                PeerMsg::CommitReplyTp { paxos, decision },
                target,
            )?;
        }
        if let Some(state) = self.txs.get_mut(&tx) {
            state.num_informed = num_informed;
            pf_trace!("{} informed {} participant slots",
                      tx, state.num_informed);
        }

        // exactly one reply reaches the client
        let result = match decision {
            Decision::Commit => WireResult::Ok,
            _ => WireResult::Fail {
                reason: FailReason::Abort,
            },
        };
        self.reply_to_client(client, result)?;

        if is_leader {
            for node in rtm_nodes {
                self.route_send(
                    PeerMsg::TmDelete { tx, decision },
                    node,
                )?;
            }
        }

        // absorb late learner traffic before deleting Paxos state
        self.delayed_self(self.tx_timeout(), SelfMsg::LearnerDelete { tx });
        Ok(())
    }

    /// Handler of the delayed Paxos-state deletion.
    pub(crate) fn handle_learner_delete(
        &mut self,
        tx: TxId,
    ) -> Result<(), RingStoreError> {
        self.gc_tx_state(tx)
    }

    /// Deletes all manager and Paxos state of a transaction.
    pub(crate) fn gc_tx_state(
        &mut self,
        tx: TxId,
    ) -> Result<(), RingStoreError> {
        if let Some(state) = self.txs.remove(&tx) {
            for item_id in &state.item_ids {
                self.items.remove(item_id);
            }
            if state.role_tag != TM_TAG && state.status == MgrStatus::Ok {
                self.fd.unsubscribe(state.tm);
            }
        }
        self.learner.gc_tx(tx);
        self.acceptor.gc_tx(tx);
        self.proposer.gc_tx(tx);
        pf_trace!("gc'ed state of {}", tx);
        Ok(())
    }

    /// Periodic sweep of stale state: decided transactions whose cleanup
    /// messages were lost, uninitialized placeholders that never resolved,
    /// and aged participant decision-cache entries.
    pub(crate) fn sweep_stale_state(&mut self) -> Result<(), RingStoreError> {
        let cutoff = 3 * self.tx_timeout();
        let now = Instant::now();

        let stale: Vec<TxId> = self
            .txs
            .values()
            .filter(|state| {
                now.duration_since(state.created_at) >= cutoff
                    && (state.decision != Decision::Undecided
                        || state.status == MgrStatus::Uninitialized)
            })
            .map(|state| state.tx)
            .collect();
        for tx in stale {
            pf_debug!("sweeping stale state of {}", tx);
            self.gc_tx_state(tx)?;
        }

        self.decided_cache
            .retain(|_, (_, at)| now.duration_since(*at) < cutoff);
        Ok(())
    }
}
