//! CommitNode -- client request entry.
//!
//! A commit submitted by a local client makes this node the transaction's
//! leading manager; reads fan out to the key's replicas and resolve on a
//! majority; pub/sub operations are routed to the topic's owner node. A
//! node that does not currently know enough standby managers refuses to
//! lead and forwards commits along the ring instead.

use super::*;

use std::collections::{HashMap, VecDeque};

use crate::client::TLog;
use crate::node::{
    ApiReply, ApiRequest, ClientId, FailReason, NodeId, RequestId, Version,
    WireResult,
};
use crate::ring::RingKey;
use crate::utils::RingStoreError;

use tokio::time::Instant;

impl PubSubAction {
    fn topic(&self) -> &str {
        match self {
            PubSubAction::Publish { topic, .. }
            | PubSubAction::Subscribe { topic, .. }
            | PubSubAction::Unsubscribe { topic, .. }
            | PubSubAction::GetSubscribers { topic } => topic,
        }
    }
}

impl CommitNode {
    /// Dispatches a request received from a local client session.
    pub(crate) fn handle_api_req(
        &mut self,
        client: ClientId,
        req: ApiRequest,
    ) -> Result<(), RingStoreError> {
        match req {
            ApiRequest::Read { id, key } => {
                self.start_quorum_read(client, id, &key)
            }
            ApiRequest::Commit { id, tlog } => self.handle_commit(
                ClientRoute::Local { client, req: id },
                tlog,
            ),
            ApiRequest::Publish { id, topic, content } => self
                .start_pubsub_op(
                    client,
                    id,
                    PubSubAction::Publish { topic, content },
                ),
            ApiRequest::Subscribe { id, topic, url } => self.start_pubsub_op(
                client,
                id,
                PubSubAction::Subscribe { topic, url },
            ),
            ApiRequest::Unsubscribe { id, topic, url } => self
                .start_pubsub_op(
                    client,
                    id,
                    PubSubAction::Unsubscribe { topic, url },
                ),
            ApiRequest::GetSubscribers { id, topic } => self.start_pubsub_op(
                client,
                id,
                PubSubAction::GetSubscribers { topic },
            ),
            ApiRequest::Leave => {
                self.api.send_reply(ApiReply::Leave, client)
            }
        }
    }

    /// Leads the commit of a submitted transaction log: mints IDs, creates
    /// the manager state, enlists standbys, initializes participants, and
    /// seeds the local learners.
    pub(crate) fn handle_commit(
        &mut self,
        route: ClientRoute,
        tlog: TLog,
    ) -> Result<(), RingStoreError> {
        if tlog.is_empty() {
            // nothing to validate, so every item is vacuously prepared;
            // commit outcomes on the wire are only ok or abort
            return self.reply_to_client(route, WireResult::Ok);
        }
        if tlog.poisoned() {
            // a failed operation in the log can only validate to abort
            return self.reply_to_client(
                route,
                WireResult::Fail {
                    reason: FailReason::Abort,
                },
            );
        }
        if !self.mgr_ready() {
            pf_warn!("not enough standby managers known, forwarding commit");
            return self.forward_commit(route, tlog, 0);
        }

        self.next_tx_seq += 1;
        let tx = TxId {
            tm: self.id,
            seq: self.next_tx_seq,
        };

        let rtms: Vec<(u8, NodeId)> = self
            .rtms
            .iter()
            .filter_map(|desc| desc.node.map(|node| (desc.index, node)))
            .collect();
        let mut managers = vec![self.id];
        for &(_, node) in &rtms {
            if !managers.contains(&node) {
                managers.push(node);
            }
        }
        let acceptors = managers.clone();

        pf_debug!("commit {} with {} items, {} standbys",
                  tx, tlog.len(), rtms.len());

        // the snapshot's client route must survive my crash, so it names
        // me as the origin explicitly
        let snapshot_client = match route {
            ClientRoute::Local { client, req } => ClientRoute::Remote {
                origin: self.id,
                client,
                req,
            },
            remote => remote,
        };

        let mut item_ids = Vec::with_capacity(tlog.len());
        let mut snapshots = Vec::with_capacity(tlog.len());
        let mut inits = Vec::new();
        for (idx, entry) in tlog.entries().enumerate() {
            let item = ItemId {
                tx,
                idx: idx as u16,
            };
            let ring_keys =
                self.ring.replica_keys(self.ring.key_of(&entry.key));

            let mut item_state = ItemState {
                item,
                entry: entry.clone(),
                replicas: Vec::with_capacity(ring_keys.len()),
                num_prepared: 0,
                num_abort: 0,
                decision: None,
            };
            for &ring_key in &ring_keys {
                let paxos = PaxosId { tx, replica: ring_key };
                self.learner.seed(paxos, item, self.config.quorum_factor);
                item_state.replicas.push(ReplicaSlot {
                    ring_key,
                    tp: None,
                    decided: None,
                });
                inits.push((
                    self.ring.route(ring_key),
                    PeerMsg::InitTp {
                        item,
                        paxos,
                        ring_key,
                        entry: entry.clone(),
                        tm: self.id,
                        managers: managers.clone(),
                        acceptors: acceptors.clone(),
                        quorum: self.config.quorum_factor,
                    },
                ));
            }
            self.items.insert(item, item_state);

            item_ids.push(item);
            snapshots.push(ItemSnapshot {
                item,
                entry: entry.clone(),
                ring_keys,
            });
        }

        self.txs.insert(
            tx,
            TxState {
                tx,
                role_tag: TM_TAG,
                client: route,
                tm: self.id,
                rtms: rtms.clone(),
                acceptors: acceptors.clone(),
                item_ids,
                items_prepared: 0,
                items_abort: 0,
                num_paxdecided: 0,
                num_tps_registered: 0,
                num_informed: 0,
                decision: Decision::Undecided,
                status: MgrStatus::Ok,
                hold_back: VecDeque::new(),
                tm_deleted: false,
                took_over: false,
                deferred: false,
                armed_paxdecided: 0,
                created_at: Instant::now(),
            },
        );

        // enlist standby managers (one InitRtm per standby node)
        let snapshot = TxSnapshot {
            tx,
            client: snapshot_client,
            tm: self.id,
            rtms: rtms.clone(),
            acceptors,
        };
        let mut enlisted = Vec::new();
        for &(index, node) in &rtms {
            if node == self.id || enlisted.contains(&node) {
                continue;
            }
            enlisted.push(node);
            self.route_send(
                PeerMsg::InitRtm {
                    snapshot: snapshot.clone(),
                    items: snapshots.clone(),
                    role_index: index,
                },
                node,
            )?;
        }

        // initialize every replica's participant
        for (target, msg) in inits {
            self.route_send(msg, target)?;
        }

        // weak completion check for this transaction
        self.delayed_self(2 * self.tx_timeout(), SelfMsg::TidIsDone { tx });
        Ok(())
    }

    /// Starts a quorum read of one key: probe all replicas, resolve on a
    /// majority of found replies.
    fn start_quorum_read(
        &mut self,
        client: ClientId,
        req: RequestId,
        key: &str,
    ) -> Result<(), RingStoreError> {
        let ring_keys = self.ring.replica_keys(self.ring.key_of(key));
        self.next_read_id += 1;
        let read_id = self.next_read_id;

        self.pending_reads.insert(
            read_id,
            ReadState {
                client,
                req,
                replies: HashMap::new(),
                total: ring_keys.len() as u8,
                quorum: self.config.quorum_factor,
            },
        );

        pf_trace!("quorum read {} of '{}' across {} replicas",
                  read_id, key, ring_keys.len());
        for ring_key in ring_keys {
            let target = self.ring.route(ring_key);
            self.route_send(PeerMsg::ReadKey { read_id, ring_key }, target)?;
        }

        self.delayed_self(self.tx_timeout(), SelfMsg::ReadExpire { read_id });
        Ok(())
    }

    /// Handler of one replica's read probe reply.
    pub(crate) fn handle_read_reply(
        &mut self,
        read_id: u64,
        ring_key: RingKey,
        found: Option<(String, Version)>,
    ) -> Result<(), RingStoreError> {
        let Some(read) = self.pending_reads.get_mut(&read_id) else {
            return Ok(()); // already resolved or expired
        };
        read.replies.insert(ring_key, found);

        let found_cnt =
            read.replies.values().filter(|r| r.is_some()).count() as u8;
        if found_cnt >= read.quorum {
            // majority found the key: newest version wins
            let (value, version) = read
                .replies
                .values()
                .flatten()
                .max_by_key(|&&(_, version)| version)
                .cloned()
                .unwrap();
            let (client, req) = (read.client, read.req);
            self.pending_reads.remove(&read_id);
            self.api.send_reply(
                ApiReply::Reply {
                    id: req,
                    result: WireResult::Value { value, version },
                },
                client,
            )
        } else if read.replies.len() as u8 == read.total {
            // everyone answered but no found-majority exists
            let (client, req) = (read.client, read.req);
            self.pending_reads.remove(&read_id);
            self.api.send_reply(
                ApiReply::Reply {
                    id: req,
                    result: WireResult::Fail {
                        reason: FailReason::NotFound,
                    },
                },
                client,
            )
        } else {
            Ok(())
        }
    }

    /// Handler of a quorum read expiring without resolution: a found
    /// majority never assembled.
    pub(crate) fn handle_read_expire(
        &mut self,
        read_id: u64,
    ) -> Result<(), RingStoreError> {
        let Some(read) = self.pending_reads.remove(&read_id) else {
            return Ok(());
        };
        pf_debug!("quorum read {} expired with {}/{} replies",
                  read_id, read.replies.len(), read.total);
        self.api.send_reply(
            ApiReply::Reply {
                id: read.req,
                result: WireResult::Fail {
                    reason: FailReason::NotFound,
                },
            },
            read.client,
        )
    }

    /// Starts a pub/sub operation, applying it locally if this node owns
    /// the topic and routing it to the owner otherwise.
    fn start_pubsub_op(
        &mut self,
        client: ClientId,
        req: RequestId,
        action: PubSubAction,
    ) -> Result<(), RingStoreError> {
        let owner = self.ring.route(self.ring.key_of(action.topic()));
        if owner == self.id {
            let result = self.apply_pubsub_action(action);
            return self.api.send_reply(
                ApiReply::Reply { id: req, result },
                client,
            );
        }

        self.next_pubsub_id += 1;
        let op_id = self.next_pubsub_id;
        self.pending_pubsub.insert(op_id, (client, req));
        self.route_send(PeerMsg::PubSubFwd { op_id, action }, owner)?;
        self.delayed_self(self.tx_timeout(), SelfMsg::PubSubExpire { op_id });
        Ok(())
    }

    /// Applies a pub/sub operation on this node's topic store.
    pub(crate) fn apply_pubsub_action(
        &mut self,
        action: PubSubAction,
    ) -> WireResult {
        use crate::pubsub::UnsubOutcome;

        match action {
            PubSubAction::Publish { topic, content } => {
                self.pubsub.publish(&topic, &content);
                WireResult::Ok
            }
            PubSubAction::Subscribe { topic, url } => {
                self.pubsub.subscribe(&topic, &url);
                WireResult::Ok
            }
            PubSubAction::Unsubscribe { topic, url } => {
                match self.pubsub.unsubscribe(&topic, &url) {
                    UnsubOutcome::Removed => WireResult::Ok,
                    UnsubOutcome::NotFound => WireResult::Fail {
                        reason: FailReason::NotFound,
                    },
                }
            }
            PubSubAction::GetSubscribers { topic } => WireResult::Subscribers {
                urls: self.pubsub.subscribers(&topic),
            },
        }
    }

    /// Handler of a routed pub/sub operation's reply.
    pub(crate) fn handle_pubsub_reply(
        &mut self,
        op_id: u64,
        result: WireResult,
    ) -> Result<(), RingStoreError> {
        let Some((client, req)) = self.pending_pubsub.remove(&op_id) else {
            return Ok(());
        };
        self.api
            .send_reply(ApiReply::Reply { id: req, result }, client)
    }

    /// Handler of a routed pub/sub operation expiring unanswered.
    pub(crate) fn handle_pubsub_expire(
        &mut self,
        op_id: u64,
    ) -> Result<(), RingStoreError> {
        let Some((client, req)) = self.pending_pubsub.remove(&op_id) else {
            return Ok(());
        };
        self.api.send_reply(
            ApiReply::Reply {
                id: req,
                result: WireResult::Fail {
                    reason: FailReason::Timeout,
                },
            },
            client,
        )
    }

    /// Forwards a commit along the ring toward a manager that is ready,
    /// with a hop budget.
    fn forward_commit(
        &mut self,
        route: ClientRoute,
        tlog: TLog,
        hops: u8,
    ) -> Result<(), RingStoreError> {
        if hops >= self.config.fwd_max_hops {
            return self.reply_to_client(
                route,
                WireResult::Fail {
                    reason: FailReason::Timeout,
                },
            );
        }

        let (origin, client, req) = match route {
            ClientRoute::Local { client, req } => (self.id, client, req),
            ClientRoute::Remote {
                origin,
                client,
                req,
            } => (origin, client, req),
        };
        let target = (self.id + 1) % self.population;
        self.route_send(
            PeerMsg::FwdCommit {
                origin,
                client,
                req,
                tlog,
                hops: hops + 1,
            },
            target,
        )?;

        if origin == self.id {
            self.pending_fwds.insert((client, req), Instant::now());
            self.delayed_self(
                4 * self.tx_timeout(),
                SelfMsg::FwdExpire { client, req },
            );
        }
        Ok(())
    }

    /// Handler of a commit forwarded from a node in initialization mode.
    pub(crate) fn handle_fwd_commit(
        &mut self,
        origin: NodeId,
        client: ClientId,
        req: RequestId,
        tlog: TLog,
        hops: u8,
    ) -> Result<(), RingStoreError> {
        let route = ClientRoute::Remote {
            origin,
            client,
            req,
        };
        if self.mgr_ready() {
            self.handle_commit(route, tlog)
        } else {
            self.forward_commit(route, tlog, hops)
        }
    }

    /// Handler of a forwarded commit's reply arriving back at the origin.
    pub(crate) fn handle_fwd_commit_reply(
        &mut self,
        client: ClientId,
        req: RequestId,
        result: WireResult,
    ) -> Result<(), RingStoreError> {
        if self.pending_fwds.remove(&(client, req)).is_none() {
            return Ok(()); // already expired toward the client
        }
        self.api
            .send_reply(ApiReply::Reply { id: req, result }, client)
    }

    /// Handler of a forwarded commit expiring without a reply.
    pub(crate) fn handle_fwd_expire(
        &mut self,
        client: ClientId,
        req: RequestId,
    ) -> Result<(), RingStoreError> {
        if self.pending_fwds.remove(&(client, req)).is_none() {
            return Ok(());
        }
        self.api.send_reply(
            ApiReply::Reply {
                id: req,
                result: WireResult::Fail {
                    reason: FailReason::Timeout,
                },
            },
            client,
        )
    }
}
