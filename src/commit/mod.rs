//! Replicated transaction commit engine: Paxos-Commit over a chord-like
//! ring with symmetric replication.
//!
//! Every node hosts one instance of each co-located role: the transaction
//! manager (TM) for commits originated by local clients, standby managers
//! (RTMs) for transactions led by peers, the transaction participant (TP)
//! for the key replicas it hosts, and one Paxos acceptor / proposer /
//! learner. One `CommitNode` actor owns all of their private state and
//! serializes every handler in a single event loop; parallelism is between
//! nodes, not within one.
//!
//! References:
//!   - Gray & Lamport, "Consensus on Transaction Commit"
//!   - <https://dl.acm.org/doi/10.1145/1132863.1132867>

mod manager;
mod membership;
mod messages;
mod participant;
mod request;
mod takeover;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use crate::client::{TLog, TLogEntry};
use crate::node::{
    ApiHub, ApiReply, ClientId, FailureDetector, FdEvent, KvStore, NodeId,
    RequestId, TransportHub, Version, WireResult,
};
use crate::paxos::{AcceptorRole, Ballot, LearnerRole, ProposerRole, Vote};
use crate::pubsub::PubSubStore;
use crate::ring::{RingKey, RingView};
use crate::utils::RingStoreError;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitConfig {
    /// Number of replicas per key; also the count of managers (TM + RTMs)
    /// enlisted per transaction.
    pub replication_factor: u8,

    /// Majority threshold; must satisfy `2 * quorum_factor >
    /// replication_factor`.
    pub quorum_factor: u8,

    /// Base transaction timeout in millisecs: takeover checks fire at 2x,
    /// the stale-state sweep at 3x.
    pub tx_timeout_ms: u64,

    /// Period of standby manager rediscovery in millisecs.
    pub tx_rtm_update_interval_ms: u64,

    /// Minimum number of known managers (self included) required to accept
    /// new commits; below it the node forwards commits away.
    pub rtm_min_known: u8,

    /// Min timeout of not hearing any heartbeat from a peer in millisecs.
    pub hb_hear_timeout_min_ms: u64,
    /// Max timeout of not hearing any heartbeat from a peer in millisecs.
    pub hb_hear_timeout_max_ms: u64,

    /// Interval of sending heartbeats to peers in millisecs.
    pub hb_send_interval_ms: u64,

    /// Hop budget when forwarding commits during initialization mode.
    pub fwd_max_hops: u8,
}

#[allow(clippy::derivable_impls)]
impl Default for CommitConfig {
    fn default() -> Self {
        CommitConfig {
            replication_factor: 4,
            quorum_factor: 3,
            tx_timeout_ms: 1000,
            tx_rtm_update_interval_ms: 500,
            rtm_min_known: 3,
            hb_hear_timeout_min_ms: 1200,
            hb_hear_timeout_max_ms: 2000,
            hb_send_interval_ms: 100,
            fwd_max_hops: 8,
        }
    }
}

/// Globally unique transaction ID: minting manager plus a local sequence
/// number.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize,
    Deserialize,
)]
pub struct TxId {
    pub tm: NodeId,
    pub seq: u64,
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "t{}.{}", self.tm, self.seq)
    }
}

/// Globally unique item ID: one per TLog entry of a transaction.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize,
    Deserialize,
)]
pub struct ItemId {
    pub tx: TxId,
    pub idx: u16,
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.tx, self.idx)
    }
}

/// Identifier of one vote-consensus instance: `(tx_id, key_replica)`.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize,
    Deserialize,
)]
pub struct PaxosId {
    pub tx: TxId,
    pub replica: RingKey,
}

impl fmt::Display for PaxosId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{:x}", self.tx, self.replica)
    }
}

/// Transaction-level decision. Flips away from `Undecided` at most once.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize,
)]
pub enum Decision {
    Undecided,
    Commit,
    Abort,
}

/// Manager-table entry status. Messages arriving while not yet `Ok` are
/// appended to the entry's hold-back queue and replayed in FIFO order on
/// promotion.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum MgrStatus {
    Uninitialized,
    Ok,
}

/// Where to deliver the single commit reply of a transaction.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub(crate) enum ClientRoute {
    /// Client session on the manager's own node.
    Local { client: ClientId, req: RequestId },

    /// Client session on the node that forwarded the commit.
    Remote {
        origin: NodeId,
        client: ClientId,
        req: RequestId,
    },
}

/// Ballot owner tag of the transaction participant's round-0 proposal.
pub(crate) const TP_TAG: u8 = 1;

/// Ballot owner tag of the leading transaction manager.
pub(crate) const TM_TAG: u8 = 2;

/// Per-transaction manager state, kept identically at the TM and every
/// RTM; only the role tag differs.
pub(crate) struct TxState {
    pub(crate) tx: TxId,

    /// My ballot owner tag for this transaction: `TM_TAG` at the leader,
    /// `TM_TAG + role_index` at standby managers.
    pub(crate) role_tag: u8,

    pub(crate) client: ClientRoute,
    pub(crate) tm: NodeId,

    /// Standby managers as (role index, node) pairs.
    pub(crate) rtms: Vec<(u8, NodeId)>,

    /// Acceptor set of every Paxos instance of this transaction.
    pub(crate) acceptors: Vec<NodeId>,

    pub(crate) item_ids: Vec<ItemId>,

    /// Items decided prepared / abort so far.
    pub(crate) items_prepared: u16,
    pub(crate) items_abort: u16,

    /// Paxos instances decided so far.
    pub(crate) num_paxdecided: u16,

    /// TP registrations observed so far (at most R per item).
    pub(crate) num_tps_registered: u16,

    /// Commit replies pushed to TPs after the decision.
    pub(crate) num_informed: u16,

    pub(crate) decision: Decision,
    pub(crate) status: MgrStatus,

    /// Messages that arrived before promotion to `Ok`.
    pub(crate) hold_back: VecDeque<(NodeId, PeerMsg)>,

    /// Standby side: the leader has broadcast its delete message.
    pub(crate) tm_deleted: bool,

    /// Standby side: this manager started a takeover and now acts as the
    /// leader for decision propagation.
    pub(crate) took_over: bool,

    /// The takeover check was re-deferred once already.
    pub(crate) deferred: bool,

    /// Decided-instance count seen when the takeover check was armed.
    pub(crate) armed_paxdecided: u16,

    pub(crate) created_at: Instant,
}

impl TxState {
    /// Expected number of TP registrations: R per item.
    pub(crate) fn expected_tps(&self, replication: u8) -> u16 {
        self.item_ids.len() as u16 * replication as u16
    }
}

/// Per-item manager state: the TLog entry and its R Paxos instances.
pub(crate) struct ItemState {
    pub(crate) item: ItemId,
    pub(crate) entry: TLogEntry,

    /// One slot per key replica, in `replica_keys` order.
    pub(crate) replicas: Vec<ReplicaSlot>,

    pub(crate) num_prepared: u8,
    pub(crate) num_abort: u8,

    /// Item decision: first vote kind to reach a majority of replicas.
    pub(crate) decision: Option<Vote>,
}

/// One key replica's consensus slot within an item.
pub(crate) struct ReplicaSlot {
    pub(crate) ring_key: RingKey,

    /// The participant that registered for this slot, once known.
    pub(crate) tp: Option<NodeId>,

    /// Decided vote of this slot's Paxos instance, once learned.
    pub(crate) decided: Option<Vote>,
}

/// Manager-state snapshot shipped in `InitRtm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TxSnapshot {
    pub(crate) tx: TxId,
    pub(crate) client: ClientRoute,
    pub(crate) tm: NodeId,
    pub(crate) rtms: Vec<(u8, NodeId)>,
    pub(crate) acceptors: Vec<NodeId>,
}

/// Item-state snapshot shipped in `InitRtm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ItemSnapshot {
    pub(crate) item: ItemId,
    pub(crate) entry: TLogEntry,
    pub(crate) ring_keys: Vec<RingKey>,
}

/// Pub/sub operation forwarded to the topic's owner node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum PubSubAction {
    Publish { topic: String, content: String },
    Subscribe { topic: String, url: String },
    Unsubscribe { topic: String, url: String },
    GetSubscribers { topic: String },
}

/// Node-to-node message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum PeerMsg {
    /// Periodic liveness ping.
    Heartbeat,
    /// Reply to a liveness ping.
    HeartbeatReply,

    /// TM enlisting a standby manager with full transaction state.
    InitRtm {
        snapshot: TxSnapshot,
        items: Vec<ItemSnapshot>,
        role_index: u8,
    },

    /// TP registering itself as the owner of one consensus slot.
    RegisterTp {
        item: ItemId,
        paxos: PaxosId,
        tp: NodeId,
    },

    /// TM notifying standbys that a decided transaction may be deleted.
    TmDelete { tx: TxId, decision: Decision },

    /// Timed-out manager asking a standby to drive the decision itself.
    ProposeYourself { tx: TxId },

    /// Standby-manager lookup: who owns this manager ring key?
    GetRtm { index: u8, ring_key: RingKey },
    /// Lookup reply; the responder implicitly names itself.
    GetRtmReply { index: u8, ring_key: RingKey },

    /// Commit forwarded away from a manager in initialization mode.
    FwdCommit {
        origin: NodeId,
        client: ClientId,
        req: RequestId,
        tlog: TLog,
        hops: u8,
    },
    /// Commit reply travelling back to the forwarding node.
    FwdCommitReply {
        client: ClientId,
        req: RequestId,
        result: WireResult,
    },

    /// TM initializing a transaction participant for one consensus slot.
    InitTp {
        item: ItemId,
        paxos: PaxosId,
        ring_key: RingKey,
        entry: TLogEntry,
        tm: NodeId,
        managers: Vec<NodeId>,
        acceptors: Vec<NodeId>,
        quorum: u8,
    },

    /// Decision pushed to a participant: apply (commit) or release (abort).
    CommitReplyTp { paxos: PaxosId, decision: Decision },

    /// Paxos phase-1 request.
    PaxPrepare { paxos: PaxosId, ballot: Ballot },
    /// Paxos phase-1 reply with the highest accepted value.
    PaxPrepareReply {
        paxos: PaxosId,
        ballot: Ballot,
        voted: Option<(Ballot, Vote)>,
    },
    /// Paxos phase-2 request carrying the learner set to notify.
    PaxAccept {
        paxos: PaxosId,
        ballot: Ballot,
        vote: Vote,
        learners: Vec<NodeId>,
    },
    /// Acceptor notifying a learner of an accept.
    PaxAccepted {
        paxos: PaxosId,
        ballot: Ballot,
        vote: Vote,
    },
    /// Takeover propagating a learner subscription to an acceptor.
    PaxRegisterLearner { paxos: PaxosId, learner: NodeId },

    /// Quorum-read probe of one replica.
    ReadKey { read_id: u64, ring_key: RingKey },
    /// Quorum-read probe reply.
    ReadKeyReply {
        read_id: u64,
        ring_key: RingKey,
        found: Option<(String, Version)>,
    },

    /// Pub/sub operation routed to the topic's owner.
    PubSubFwd { op_id: u64, action: PubSubAction },
    /// Pub/sub operation reply.
    PubSubFwdReply { op_id: u64, result: WireResult },
}

/// Delayed self-messages: all protocol timeouts are encoded as messages to
/// self so that every transition runs inside the single event loop.
#[derive(Debug, Clone)]
pub(crate) enum SelfMsg {
    /// Takeover check, armed at 2x `tx_timeout` when a commit starts.
    TidIsDone { tx: TxId },

    /// Surface-abort check, armed at 2x `tx_timeout` when takeover starts.
    TidGiveUp { tx: TxId },

    /// Delayed Paxos-state deletion absorbing late learner traffic.
    LearnerDelete { tx: TxId },

    /// Quorum-read expiry.
    ReadExpire { read_id: u64 },

    /// Routed pub/sub operation expiry.
    PubSubExpire { op_id: u64 },

    /// Forwarded-commit expiry.
    FwdExpire { client: ClientId, req: RequestId },

    /// Loopback delivery of a peer message addressed to self.
    Deliver { peer: NodeId, msg: PeerMsg },
}

/// Standby-manager descriptor maintained by the leader, refreshed by the
/// periodic unreliable lookup.
pub(crate) struct RtmDescriptor {
    pub(crate) index: u8,
    pub(crate) ring_key: RingKey,
    pub(crate) node: Option<NodeId>,
    pub(crate) last_reply: Option<Instant>,
}

/// In-flight quorum read bookkeeping.
pub(crate) struct ReadState {
    pub(crate) client: ClientId,
    pub(crate) req: RequestId,
    pub(crate) replies: HashMap<RingKey, Option<(String, Version)>>,
    pub(crate) total: u8,
    pub(crate) quorum: u8,
}

/// Participant-side record of a vote awaiting the transaction decision.
pub(crate) struct PendingVote {
    pub(crate) ring_key: RingKey,
    pub(crate) entry: TLogEntry,
    pub(crate) vote: Vote,
}

/// One ringstore node: hosts a ring partition plus all co-located commit
/// roles, driven by a single event loop.
pub struct CommitNode {
    /// My node ID.
    pub(crate) id: NodeId,

    /// Total number of nodes on the ring.
    pub(crate) population: u8,

    /// Configuration parameters struct.
    pub(crate) config: CommitConfig,

    /// Static overlay view.
    pub(crate) ring: RingView,

    /// Client-facing API module.
    pub(crate) api: ApiHub,

    /// Node-to-node transport module.
    pub(crate) transport: TransportHub<PeerMsg>,

    /// Failure detector module.
    pub(crate) fd: FailureDetector,

    /// Replica records hosted by this node.
    pub(crate) store: KvStore,

    /// Subscriber lists of topics owned by this node.
    pub(crate) pubsub: PubSubStore,

    /// Paxos roles, keyed by `PaxosId`.
    pub(crate) acceptor: AcceptorRole,
    pub(crate) proposer: ProposerRole,
    pub(crate) learner: LearnerRole,

    /// Manager tables: all in-flight transaction state.
    pub(crate) txs: HashMap<TxId, TxState>,
    pub(crate) items: HashMap<ItemId, ItemState>,

    /// Participant-side votes awaiting decisions.
    pub(crate) pending_votes: HashMap<PaxosId, PendingVote>,

    /// Participant-side decisions already applied, for idempotent handling
    /// of late or duplicate messages. Swept periodically.
    pub(crate) decided_cache: HashMap<PaxosId, (Decision, Instant)>,

    /// My standby-manager descriptors (role indices 1..R-1).
    pub(crate) rtms: Vec<RtmDescriptor>,

    /// In-flight quorum reads by read ID.
    pub(crate) pending_reads: HashMap<u64, ReadState>,

    /// In-flight routed pub/sub operations by op ID.
    pub(crate) pending_pubsub: HashMap<u64, (ClientId, RequestId)>,

    /// In-flight forwarded commits awaiting a remote reply.
    pub(crate) pending_fwds: HashMap<(ClientId, RequestId), Instant>,

    /// ID mints.
    pub(crate) next_tx_seq: u64,
    pub(crate) next_read_id: u64,
    pub(crate) next_pubsub_id: u64,

    /// Sender side of the self-message channel, cloned into delay tasks.
    pub(crate) tx_self: mpsc::UnboundedSender<SelfMsg>,

    /// Receiver side of the self-message channel.
    rx_self: mpsc::UnboundedReceiver<SelfMsg>,

    /// Timer for standby manager rediscovery.
    rtm_update_interval: Interval,

    /// Timer for the stale-state sweep.
    sweep_interval: Interval,
}

impl CommitNode {
    /// Creates a new node, sets up all functionality modules, and connects
    /// to all peers.
    pub async fn new_and_setup(
        id: NodeId,
        population: u8,
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        peer_addrs: HashMap<NodeId, SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, RingStoreError> {
        let config = parsed_config!(config_str => CommitConfig;
                                    replication_factor, quorum_factor,
                                    tx_timeout_ms, tx_rtm_update_interval_ms,
                                    rtm_min_known,
                                    hb_hear_timeout_min_ms,
                                    hb_hear_timeout_max_ms,
                                    hb_send_interval_ms, fwd_max_hops)?;
        if config.replication_factor == 0 {
            return logged_err!(
                "invalid config.replication_factor '{}'",
                config.replication_factor
            );
        }
        if config.quorum_factor > config.replication_factor
            || 2 * config.quorum_factor <= config.replication_factor
        {
            return logged_err!(
                "invalid config.quorum_factor '{}' for replication {}",
                config.quorum_factor,
                config.replication_factor
            );
        }
        if config.tx_timeout_ms == 0 {
            return logged_err!(
                "invalid config.tx_timeout_ms '{}'",
                config.tx_timeout_ms
            );
        }
        if config.tx_rtm_update_interval_ms == 0 {
            return logged_err!(
                "invalid config.tx_rtm_update_interval_ms '{}'",
                config.tx_rtm_update_interval_ms
            );
        }
        if config.rtm_min_known < config.quorum_factor
            || config.rtm_min_known > config.replication_factor
        {
            // a leader must know at least a Paxos quorum of managers, or
            // the transactions it starts could never decide
            return logged_err!(
                "invalid config.rtm_min_known '{}'",
                config.rtm_min_known
            );
        }

        let ring = RingView::new(population, config.replication_factor);

        let api = ApiHub::new_and_setup(id, api_addr).await?;

        let mut transport =
            TransportHub::new_and_setup(id, population, p2p_addr).await?;

        let mut fd = FailureDetector::new_and_setup(
            id,
            population,
            Duration::from_millis(config.hb_hear_timeout_min_ms),
            Duration::from_millis(config.hb_hear_timeout_max_ms),
            Duration::from_millis(config.hb_send_interval_ms),
        )?;

        // proactively connect to peers with smaller IDs, then wait for the
        // whole ring to be connected with me
        for (peer, conn_addr) in peer_addrs {
            if peer < id {
                transport.connect_to_peer(peer, conn_addr).await?;
            }
        }
        transport.wait_for_group(population).await?;
        fd.kickoff_hear_timers()?;

        // my standby manager ring keys; index 0 is myself
        let rtms = ring
            .manager_keys(id)
            .into_iter()
            .enumerate()
            .skip(1)
            .map(|(index, ring_key)| RtmDescriptor {
                index: index as u8,
                ring_key,
                node: None,
                last_reply: None,
            })
            .collect();

        let mut rtm_update_interval = time::interval(Duration::from_millis(
            config.tx_rtm_update_interval_ms,
        ));
        rtm_update_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sweep_interval =
            time::interval(Duration::from_millis(3 * config.tx_timeout_ms));
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (tx_self, rx_self) = mpsc::unbounded_channel();

        Ok(CommitNode {
            id,
            population,
            config,
            ring,
            api,
            transport,
            fd,
            store: KvStore::new(),
            pubsub: PubSubStore::new(),
            acceptor: AcceptorRole::new(),
            proposer: ProposerRole::new(),
            learner: LearnerRole::new(),
            txs: HashMap::new(),
            items: HashMap::new(),
            pending_votes: HashMap::new(),
            decided_cache: HashMap::new(),
            rtms,
            pending_reads: HashMap::new(),
            pending_pubsub: HashMap::new(),
            pending_fwds: HashMap::new(),
            next_tx_seq: 0,
            next_read_id: 0,
            next_pubsub_id: 0,
            tx_self,
            rx_self,
            rtm_update_interval,
            sweep_interval,
        })
    }

    /// Base transaction timeout duration.
    #[inline]
    pub(crate) fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.config.tx_timeout_ms)
    }

    /// Sends a peer message, looping it back through the self channel when
    /// the target is this node, so that handling stays inside the event
    /// loop either way.
    pub(crate) fn route_send(
        &mut self,
        msg: PeerMsg,
        target: NodeId,
    ) -> Result<(), RingStoreError> {
        if target == self.id {
            self.tx_self.send(SelfMsg::Deliver {
                peer: self.id,
                msg,
            })?;
            Ok(())
        } else {
            self.transport.send_msg(msg, target)
        }
    }

    /// Enqueues a self-message after the given delay.
    pub(crate) fn delayed_self(&self, dur: Duration, msg: SelfMsg) {
        let tx_self = self.tx_self.clone();
        tokio::spawn(async move {
            time::sleep(dur).await;
            // receiver gone means the node is shutting down
            let _ = tx_self.send(msg);
        });
    }

    /// Delivers the single reply of a transaction commit toward its client.
    pub(crate) fn reply_to_client(
        &mut self,
        route: ClientRoute,
        result: WireResult,
    ) -> Result<(), RingStoreError> {
        match route {
            ClientRoute::Local { client, req } => self.api.send_reply(
                ApiReply::Reply {
                    id: req,
                    result,
                },
                client,
            ),
            ClientRoute::Remote {
                origin,
                client,
                req,
            } => self.route_send(
                PeerMsg::FwdCommitReply {
                    client,
                    req,
                    result,
                },
                origin,
            ),
        }
    }

    /// Main event loop of running this node. Returns after observing a
    /// termination signal on `rx_term`.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RingStoreError> {
        // initial standby manager discovery round
        if let Err(e) = self.refresh_rtms() {
            pf_error!("error starting rtm discovery: {}", e);
        }

        loop {
            tokio::select! {
                // client request
                req = self.api.get_req() => {
                    let Ok((client, req)) = req else {
                        continue;
                    };
                    if let Err(e) = self.handle_api_req(client, req) {
                        pf_error!("error handling client request: {}", e);
                    }
                },

                // message from peer
                msg = self.transport.recv_msg() => {
                    let Ok((peer, msg)) = msg else {
                        continue;
                    };
                    if let Err(e) = self.handle_peer_msg(peer, msg) {
                        pf_error!("error handling msg <- {}: {}", peer, e);
                    }
                },

                // self-message (protocol timeout or loopback delivery)
                msg = self.rx_self.recv() => {
                    let Some(msg) = msg else {
                        continue;
                    };
                    if let Err(e) = self.handle_self_msg(msg) {
                        pf_error!("error handling self message: {}", e);
                    }
                },

                // failure-detector event
                event = self.fd.get_event() => {
                    let Ok(event) = event else {
                        continue;
                    };
                    match event {
                        FdEvent::SendTicked => {
                            if let Err(e) = self.transport.bcast_msg(
                                PeerMsg::Heartbeat, None,
                            ) {
                                pf_error!("error broadcasting heartbeats: {}", e);
                            }
                        }
                        FdEvent::Suspect { node } => {
                            if let Err(e) = self.handle_crash(node) {
                                pf_error!("error handling crash of {}: {}",
                                          node, e);
                            }
                        }
                    }
                },

                // standby manager rediscovery tick
                _ = self.rtm_update_interval.tick() => {
                    if let Err(e) = self.refresh_rtms() {
                        pf_error!("error refreshing rtms: {}", e);
                    }
                },

                // stale-state sweep tick
                _ = self.sweep_interval.tick() => {
                    if let Err(e) = self.sweep_stale_state() {
                        pf_error!("error sweeping stale state: {}", e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("node caught termination signal");
                    return Ok(());
                }
            }
        }
    }

    /// Dispatches a self-message.
    fn handle_self_msg(&mut self, msg: SelfMsg) -> Result<(), RingStoreError> {
        match msg {
            SelfMsg::TidIsDone { tx } => self.handle_tid_isdone(tx),
            SelfMsg::TidGiveUp { tx } => self.handle_tid_giveup(tx),
            SelfMsg::LearnerDelete { tx } => self.handle_learner_delete(tx),
            SelfMsg::ReadExpire { read_id } => self.handle_read_expire(read_id),
            SelfMsg::PubSubExpire { op_id } => {
                self.handle_pubsub_expire(op_id)
            }
            SelfMsg::FwdExpire { client, req } => {
                self.handle_fwd_expire(client, req)
            }
            SelfMsg::Deliver { peer, msg } => self.handle_peer_msg(peer, msg),
        }
    }
}
