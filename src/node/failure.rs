//! Failure detector: heartbeat mesh with randomized hearing timeouts plus
//! refcounted crash subscriptions.
//!
//! Every node heartbeats all peers. A peer is speculated dead when its
//! hearing timer explodes or when it misses too many consecutive heartbeat
//! replies. Suspicion events are delivered only for peers some role has
//! subscribed to; multiple in-flight transactions watching the same peer
//! share one subscription through reference counts.

use std::collections::{HashMap, VecDeque};

use crate::node::NodeId;
use crate::utils::{Bitmap, RingStoreError, Timer};

use rand::prelude::*;

use tokio::sync::mpsc;
use tokio::time::{self, Duration, Interval, MissedTickBehavior};

/// Multiplexed failure-detector events type.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum FdEvent {
    /// Time to broadcast a heartbeat round.
    SendTicked,

    /// A watched peer is suspected crashed.
    Suspect { node: NodeId },
}

/// The failure detector module.
pub(crate) struct FailureDetector {
    /// My node ID.
    me: NodeId,

    /// Timers for hearing heartbeats from each peer.
    hear_timers: HashMap<NodeId, Timer>,

    /// Receiver side of the hear-timeout channel.
    rx_timeout: mpsc::UnboundedReceiver<NodeId>,

    /// Minimum hearing timeout interval.
    hear_timeout_min: Duration,

    /// Maximum hearing timeout interval.
    hear_timeout_max: Duration,

    /// Interval for sending heartbeats to peers.
    send_interval: Interval,

    /// Heartbeat reply counters for approximate detection of peer health.
    /// Tuple of (#hb_replied, #hb_replied seen at last send, repetition).
    reply_cnts: HashMap<NodeId, (u64, u64, u8)>,

    /// Speculated liveness of peers.
    peer_alive: Bitmap,

    /// Crash subscription reference counts per peer.
    watches: HashMap<NodeId, u32>,

    /// Suspicion events awaiting delivery.
    pending_suspects: VecDeque<NodeId>,
}

impl FailureDetector {
    /// Creates a new failure detector module.
    pub(crate) fn new_and_setup(
        me: NodeId,
        population: u8,
        hear_timeout_min: Duration,
        hear_timeout_max: Duration,
        send_interval: Duration,
    ) -> Result<FailureDetector, RingStoreError> {
        if hear_timeout_min < Duration::from_millis(100) {
            return logged_err!(
                "invalid hear_timeout_min {:?}",
                hear_timeout_min
            );
        }
        if hear_timeout_max < hear_timeout_min {
            return logged_err!(
                "hear_timeout_max {:?} smaller than min {:?}",
                hear_timeout_max,
                hear_timeout_min
            );
        }
        if send_interval < Duration::from_millis(1)
            || send_interval > hear_timeout_min
        {
            return logged_err!("invalid send_interval {:?}", send_interval);
        }

        let mut send_interval = time::interval(send_interval);
        send_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (tx_timeout, rx_timeout) = mpsc::unbounded_channel();

        let hear_timers = (0..population)
            .filter(|&p| p != me)
            .map(|p| {
                let tx_timeout_ref = tx_timeout.clone();
                (
                    p,
                    Timer::new(Some(Box::new(move || {
                        tx_timeout_ref.send(p).expect(
                            "sending to tx_timeout_ref should succeed",
                        )
                    }))),
                )
            })
            .collect();
        let reply_cnts = (0..population)
            .filter(|&p| p != me)
            .map(|p| (p, (1, 0, 0)))
            .collect();

        Ok(FailureDetector {
            me,
            hear_timers,
            rx_timeout,
            hear_timeout_min,
            hear_timeout_max,
            send_interval,
            reply_cnts,
            peer_alive: Bitmap::new(population, true),
            watches: HashMap::new(),
            pending_suspects: VecDeque::new(),
        })
    }

    /// Subscribes a watcher to crash events of a peer, returning the peer's
    /// currently speculated liveness. Only the 0 -> 1 transition changes
    /// detector behavior; further subscriptions just bump the count.
    pub(crate) fn subscribe(&mut self, peer: NodeId) -> bool {
        *self.watches.entry(peer).or_insert(0) += 1;
        self.peer_alive.get(peer).unwrap_or(false)
    }

    /// Drops one subscription on a peer; the watch disappears only when the
    /// count returns to zero.
    pub(crate) fn unsubscribe(&mut self, peer: NodeId) {
        if let Some(cnt) = self.watches.get_mut(&peer) {
            *cnt -= 1;
            if *cnt == 0 {
                self.watches.remove(&peer);
            }
        }
    }

    /// True if some role currently watches this peer.
    pub(crate) fn is_watched(&self, peer: NodeId) -> bool {
        self.watches.contains_key(&peer)
    }

    /// Gets the speculated liveness status of peers.
    pub(crate) fn peer_alive(&self) -> &Bitmap {
        &self.peer_alive
    }

    /// Kicks off all hearing timers with randomized timeouts; called once
    /// after peers are connected.
    pub(crate) fn kickoff_hear_timers(&mut self) -> Result<(), RingStoreError> {
        for timer in self.hear_timers.values() {
            Self::kickoff_timer_inner(
                timer,
                self.hear_timeout_min,
                self.hear_timeout_max,
            )?;
        }
        Ok(())
    }

    fn kickoff_timer_inner(
        timer: &Timer,
        min: Duration,
        max: Duration,
    ) -> Result<(), RingStoreError> {
        timer.cancel()?;
        let timeout_ms =
            thread_rng().gen_range(min.as_millis()..=max.as_millis());
        timer.kickoff(Duration::from_millis(timeout_ms as u64))
    }

    /// Called upon hearing a heartbeat reply from a peer: bumps its heard
    /// counter, restarts its hearing timer, and revives it if speculated
    /// dead.
    pub(crate) fn heard(&mut self, peer: NodeId) -> Result<(), RingStoreError> {
        if peer == self.me {
            return Ok(());
        }
        if let Some(cnts) = self.reply_cnts.get_mut(&peer) {
            cnts.0 += 1;
        }
        if let Some(timer) = self.hear_timers.get(&peer) {
            Self::kickoff_timer_inner(
                timer,
                self.hear_timeout_min,
                self.hear_timeout_max,
            )?;
        }

        if !self.peer_alive.get(peer)? {
            self.peer_alive.set(peer, true)?;
            pf_info!("peer_alive updated: {:?}", self.peer_alive);
        }
        Ok(())
    }

    /// Speculates a peer dead, queueing a suspicion event if watched.
    fn mark_dead(&mut self, peer: NodeId) -> Result<(), RingStoreError> {
        if self.peer_alive.get(peer)? {
            self.peer_alive.set(peer, false)?;
            pf_info!("peer_alive updated: {:?}", self.peer_alive);
            if self.is_watched(peer) {
                self.pending_suspects.push_back(peer);
            }
        }
        Ok(())
    }

    /// Called upon each heartbeat broadcast: updates peers' reply counters
    /// and their repetitions seen, speculating deaths on too many silent
    /// rounds. This is a more conservative backup to the hearing timers.
    fn update_bcast_cnts(&mut self) -> Result<(), RingStoreError> {
        let repeat_threshold = (self.hear_timeout_min.as_millis()
            / self.send_interval.period().as_millis())
            as u8;
        let mut deaths = Vec::new();

        for (&peer, cnts) in self.reply_cnts.iter_mut() {
            if cnts.0 > cnts.1 {
                // replies have been coming in; peer probably alive
                cnts.1 = cnts.0;
                cnts.2 = 0;
            } else {
                cnts.2 += 1;
                if cnts.2 > repeat_threshold {
                    deaths.push(peer);
                    cnts.2 = 0;
                }
            }
        }

        for peer in deaths {
            self.mark_dead(peer)?;
        }
        Ok(())
    }

    /// Waits for the next failure-detector event.
    pub(crate) async fn get_event(
        &mut self,
    ) -> Result<FdEvent, RingStoreError> {
        loop {
            if let Some(node) = self.pending_suspects.pop_front() {
                return Ok(FdEvent::Suspect { node });
            }

            tokio::select! {
                // a hearing timeout
                peer = self.rx_timeout.recv() => {
                    let Some(peer) = peer else {
                        return logged_err!("all timeout senders closed");
                    };
                    match self.hear_timers.get(&peer) {
                        Some(timer) if timer.exploded() => {
                            self.mark_dead(peer)?;
                            // deliver a queued suspicion on next iteration
                        }
                        _ => {} // explosion already cancelled, ignore
                    }
                },

                // a sending tick
                _ = self.send_interval.tick() => {
                    self.update_bcast_cnts()?;
                    if self.pending_suspects.is_empty() {
                        return Ok(FdEvent::SendTicked);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    fn make_fd() -> FailureDetector {
        FailureDetector::new_and_setup(
            0,
            4,
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(50),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watch_refcounts() {
        let mut fd = make_fd();
        assert!(!fd.is_watched(2));

        assert!(fd.subscribe(2));
        assert!(fd.subscribe(2));
        assert!(fd.is_watched(2));

        fd.unsubscribe(2);
        assert!(fd.is_watched(2));
        fd.unsubscribe(2);
        assert!(!fd.is_watched(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn suspect_only_watched() -> Result<(), RingStoreError> {
        let mut fd = make_fd();
        fd.subscribe(1);

        // unwatched peer dying produces no event
        fd.mark_dead(3)?;
        assert!(fd.pending_suspects.is_empty());

        // watched peer dying produces exactly one event
        fd.mark_dead(1)?;
        fd.mark_dead(1)?;
        assert_eq!(fd.pending_suspects.len(), 1);
        assert_eq!(fd.get_event().await?, FdEvent::Suspect { node: 1 });

        // hearing from the peer revives it
        fd.heard(1)?;
        assert!(fd.peer_alive.get(1)?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_rounds_speculate_death() -> Result<(), RingStoreError> {
        let mut fd = make_fd();
        fd.subscribe(2);

        // 200ms / 50ms = 4 silent rounds tolerated
        for _ in 0..6 {
            fd.update_bcast_cnts()?;
        }
        assert!(!fd.peer_alive.get(2)?);
        assert_eq!(fd.pending_suspects.front(), Some(&2));
        Ok(())
    }
}
