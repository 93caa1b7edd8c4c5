//! CommitNode -- standby manager membership maintenance.
//!
//! The leader periodically re-resolves its replica ring positions with an
//! unreliable lookup; descriptors whose responder stays silent for too
//! long fall back to unknown. Below the configured threshold of known
//! managers the node is in initialization mode: it refuses to lead new
//! commits and forwards them along the ring instead.

use super::*;

use crate::node::NodeId;
use crate::ring::RingKey;
use crate::utils::RingStoreError;

use tokio::time::{Duration, Instant};

impl CommitNode {
    /// True if enough managers (self included) are currently known to
    /// lead new commits.
    pub(crate) fn mgr_ready(&self) -> bool {
        let mut known: Vec<NodeId> = vec![self.id];
        for desc in &self.rtms {
            if let Some(node) = desc.node {
                if !known.contains(&node) {
                    known.push(node);
                }
            }
        }
        known.len() as u8 >= self.config.rtm_min_known
    }

    /// One round of standby manager rediscovery: expire descriptors that
    /// stopped answering, then look up each manager ring key.
    pub(crate) fn refresh_rtms(&mut self) -> Result<(), RingStoreError> {
        let now = Instant::now();
        let stale_after = Duration::from_millis(
            3 * self.config.tx_rtm_update_interval_ms,
        );

        let mut lookups = Vec::with_capacity(self.rtms.len());
        for desc in &mut self.rtms {
            if let Some(at) = desc.last_reply {
                if now.duration_since(at) >= stale_after
                    && desc.node.is_some()
                {
                    pf_warn!("standby manager {} expired", desc.index);
                    desc.node = None;
                }
            }
            lookups.push((desc.index, desc.ring_key));
        }

        for (index, ring_key) in lookups {
            let target = self.ring.route(ring_key);
            if target == self.id {
                // a small ring folds some manager keys onto myself
                self.note_rtm_reply(self.id, index, ring_key);
            } else {
                self.transport
                    .send_msg(PeerMsg::GetRtm { index, ring_key }, target)?;
            }
        }
        Ok(())
    }

    /// Handler of a manager lookup: answer iff I am responsible for the
    /// ring key; a stale view stays silent and the asker retries.
    pub(crate) fn handle_get_rtm(
        &mut self,
        peer: NodeId,
        index: u8,
        ring_key: RingKey,
    ) -> Result<(), RingStoreError> {
        if self.ring.route(ring_key) == self.id {
            self.route_send(PeerMsg::GetRtmReply { index, ring_key }, peer)
        } else {
            Ok(())
        }
    }

    /// Handler of a manager lookup reply.
    pub(crate) fn handle_get_rtm_reply(
        &mut self,
        peer: NodeId,
        index: u8,
        ring_key: RingKey,
    ) -> Result<(), RingStoreError> {
        self.note_rtm_reply(peer, index, ring_key);
        Ok(())
    }

    fn note_rtm_reply(&mut self, node: NodeId, index: u8, ring_key: RingKey) {
        if let Some(desc) = self
            .rtms
            .iter_mut()
            .find(|desc| desc.index == index && desc.ring_key == ring_key)
        {
            if desc.node != Some(node) {
                pf_info!("standby manager {} resolved to node {}",
                         index, node);
            }
            desc.node = Some(node);
            desc.last_reply = Some(Instant::now());
        }
    }
}
