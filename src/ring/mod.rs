//! Ring key space and static overlay view.
//!
//! The overlay routing layer proper is an external collaborator; the commit
//! core only consumes this interface: a hash ring of `u64` positions over a
//! fixed population of nodes, successor routing, and symmetric replication
//! (replica keys of a key are R equidistant positions around the ring).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::node::NodeId;

/// Position on the hash ring.
pub type RingKey = u64;

/// Static view of the ring: node `i` sits at position `i * (2^64 / N)` and
/// owns the keys in `(position(i-1), position(i)]` going clockwise.
#[derive(Debug, Clone)]
pub struct RingView {
    /// Total number of nodes on the ring.
    population: u8,

    /// Replication factor R.
    replication: u8,
}

impl RingView {
    /// Creates a new static ring view.
    pub fn new(population: u8, replication: u8) -> Self {
        if population == 0 || replication == 0 {
            panic!(
                "invalid ring parameters: population {} replication {}",
                population, replication
            );
        }
        RingView {
            population,
            replication,
        }
    }

    /// Hashes a client-visible key string to its ring position.
    pub fn key_of(&self, key: &str) -> RingKey {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Ring position of a node.
    pub fn node_position(&self, id: NodeId) -> RingKey {
        debug_assert!(id < self.population);
        (((id as u128) << 64) / self.population as u128) as RingKey
    }

    /// Successor routing: the node responsible for a ring position.
    pub fn route(&self, key: RingKey) -> NodeId {
        // owner is the first node position >= key, wrapping at 2^64
        let scaled = (key as u128) * (self.population as u128);
        let mut idx = (scaled >> 64) as u8;
        if scaled & ((1u128 << 64) - 1) != 0 {
            idx += 1;
        }
        idx % self.population
    }

    /// Symmetric replication: the R replica positions of a ring key, the
    /// first being the key's own position.
    pub fn replica_keys(&self, key: RingKey) -> Vec<RingKey> {
        (0..self.replication)
            .map(|i| {
                let offset =
                    (((i as u128) << 64) / self.replication as u128) as u64;
                key.wrapping_add(offset)
            })
            .collect()
    }

    /// The manager ring keys of a node: the replica positions of its own
    /// position. Index 0 is the node itself; the others host its standby
    /// transaction managers.
    pub fn manager_keys(&self, id: NodeId) -> Vec<RingKey> {
        self.replica_keys(self.node_position(id))
    }

    /// Total number of nodes.
    #[inline]
    pub fn population(&self) -> u8 {
        self.population
    }

    /// Replication factor.
    #[inline]
    pub fn replication(&self) -> u8 {
        self.replication
    }
}

#[cfg(test)]
mod ring_tests {
    use super::*;

    #[test]
    fn key_of_deterministic() {
        let ring = RingView::new(4, 4);
        assert_eq!(ring.key_of("hello"), ring.key_of("hello"));
        assert_ne!(ring.key_of("hello"), ring.key_of("world"));
    }

    #[test]
    fn route_own_position() {
        let ring = RingView::new(4, 4);
        for id in 0..4 {
            assert_eq!(ring.route(ring.node_position(id)), id);
        }
    }

    #[test]
    fn route_successor() {
        let ring = RingView::new(4, 4);
        // one past node 0's position belongs to node 1
        assert_eq!(ring.route(ring.node_position(0) + 1), 1);
        // one past the last node's position wraps to node 0
        assert_eq!(ring.route(ring.node_position(3) + 1), 0);
        assert_eq!(ring.route(0), 0);
    }

    #[test]
    fn replica_keys_spread() {
        let ring = RingView::new(4, 4);
        let key = ring.key_of("somekey");
        let replicas = ring.replica_keys(key);
        assert_eq!(replicas.len(), 4);
        assert_eq!(replicas[0], key);

        // with population == replication, the replica keys of any key land
        // on 4 distinct nodes
        let mut owners: Vec<NodeId> =
            replicas.iter().map(|&rk| ring.route(rk)).collect();
        owners.sort();
        owners.dedup();
        assert_eq!(owners.len(), 4);
    }

    #[test]
    fn manager_keys_start_at_self() {
        let ring = RingView::new(4, 4);
        for id in 0..4 {
            let mks = ring.manager_keys(id);
            assert_eq!(mks.len(), 4);
            assert_eq!(ring.route(mks[0]), id);
        }
    }
}
