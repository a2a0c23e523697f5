//! Simplified Kademlia routing table

use std::collections::BTreeMap;

use crate::common::{Id, Peer};

/// K = the maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone)]
/// Kademlia routing table: k-buckets keyed by the position of the highest
/// order bit in which a peer's id differs from the local id.
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    // === Public Methods ===

    /// Attempts to add a peer to this routing table, and returns `true` if it
    /// did.
    ///
    /// A peer that is already present is moved to the tail of its bucket (most
    /// recently seen) and its endpoint is refreshed. A new peer whose bucket
    /// is full is dropped silently.
    pub fn push(&mut self, peer: Peer) -> bool {
        let Some(index) = self.id.highest_differing_bit(peer.id()) else {
            // Do not add self to the routing table.
            return false;
        };

        self.buckets.entry(index as u8).or_default().push(peer)
    }

    /// Returns up to [MAX_BUCKET_SIZE_K] known peers in ascending XOR distance
    /// to the target.
    pub fn closest(&self, target: &Id) -> Vec<Peer> {
        let mut peers = self
            .buckets
            .values()
            .flat_map(|bucket| bucket.peers.iter().copied())
            .collect::<Vec<_>>();

        peers.sort_by_key(|peer| peer.id().xor(target));
        peers.truncate(MAX_BUCKET_SIZE_K);

        peers
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.peers.is_empty())
    }

    /// Return the number of peers in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.peers.len())
    }

    // === Private Methods ===

    #[cfg(test)]
    fn contains(&self, id: &Id) -> bool {
        self.buckets
            .values()
            .any(|bucket| bucket.peers.iter().any(|peer| peer.id() == id))
    }
}

/// An insertion-ordered set of at most [MAX_BUCKET_SIZE_K] peers, ordered from
/// least to most recently seen.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    peers: Vec<Peer>,
}

impl KBucket {
    fn push(&mut self, incoming: Peer) -> bool {
        if let Some(index) = self.peers.iter().position(|p| p.id() == incoming.id()) {
            // Re-adding a known peer refreshes its position (and endpoint,
            // which may legitimately have changed).
            self.peers.remove(index);
            self.peers.push(incoming);

            true
        } else if self.peers.len() < MAX_BUCKET_SIZE_K {
            self.peers.push(incoming);

            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::common::ID_SIZE;

    /// Peers that all land in bucket 0 of a table whose local id is zero.
    fn bucket_zero_peer(seed: u8) -> Peer {
        let mut bytes = [0; ID_SIZE];
        bytes[0] = 0x80;
        bytes[ID_SIZE - 1] = seed;

        Peer::new(
            Id(bytes),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, seed as u16 + 1),
        )
    }

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());

        table.push(Peer::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(Id::random());
        let peer = Peer::new(*table.id(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));

        assert!(!table.push(peer));
        assert!(table.is_empty());
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());

        let peer = Peer::random();
        table.push(peer);
        table.push(peer);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_more_than_k_per_bucket() {
        let mut table = RoutingTable::new(Id([0; ID_SIZE]));

        for seed in 0..MAX_BUCKET_SIZE_K {
            assert!(table.push(bucket_zero_peer(seed as u8)));
        }

        let overflow = bucket_zero_peer(MAX_BUCKET_SIZE_K as u8);
        assert!(!table.push(overflow));
        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);
        assert!(!table.contains(overflow.id()));
    }

    #[test]
    fn readding_a_known_peer_moves_it_to_the_tail() {
        let mut table = RoutingTable::new(Id([0; ID_SIZE]));

        let first = bucket_zero_peer(1);
        table.push(first);
        table.push(bucket_zero_peer(2));

        // Same peer on a new port.
        let moved = Peer::new(*first.id(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9));
        table.push(moved);

        let bucket = table.buckets.get(&0).unwrap();
        assert_eq!(bucket.peers.len(), 2);
        assert_eq!(bucket.peers.last().unwrap(), &moved);
    }

    #[test]
    fn closest_is_sorted_by_xor_distance_and_capped() {
        let target = Id::random();
        let mut table = RoutingTable::new(Id::random());

        for _ in 0..100 {
            table.push(Peer::random());
        }

        let closest = table.closest(&target);
        assert_eq!(closest.len(), MAX_BUCKET_SIZE_K);

        let distances = closest
            .iter()
            .map(|peer| peer.id().xor(&target))
            .collect::<Vec<_>>();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);

        // No peer left out of the result is closer than the ones in it.
        let cutoff = *distances.last().unwrap();
        for bucket in table.buckets.values() {
            for peer in &bucket.peers {
                if !closest.contains(peer) {
                    assert!(peer.id().xor(&target) >= cutoff);
                }
            }
        }
    }
}
