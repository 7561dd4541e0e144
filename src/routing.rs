//! # Routing Table
//!
//! Kademlia k-buckets indexed by the common prefix length between a peer's id
//! and ours.
//!
//! ## Structure
//!
//! ```text
//! bucket i < last : peers with lcp(peer, self) == i
//! bucket last     : peers with lcp(peer, self) >= last (not split yet)
//! ```
//!
//! The table starts with a single bucket. Only the last bucket may split,
//! and only when it is full and an insertion lands in it. Splitting keeps
//! the peers with `lcp == last` and moves the rest to a new last bucket.
//! Full buckets elsewhere reject new peers.
//!
//! ## Lookup
//!
//! [`RoutingTable::find_nearest_peers`] pre-selects whole buckets in order of
//! their distance class to the target, then sorts the selection by true XOR
//! distance. The result equals a brute-force sort of the table.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::peer_id::{PeerId, PEER_ID_BITS};
use crate::stream::{StreamNode, StreamRef};

/// Default bucket capacity (Kademlia `k`).
pub const DEFAULT_K: usize = 20;

// ============================================================================
// Peer
// ============================================================================

/// A known peer. The stream is a non-owning link to a live connection and
/// is never serialized.
#[derive(Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub endpoint: Endpoint,
    #[serde(skip)]
    stream: Option<Weak<dyn StreamNode>>,
}

impl Peer {
    pub fn new(id: PeerId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            stream: None,
        }
    }

    pub fn with_stream(id: PeerId, endpoint: Endpoint, stream: &StreamRef) -> Self {
        Self {
            id,
            endpoint,
            stream: Some(Arc::downgrade(stream)),
        }
    }

    /// The associated stream, if its connection is still alive.
    pub fn live_stream(&self) -> Option<StreamRef> {
        self.stream.as_ref().and_then(Weak::upgrade)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.endpoint == other.endpoint
    }
}

impl Eq for Peer {}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("connected", &self.live_stream().is_some())
            .finish()
    }
}

// ============================================================================
// RoutingTable
// ============================================================================

#[derive(Debug)]
pub struct RoutingTable {
    this_id: PeerId,
    k: usize,
    buckets: Vec<Vec<Peer>>,
}

impl RoutingTable {
    pub fn new(this_id: PeerId, k: usize) -> Self {
        Self {
            this_id,
            k: k.max(1),
            buckets: vec![Vec::new()],
        }
    }

    pub fn this_id(&self) -> PeerId {
        self.this_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, index: usize) -> Option<&[Peer]> {
        self.buckets.get(index).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.buckets.iter().flatten()
    }

    fn bucket_index(&self, id: &PeerId) -> usize {
        self.this_id.lcp(id).min(self.buckets.len() - 1)
    }

    /// The bucket `id` belongs in.
    pub fn find_bucket(&self, id: &PeerId) -> &[Peer] {
        &self.buckets[self.bucket_index(id)]
    }

    pub fn find_peer(&self, id: &PeerId) -> Option<&Peer> {
        self.find_bucket(id).iter().find(|p| p.id == *id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.find_peer(id).is_some()
    }

    /// Inserts `peer`. Returns false if it is already known, is ourselves,
    /// or its bucket is full and cannot split.
    pub fn put_peer(&mut self, peer: Peer) -> bool {
        if peer.id == self.this_id || self.contains(&peer.id) {
            return false;
        }
        loop {
            let index = self.bucket_index(&peer.id);
            if self.buckets[index].len() < self.k {
                self.buckets[index].push(peer);
                return true;
            }
            let last = self.buckets.len() - 1;
            if index != last || self.buckets.len() >= PEER_ID_BITS {
                return false;
            }
            self.split_last();
        }
    }

    /// Swaps the stored record for `peer.id` with `peer`. Returns false when
    /// the id is unknown.
    pub fn replace_peer(&mut self, peer: Peer) -> bool {
        let index = self.bucket_index(&peer.id);
        match self.buckets[index].iter_mut().find(|p| p.id == peer.id) {
            Some(slot) => {
                *slot = peer;
                true
            }
            None => false,
        }
    }

    fn split_last(&mut self) {
        let last = self.buckets.len() - 1;
        let this_id = self.this_id;
        let (stay, moved): (Vec<Peer>, Vec<Peer>) = std::mem::take(&mut self.buckets[last])
            .into_iter()
            .partition(|p| this_id.lcp(&p.id) == last);
        self.buckets[last] = stay;
        self.buckets.push(moved);
    }

    /// Up to `k` known peers closest to `target`, closest first.
    pub fn find_nearest_peers(&self, target: &PeerId) -> Vec<Peer> {
        let start = self.bucket_index(target);

        // bucket `start` shares the most bits with the target; every bucket
        // above it sits at exactly lcp == start from the target
        let mut selected: Vec<Peer> = self.buckets[start..].iter().flatten().cloned().collect();
        for bucket in self.buckets[..start].iter().rev() {
            if selected.len() >= self.k {
                break;
            }
            selected.extend(bucket.iter().cloned());
        }

        selected.sort_by(|a, b| target.xor_cmp(&a.id, &b.id));
        selected.truncate(self.k);
        selected
    }
}
