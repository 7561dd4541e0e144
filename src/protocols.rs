//! Protocol trait definitions.
//!
//! Kept apart from the implementations so that application code can depend
//! on the operations only, and so that alternative overlays can be swapped
//! in behind the [`Node`](crate::Node) facade.
//!
//! | Protocol | Trait | Implementation |
//! |----------|-------|----------------|
//! | DHT | [`Dht`] | [`KadDhtExtension`](crate::KadDhtExtension) |

use async_trait::async_trait;

use crate::endpoint::Endpoint;
use crate::peer_id::PeerId;
use crate::routing::Peer;

/// Peer discovery over a distributed hash table.
#[async_trait]
pub trait Dht: Send + Sync + 'static {
    /// Joins the overlay through the peer listening on `endpoint`.
    async fn bootstrap(&self, endpoint: &Endpoint) -> anyhow::Result<()>;

    /// Locates `id` and connects to it.
    async fn find_peer(&self, id: &PeerId) -> Option<Peer>;

    /// The peers closest to `target` the overlay knows of, closest first.
    async fn find_nearest_peers(&self, target: &PeerId) -> Vec<Peer>;
}
