//! # High-Level Node API
//!
//! A [`Node`] wires the whole stack for one peer and is the entry point for
//! applications.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::start(NodeConfig::default()).await?;
//! node.bootstrap(&"127.0.0.1:4000".parse()?).await?;
//!
//! if let Some(peer) = node.find_peer(&target).await {
//!     println!("connected to {} at {}", peer.id, peer.endpoint);
//! }
//! ```
//!
//! ## Stack
//!
//! ```text
//! TcpStream (root, one per connection)
//! └── ProtocolRouterStream
//!     ├── "TCPHole" 1.0.0 → TcpHolePunchingStream
//!     └── "KadDHT"  1.0.0 → KadDhtStream
//! ```
//!
//! The extension chain is installed before the listener starts, so the very
//! first inbound connection is already fully extended.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::dht::{kad_dht_protocol, DhtConfig, KadDhtExtension};
use crate::endpoint::Endpoint;
use crate::holepunch::{hole_punch_protocol, HolePunchConfig, HolePunchError, TcpHolePunchingExtension};
use crate::peer_id::PeerId;
use crate::protocol::ProtocolRouterExtension;
use crate::protocols::Dht;
use crate::routing::Peer;
use crate::stream::StreamRef;
use crate::tcp::Tcp;
use crate::transport::{ConnectionError, TransportManager};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_ip: IpAddr,
    /// 0 picks a free port.
    pub listen_port: u16,
    /// Random when unset.
    pub peer_id: Option<PeerId>,
    pub dht: DhtConfig,
    pub hole_punch: HolePunchConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            peer_id: None,
            dht: DhtConfig::default(),
            hole_punch: HolePunchConfig::default(),
        }
    }
}

pub struct Node {
    peer_id: PeerId,
    manager: Arc<TransportManager>,
    tcp: Tcp,
    hole_punch: TcpHolePunchingExtension,
    dht: KadDhtExtension,
}

impl Node {
    /// Builds the stack and starts listening. Failing to bind the listener
    /// is fatal.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let peer_id = config.peer_id.unwrap_or_else(PeerId::random);
        let manager = TransportManager::new(peer_id);

        let tcp = Tcp::new(SocketAddr::new(config.listen_ip, config.listen_port));
        let hole_punch = TcpHolePunchingExtension::new(tcp.clone(), config.hole_punch);
        let dht = KadDhtExtension::with_runtime(peer_id, hole_punch.clone(), config.dht, manager.runtime());

        let router = ProtocolRouterExtension::new()
            .with_protocol(hole_punch_protocol(), Arc::new(hole_punch.clone()))?
            .with_protocol(kad_dht_protocol(), Arc::new(dht.clone()))?;
        manager
            .set_extension(Arc::new(router))
            .await
            .context("initialize extensions")?;
        manager
            .register_transport(Arc::new(tcp.clone()))
            .await
            .context("start tcp transport")?;

        info!(
            peer = %peer_id.short(),
            endpoint = ?tcp.listener_endpoint(),
            "node started"
        );
        Ok(Self {
            peer_id,
            manager,
            tcp,
            hole_punch,
            dht,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listener_endpoint(&self) -> Option<Endpoint> {
        self.tcp.listener_endpoint()
    }

    pub fn transport_manager(&self) -> &Arc<TransportManager> {
        &self.manager
    }

    pub fn dht(&self) -> &KadDhtExtension {
        &self.dht
    }

    /// Direct connection to `endpoint`, through whichever transport supports it.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<StreamRef, ConnectionError> {
        self.manager.connect(endpoint).await
    }

    pub async fn bootstrap(&self, endpoint: &Endpoint) -> Result<()> {
        self.dht.bootstrap(endpoint).await
    }

    pub async fn find_peer(&self, id: &PeerId) -> Option<Peer> {
        self.dht.find_peer(id).await
    }

    pub async fn find_nearest_peers(&self, target: &PeerId) -> Vec<Peer> {
        self.dht.find_nearest_peers(target).await
    }

    pub async fn known_peers(&self) -> Vec<Peer> {
        self.dht.known_peers().await
    }

    /// Hole punches to `peer` through the first of `mediators` that can
    /// introduce us.
    pub async fn connect_via(&self, peer: PeerId, mediators: &[PeerId]) -> Result<StreamRef, HolePunchError> {
        self.hole_punch.connect_to(peer, mediators).await
    }

    /// Whether a handshaken connection to `peer` is up.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.hole_punch.is_connected(peer)
    }

    /// Stops accepting connections. Established ones end with their sockets.
    pub fn shutdown(&self) {
        self.tcp.close();
        info!(peer = %self.peer_id.short(), "node stopped listening");
    }
}
