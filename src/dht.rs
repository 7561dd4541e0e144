//! # Kademlia DHT
//!
//! Peer discovery over the XOR metric. Every connection gets a
//! [`KadDhtStream`] answering `FIND_PEERS` from the local routing table, and
//! every connected peer is offered to that table.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `find_nearest_peers(target)` | Iterative lookup of the peers closest to `target` |
//! | `find_peer(id)` | Lookup, then a direct stream to `id` |
//! | `bootstrap(endpoint)` | Connect to one known peer and look up ourselves |
//!
//! ## Actor Architecture
//!
//! - `KadDhtExtension`: public handle, shared by every connection
//! - `RoutingActor`: owns the [`RoutingTable`]; commands arrive over `mpsc`
//!   and are answered through `oneshot`
//!
//! ## Reaching peers
//!
//! A lookup reuses the stream it already has to a peer. Otherwise it asks the
//! hole punching extension for one, offering every other peer the lookup
//! knows about as a mediator, closest to the peer first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use crate::endpoint::Endpoint;
use crate::extension::ExtensionNode;
use crate::holepunch::{HolePunchError, TcpHolePunchingExtension};
use crate::messages::{deserialize_bounded, serialize, FindPeersRequest, FindPeersResponse};
use crate::peer_id::PeerId;
use crate::protocol::{ProtocolDescriptor, ProtocolVersion};
use crate::protocols::Dht;
use crate::routing::{Peer, RoutingTable, DEFAULT_K};
use crate::rpc::{RpcBase, RpcError};
use crate::stream::{attach, StreamError, StreamLinks, StreamNode, StreamRef};
use crate::transport::{TraitFilter, TransportManager};

// ============================================================================
// Protocol
// ============================================================================

pub const FIND_PEERS: u8 = 0;

pub const KAD_DHT_PROTOCOL: &str = "KadDHT";

pub fn kad_dht_protocol() -> ProtocolDescriptor {
    ProtocolDescriptor::new(KAD_DHT_PROTOCOL, ProtocolVersion::new(1, 0, 0))
}

/// Capacity of the routing actor's command queue.
const ROUTING_COMMAND_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket size, also the size of every lookup result.
    pub k: usize,
    /// Peers queried in parallel per lookup round.
    pub alpha: usize,
    pub max_iterations: usize,
    pub rpc_timeout: Duration,
    pub bootstrap_timeout: Duration,
    /// Mediators offered to the hole punching extension per peer.
    pub max_mediators: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: 3,
            max_iterations: 5,
            rpc_timeout: Duration::from_secs(5),
            bootstrap_timeout: Duration::from_secs(1),
            max_mediators: 10,
        }
    }
}

// ============================================================================
// Routing actor
// ============================================================================

enum Command {
    /// Inserts the peer, or refreshes the stored record if already known.
    PutPeer(Peer, oneshot::Sender<bool>),
    FindNearest(PeerId, oneshot::Sender<Vec<Peer>>),
    FindPeer(PeerId, oneshot::Sender<Option<Peer>>),
    Snapshot(oneshot::Sender<Vec<Peer>>),
}

#[derive(Clone)]
struct RoutingHandle {
    cmd_tx: mpsc::Sender<Command>,
}

struct RoutingActor {
    table: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
}

impl RoutingHandle {
    fn spawn(this_id: PeerId, k: usize, runtime: &Handle) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(ROUTING_COMMAND_CAPACITY);
        let actor = RoutingActor {
            table: RoutingTable::new(this_id, k),
            cmd_rx,
        };
        runtime.spawn(actor.run());
        Self { cmd_tx }
    }

    /// Round trip to the actor. A stopped actor answers with the default.
    async fn request<T: Default>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(command(tx)).await.is_err() {
            return T::default();
        }
        rx.await.unwrap_or_default()
    }

    async fn put_peer(&self, peer: Peer) -> bool {
        self.request(|reply| Command::PutPeer(peer, reply)).await
    }

    async fn find_nearest(&self, target: PeerId) -> Vec<Peer> {
        self.request(|reply| Command::FindNearest(target, reply)).await
    }

    async fn find_peer(&self, id: PeerId) -> Option<Peer> {
        self.request(|reply| Command::FindPeer(id, reply)).await
    }

    async fn snapshot(&self) -> Vec<Peer> {
        self.request(Command::Snapshot).await
    }
}

impl RoutingActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::PutPeer(peer, reply) => {
                    let id = peer.id;
                    let stored = self.table.put_peer(peer.clone()) || self.table.replace_peer(peer);
                    trace!(peer = %id.short(), stored, "routing table update");
                    let _ = reply.send(stored);
                }
                Command::FindNearest(target, reply) => {
                    let _ = reply.send(self.table.find_nearest_peers(&target));
                }
                Command::FindPeer(id, reply) => {
                    let _ = reply.send(self.table.find_peer(&id).cloned());
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.table.peers().cloned().collect());
                }
            }
        }
        trace!("routing actor stopped");
    }
}

// ============================================================================
// RPC
// ============================================================================

/// `FIND_PEERS` over one [`RpcBase`]. The server side answers from the
/// routing table.
pub struct KadDhtRpc {
    rpc: RpcBase,
}

impl KadDhtRpc {
    fn new(routing: RoutingHandle) -> Self {
        let rpc = RpcBase::new();
        rpc.on_request(FIND_PEERS, move |body| {
            let routing = routing.clone();
            async move {
                let request: FindPeersRequest = deserialize_bounded(&body)?;
                let peers = routing.find_nearest(request.target).await;
                trace!(target = %request.target.short(), count = peers.len(), "answering find_peers");
                Ok(serialize(&FindPeersResponse { peers })?)
            }
        });
        Self { rpc }
    }

    pub async fn find_peers(
        &self,
        via: &dyn StreamNode,
        target: PeerId,
        timeout: Duration,
    ) -> Result<Vec<Peer>, RpcError> {
        let body = serialize(&FindPeersRequest { target })?;
        let response = self.rpc.make_rpc(via, FIND_PEERS, body, timeout).await?;
        let response: FindPeersResponse = deserialize_bounded(&response)?;
        Ok(response.peers)
    }
}

pub struct KadDhtStream {
    links: StreamLinks,
    rpc: KadDhtRpc,
}

impl KadDhtStream {
    /// Asks the remote peer for the peers it knows closest to `target`.
    pub async fn find_peers(&self, target: PeerId, timeout: Duration) -> Result<Vec<Peer>, RpcError> {
        self.rpc.find_peers(self, target, timeout).await
    }
}

#[async_trait]
impl StreamNode for KadDhtStream {
    fn links(&self) -> &StreamLinks {
        &self.links
    }

    async fn receive(&self, message: Vec<u8>) -> Result<(), StreamError> {
        self.rpc
            .rpc
            .receive(self, message)
            .await
            .map_err(|e| StreamError::Protocol(e.to_string()))
    }
}

// ============================================================================
// Extension
// ============================================================================

#[derive(Clone)]
pub struct KadDhtExtension {
    inner: Arc<KadInner>,
}

struct KadInner {
    this_id: PeerId,
    config: DhtConfig,
    hole_punch: TcpHolePunchingExtension,
    routing: RoutingHandle,
    manager: RwLock<Weak<TransportManager>>,
    streams: RwLock<HashMap<PeerId, Weak<KadDhtStream>>>,
}

impl KadDhtExtension {
    /// Spawns the routing actor on the current runtime.
    pub fn new(this_id: PeerId, hole_punch: TcpHolePunchingExtension, config: DhtConfig) -> Self {
        Self::with_runtime(this_id, hole_punch, config, &Handle::current())
    }

    pub fn with_runtime(
        this_id: PeerId,
        hole_punch: TcpHolePunchingExtension,
        config: DhtConfig,
        runtime: &Handle,
    ) -> Self {
        let routing = RoutingHandle::spawn(this_id, config.k, runtime);
        Self {
            inner: Arc::new(KadInner {
                this_id,
                config,
                hole_punch,
                routing,
                manager: RwLock::new(Weak::new()),
                streams: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn this_id(&self) -> PeerId {
        self.inner.this_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// Every peer in the routing table.
    pub async fn known_peers(&self) -> Vec<Peer> {
        self.inner.routing.snapshot().await
    }

    /// Iterative lookup of the `k` peers closest to `target`, closest first.
    ///
    /// Unless `blind`, the lookup stops as soon as `target` itself is a
    /// candidate. A peer that cannot be reached or does not answer is
    /// skipped; the rest of its round still counts.
    pub async fn find_nearest_peers_with(
        &self,
        target: PeerId,
        max_iterations: usize,
        alpha: usize,
        blind: bool,
    ) -> Vec<Peer> {
        let inner = &self.inner;
        let this_id = inner.this_id;

        // Keyed by distance to the target, so iteration is closest first.
        let mut candidates: BTreeMap<PeerId, Peer> = BTreeMap::new();
        let mut asked: BTreeMap<PeerId, Peer> = BTreeMap::new();
        let mut asked_ids: HashSet<PeerId> = HashSet::new();

        for peer in inner.routing.find_nearest(target).await {
            candidates.entry(target.xor(&peer.id)).or_insert(peer);
        }

        for iteration in 0..max_iterations {
            if candidates.is_empty() {
                break;
            }
            if !blind && candidates.contains_key(&PeerId::zeroes()) {
                trace!(target = %target.short(), iteration, "target found");
                break;
            }

            let batch: Vec<Peer> = (0..alpha.max(1))
                .map_while(|_| candidates.pop_first().map(|(_, peer)| peer))
                .collect();
            for peer in &batch {
                asked_ids.insert(peer.id);
                asked.insert(target.xor(&peer.id), peer.clone());
            }
            let ids: Vec<PeerId> = batch.iter().map(|p| p.id).collect();
            let mediators: Vec<PeerId> = candidates.values().chain(asked.values()).map(|p| p.id).collect();

            let streams = inner.clone().streams_to(&ids, &mediators).await;

            let mut join_set = JoinSet::new();
            for (id, stream) in &streams {
                let (id, stream) = (*id, stream.clone());
                let timeout = inner.config.rpc_timeout;
                join_set.spawn(async move { (id, stream.find_peers(target, timeout).await) });
            }
            while let Some(joined) = join_set.join_next().await {
                let Ok((from, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(peers) => {
                        for peer in peers {
                            if peer.id == this_id || asked_ids.contains(&peer.id) {
                                continue;
                            }
                            candidates.entry(target.xor(&peer.id)).or_insert(peer);
                        }
                    }
                    Err(e) => debug!(peer = %from.short(), error = %e, "find_peers failed"),
                }
            }

            inner.release_unrouted(streams).await;
        }

        candidates.append(&mut asked);
        candidates.into_values().take(inner.config.k).collect()
    }

    /// Looks `id` up and opens a direct stream to it. `None` when the lookup
    /// does not turn it up or no connection can be made.
    pub async fn find_peer_with(&self, id: PeerId, max_iterations: usize) -> Option<Peer> {
        if id == self.inner.this_id {
            return None;
        }
        let nearest = self
            .find_nearest_peers_with(id, max_iterations, self.inner.config.alpha, false)
            .await;
        if !nearest.iter().any(|p| p.id == id) {
            debug!(peer = %id.short(), "peer not found");
            return None;
        }

        let mediators: Vec<PeerId> = nearest.iter().map(|p| p.id).filter(|m| *m != id).collect();
        let (_, stream) = self.inner.clone().streams_to(&[id], &mediators).await.pop()?;
        let endpoint = stream.remote_endpoint().ok()?;
        let stream: StreamRef = stream;
        debug!(peer = %id.short(), %endpoint, "peer found");
        Some(Peer::with_stream(id, endpoint, &stream))
    }

    /// Connects to `endpoint` through a reliable transport, then looks up
    /// our own id to fill the routing table.
    pub async fn bootstrap_with_timeout(&self, endpoint: &Endpoint, timeout: Duration) -> anyhow::Result<()> {
        let manager = self
            .inner
            .manager()
            .context("kad dht extension is not attached to a transport manager")?;
        let filter = TraitFilter::reliable() & TraitFilter::supports(endpoint.clone());
        let Some(transport) = manager.transports_matching(&filter).into_iter().next() else {
            bail!("no reliable transport supports {endpoint}");
        };

        tokio::time::timeout(timeout, transport.connect(endpoint))
            .await
            .with_context(|| format!("bootstrap connection to {endpoint} timed out"))?
            .with_context(|| format!("bootstrap connection to {endpoint} failed"))?;

        let config = &self.inner.config;
        let found = self
            .find_nearest_peers_with(self.inner.this_id, config.max_iterations, config.alpha, true)
            .await;
        info!(%endpoint, peers = found.len(), "bootstrapped");
        Ok(())
    }
}

impl KadInner {
    fn manager(&self) -> Option<Arc<TransportManager>> {
        self.manager.read().unwrap_or_else(PoisonError::into_inner).upgrade()
    }

    fn stream_for(&self, peer: &PeerId) -> Option<Arc<KadDhtStream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .and_then(Weak::upgrade)
    }

    fn register(&self, peer: PeerId, stream: &Arc<KadDhtStream>) {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        streams.retain(|_, s| s.strong_count() > 0);
        streams.insert(peer, Arc::downgrade(stream));
    }

    /// Streams to each of `peers`, opened concurrently. Peers that cannot be
    /// reached are left out.
    async fn streams_to(
        self: Arc<Self>,
        peers: &[PeerId],
        mediators: &[PeerId],
    ) -> Vec<(PeerId, Arc<KadDhtStream>)> {
        let mut join_set = JoinSet::new();
        for &peer in peers {
            let mut mediators: Vec<PeerId> = mediators.iter().copied().filter(|m| *m != peer).collect();
            mediators.sort_by(|a, b| peer.xor_cmp(a, b));
            mediators.truncate(self.config.max_mediators);

            let inner = self.clone();
            join_set.spawn(async move { inner.stream_to(peer, &mediators).await.map(|s| (peer, s)) });
        }

        let mut streams = Vec::with_capacity(peers.len());
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Some(entry)) = joined {
                streams.push(entry);
            }
        }
        streams
    }

    async fn stream_to(&self, peer: PeerId, mediators: &[PeerId]) -> Option<Arc<KadDhtStream>> {
        if let Some(stream) = self.stream_for(&peer)
            && stream.opened()
        {
            return Some(stream);
        }
        match self.hole_punch.connect_to(peer, mediators).await {
            Ok(_) | Err(HolePunchError::AlreadyConnected(_)) => self.stream_for(&peer),
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "peer unreachable");
                None
            }
        }
    }

    /// Closes the streams of peers the routing table did not keep.
    async fn release_unrouted(&self, streams: Vec<(PeerId, Arc<KadDhtStream>)>) {
        for (peer, stream) in streams {
            if self.routing.find_peer(peer).await.is_some() {
                continue;
            }
            trace!(peer = %peer.short(), "closing stream outside the routing table");
            if let Err(e) = stream.close().await {
                debug!(peer = %peer.short(), error = %e, "closing unrouted stream failed");
            }
        }
    }
}

#[async_trait]
impl ExtensionNode for KadDhtExtension {
    async fn init(&self, manager: &Arc<TransportManager>) -> anyhow::Result<()> {
        *self.inner.manager.write().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(manager);
        Ok(())
    }

    async fn extend_stream(&self, node: &StreamRef) -> Result<(), StreamError> {
        let stream = Arc::new(KadDhtStream {
            links: StreamLinks::leaf(),
            rpc: KadDhtRpc::new(self.inner.routing.clone()),
        });
        attach(node, stream.clone())?;

        let remote_id = stream.remote_peer_id()?;
        let remote_endpoint = stream.remote_endpoint()?;
        self.inner.register(remote_id, &stream);

        let stream_ref: StreamRef = stream;
        let stored = self
            .inner
            .routing
            .put_peer(Peer::with_stream(remote_id, remote_endpoint, &stream_ref))
            .await;
        debug!(peer = %remote_id.short(), stored, "kad stream attached");
        Ok(())
    }
}

#[async_trait]
impl Dht for KadDhtExtension {
    async fn bootstrap(&self, endpoint: &Endpoint) -> anyhow::Result<()> {
        self.bootstrap_with_timeout(endpoint, self.inner.config.bootstrap_timeout)
            .await
    }

    async fn find_peer(&self, id: &PeerId) -> Option<Peer> {
        self.find_peer_with(*id, self.inner.config.max_iterations).await
    }

    async fn find_nearest_peers(&self, target: &PeerId) -> Vec<Peer> {
        let config = &self.inner.config;
        self.find_nearest_peers_with(*target, config.max_iterations, config.alpha, false)
            .await
    }
}
