//! # TCP Hole Punching
//!
//! Connects two peers that cannot dial each other directly by rendezvous
//! through a mediator that already has a stream to both.
//!
//! ## Round
//!
//! ```text
//! initiator                      mediator                       target
//!   | FIRST_STEP(target, ep_i) ---> |                               |
//!   |                               | SECOND_STEP(initiator, ep_i') ->|
//!   |                               |<------- (punch_t, listener_t)  |
//!   |<---- (punch_t', listener_t')  |            target dials ep_i' |
//!   | dials punch_t' and listener_t', first success wins             |
//! ```
//!
//! `'` marks an endpoint whose address was replaced by the one the mediator
//! observes on its own connection. Self-reported addresses behind a NAT are
//! not usable.
//!
//! Both sides dialing at once is the punch: each side's outbound attempt
//! opens its own NAT for the other's packets. The initiator also listens on
//! its punch port, so the target's dial back lands even when the target's
//! own listener cannot be reached.
//!
//! ## Failure
//!
//! Every dial is retried a fixed number of times. A round that produces no
//! connection moves on to the next mediator; when none is left the caller
//! gets [`HolePunchError::ConnectionFailed`]. Connecting to an already
//! opened peer is [`HolePunchError::AlreadyConnected`], which is not retried.
//!
//! ## Stream state
//!
//! The stream of this extension is closed until a `HANDSHAKE` RPC succeeds
//! and closed again after `CLOSURE`. Streams are indexed per remote peer
//! without ownership: the connection task owns them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use crate::endpoint::Endpoint;
use crate::extension::ExtensionNode;
use crate::messages::{
    deserialize_bounded, serialize, FirstStepRequest, FirstStepResponse, SecondStepRequest,
    SecondStepResponse,
};
use crate::peer_id::PeerId;
use crate::protocol::{ProtocolDescriptor, ProtocolVersion};
use crate::rpc::{RpcBase, RpcError};
use crate::stream::{attach, root_of, StreamError, StreamLinks, StreamNode, StreamRef};
use crate::tcp::{tcp_descriptor, Tcp};

// ============================================================================
// Protocol
// ============================================================================

pub const CONNECTION_FIRST_STEP: u8 = 0;
pub const CONNECTION_SECOND_STEP: u8 = 1;
pub const HANDSHAKE: u8 = 2;
pub const CLOSURE: u8 = 3;

pub const HOLE_PUNCH_PROTOCOL: &str = "TCPHole";

pub fn hole_punch_protocol() -> ProtocolDescriptor {
    ProtocolDescriptor::new(HOLE_PUNCH_PROTOCOL, ProtocolVersion::new(1, 0, 0))
}

#[derive(Debug, Clone)]
pub struct HolePunchConfig {
    /// Dials per candidate endpoint.
    pub connection_attempts: usize,
    /// Pause before each dial.
    pub attempt_delay: Duration,
    /// Bound for one dial including the identity exchange.
    pub attempt_timeout: Duration,
    pub rpc_timeout: Duration,
    pub max_mediators: usize,
    pub handshake_timeout: Duration,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            connection_attempts: 20,
            attempt_delay: Duration::from_millis(10),
            attempt_timeout: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(1),
            max_mediators: 10,
            handshake_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HolePunchError {
    #[error("already connected to {0:?}")]
    AlreadyConnected(PeerId),
    #[error("could not reach {peer:?} through any mediator")]
    ConnectionFailed { peer: PeerId },
}

// ============================================================================
// Extension
// ============================================================================

#[derive(Clone)]
pub struct TcpHolePunchingExtension {
    inner: Arc<HolePunchInner>,
}

struct HolePunchInner {
    tcp: Tcp,
    config: HolePunchConfig,
    streams: RwLock<HashMap<PeerId, Weak<TcpHolePunchingStream>>>,
}

impl TcpHolePunchingExtension {
    pub fn new(tcp: Tcp, config: HolePunchConfig) -> Self {
        Self {
            inner: Arc::new(HolePunchInner {
                tcp,
                config,
                streams: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &HolePunchConfig {
        &self.inner.config
    }

    /// Live stream to `peer`, if any.
    pub fn stream_to(&self, peer: &PeerId) -> Option<StreamRef> {
        self.inner.stream_for(peer).map(|s| s as StreamRef)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.stream_for(peer).is_some_and(|s| s.opened())
    }

    /// Punches a connection to `remote` through the first mediator in
    /// `mediators` that manages to introduce us. Mediators we have no stream
    /// to are skipped.
    pub async fn connect_to(&self, remote: PeerId, mediators: &[PeerId]) -> Result<StreamRef, HolePunchError> {
        let inner = &self.inner;
        if self.is_connected(&remote) {
            return Err(HolePunchError::AlreadyConnected(remote));
        }

        let candidates: Vec<Arc<TcpHolePunchingStream>> = mediators
            .iter()
            .filter(|m| **m != remote)
            .filter_map(|m| inner.stream_for(m))
            .take(inner.config.max_mediators)
            .collect();

        for mediator in candidates {
            if let Some(stream) = inner.clone().punch_round(&mediator, remote).await {
                info!(peer = %remote.short(), "hole punch succeeded");
                return Ok(stream);
            }
        }
        debug!(peer = %remote.short(), "hole punch exhausted all mediators");
        Err(HolePunchError::ConnectionFailed { peer: remote })
    }
}

impl HolePunchInner {
    fn stream_for(&self, peer: &PeerId) -> Option<Arc<TcpHolePunchingStream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .and_then(Weak::upgrade)
    }

    /// Indexes `stream` for `peer`. Unless `force`d, an opened live stream
    /// already indexed for the peer is kept.
    fn register(&self, peer: PeerId, stream: &Arc<TcpHolePunchingStream>, force: bool) {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        streams.retain(|_, s| s.strong_count() > 0);
        let keep_current = !force
            && streams
                .get(&peer)
                .and_then(Weak::upgrade)
                .is_some_and(|current| current.opened());
        if !keep_current {
            streams.insert(peer, Arc::downgrade(stream));
        }
    }

    /// One rendezvous through `mediator`.
    async fn punch_round(
        self: Arc<Self>,
        mediator: &Arc<TcpHolePunchingStream>,
        remote: PeerId,
    ) -> Option<StreamRef> {
        let mediator_id = mediator.remote_peer_id().ok()?;
        let local = match self.tcp.unused_local_addr() {
            Ok(local) => local,
            Err(e) => {
                debug!(error = %e, "no local endpoint for hole punch");
                return None;
            }
        };
        // up before the target learns the port
        let dial_back = match self.tcp.raw_listen(local) {
            Ok(listener) => Some(listener),
            Err(e) => {
                debug!(error = %e, "cannot listen for the dial back");
                None
            }
        };

        let request = FirstStepRequest {
            target: remote,
            endpoint: Endpoint::from(local),
        };
        let response: FirstStepResponse = match mediator
            .call(CONNECTION_FIRST_STEP, &request, self.config.rpc_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(mediator = %mediator_id.short(), error = %e, "first step failed");
                return None;
            }
        };
        let FirstStepResponse::Candidates { punch, listener } = response else {
            debug!(mediator = %mediator_id.short(), peer = %remote.short(), "mediator cannot reach target");
            return None;
        };
        trace!(peer = %remote.short(), %punch, %listener, "dialing punch candidates");

        let mut join_set = JoinSet::new();
        if let Some(dial_back) = dial_back {
            join_set.spawn(self.clone().accept_dial_back(remote, dial_back));
        }
        for endpoint in [punch, listener] {
            let Ok(addr) = endpoint.to_socket_addr() else {
                continue;
            };
            join_set.spawn(self.clone().attempt_connect(remote, addr, Some(local), true));
        }

        while let Some(joined) = join_set.join_next().await {
            if let Ok(Some(stream)) = joined {
                join_set.abort_all();
                return Some(stream as StreamRef);
            }
        }
        None
    }

    /// Accepts on the punch port for as long as the target may still be
    /// dialing it.
    async fn accept_dial_back(
        self: Arc<Self>,
        remote: PeerId,
        listener: TcpListener,
    ) -> Option<Arc<TcpHolePunchingStream>> {
        let attempts = u32::try_from(self.config.connection_attempts).unwrap_or(u32::MAX);
        let window = (self.config.attempt_delay + self.config.attempt_timeout).saturating_mul(attempts);

        let accept = async {
            for attempt in 0..attempts {
                match self.tcp.accept_one(&listener, true).await {
                    Ok(_root) => {
                        if let Some(stream) = self.stream_for(&remote) {
                            return Some(stream);
                        }
                        debug!(peer = %remote.short(), "dial back from an unexpected peer");
                    }
                    Err(e) => {
                        trace!(peer = %remote.short(), attempt, error = %e, "dial back failed");
                        tokio::time::sleep(self.config.attempt_delay).await;
                    }
                }
            }
            None
        };
        tokio::time::timeout(window, accept).await.ok().flatten()
    }

    /// Dials `remote_addr` until a stream to `remote` exists. A stream that
    /// appears through another path (e.g. the peer dialing us) counts too.
    async fn attempt_connect(
        self: Arc<Self>,
        remote: PeerId,
        remote_addr: SocketAddr,
        local: Option<SocketAddr>,
        perform_handshake: bool,
    ) -> Option<Arc<TcpHolePunchingStream>> {
        for attempt in 0..self.config.connection_attempts {
            tokio::time::sleep(self.config.attempt_delay).await;

            if let Some(stream) = self.stream_for(&remote) {
                if perform_handshake && !stream.opened() {
                    let root = root_of(stream.clone());
                    if let Err(e) = root.perform_handshake().await {
                        debug!(peer = %remote.short(), error = %e, "handshake on existing stream failed");
                        continue;
                    }
                }
                return Some(stream);
            }

            let dial = self.tcp.raw_connect(remote_addr, local, perform_handshake);
            match tokio::time::timeout(self.config.attempt_timeout, dial).await {
                Ok(Ok(_root)) => {
                    if let Some(stream) = self.stream_for(&remote) {
                        return Some(stream);
                    }
                    debug!(peer = %remote.short(), "connected to an unexpected peer");
                }
                Ok(Err(e)) => trace!(peer = %remote.short(), attempt, error = %e, "dial failed"),
                Err(_) => trace!(peer = %remote.short(), attempt, "dial timed out"),
            }
        }
        None
    }
}

#[async_trait]
impl ExtensionNode for TcpHolePunchingExtension {
    async fn extend_stream(&self, node: &StreamRef) -> Result<(), StreamError> {
        if node.transport()? != tcp_descriptor() {
            return Ok(());
        }
        let stream = TcpHolePunchingStream::new(Arc::downgrade(&self.inner));
        attach(node, stream.clone())?;
        self.inner.register(stream.remote_peer_id()?, &stream, false);
        Ok(())
    }
}

// ============================================================================
// Stream
// ============================================================================

pub struct TcpHolePunchingStream {
    links: StreamLinks,
    rpc: RpcBase,
    this: Weak<Self>,
    owner: Weak<HolePunchInner>,
    rpc_timeout: Duration,
    handshake_timeout: Duration,
}

impl TcpHolePunchingStream {
    fn new(owner: Weak<HolePunchInner>) -> Arc<Self> {
        let config = owner
            .upgrade()
            .map(|o| o.config.clone())
            .unwrap_or_default();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let rpc = RpcBase::new();

            let this = weak.clone();
            rpc.on_request(CONNECTION_FIRST_STEP, move |body| {
                let this = this.clone();
                async move { upgrade(&this)?.on_first_step(body).await }
            });
            let this = weak.clone();
            rpc.on_request(CONNECTION_SECOND_STEP, move |body| {
                let this = this.clone();
                async move { upgrade(&this)?.on_second_step(body).await }
            });
            let this = weak.clone();
            rpc.on_request(HANDSHAKE, move |_body| {
                let this = this.clone();
                async move {
                    let this = upgrade(&this)?;
                    this.links.set_opened(true);
                    this.claim_index()?;
                    Ok(Vec::new())
                }
            });
            let this = weak.clone();
            rpc.on_request(CLOSURE, move |_body| {
                let this = this.clone();
                async move {
                    upgrade(&this)?.links.set_opened(false);
                    Ok(Vec::new())
                }
            });

            Self {
                links: StreamLinks::leaf().initially_closed(),
                rpc,
                this: weak.clone(),
                owner,
                rpc_timeout: config.rpc_timeout,
                handshake_timeout: config.handshake_timeout,
            }
        })
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        ty: u8,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError> {
        let response = self.rpc.make_rpc(self, ty, serialize(request)?, timeout).await?;
        Ok(deserialize_bounded(&response)?)
    }

    fn owner(&self) -> Result<Arc<HolePunchInner>, RpcError> {
        self.owner.upgrade().ok_or(RpcError::Stream(StreamError::Closed))
    }

    fn claim_index(self: &Arc<Self>) -> Result<(), StreamError> {
        if let Some(owner) = self.owner.upgrade() {
            owner.register(self.remote_peer_id()?, self, true);
        }
        Ok(())
    }

    /// Mediator side.
    async fn on_first_step(&self, body: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let request: FirstStepRequest = deserialize_bounded(&body)?;
        let response = match self.introduce(request).await {
            Ok(candidates) => candidates,
            Err(e) => {
                debug!(error = %e, "cannot introduce initiator");
                FirstStepResponse::Unreachable
            }
        };
        Ok(serialize(&response)?)
    }

    async fn introduce(&self, request: FirstStepRequest) -> anyhow::Result<FirstStepResponse> {
        let owner = self.owner()?;
        let initiator = self.remote_peer_id()?;
        let initiator_ip = self.remote_endpoint()?.to_socket_addr()?.ip();

        let Some(target) = owner.stream_for(&request.target) else {
            debug!(peer = %request.target.short(), "introduction target unknown");
            return Ok(FirstStepResponse::Unreachable);
        };
        let forward = SecondStepRequest {
            initiator,
            endpoint: request.endpoint.with_ip(initiator_ip)?,
        };
        let answer: SecondStepResponse = target
            .call(CONNECTION_SECOND_STEP, &forward, self.rpc_timeout)
            .await?;

        let target_ip = target.remote_endpoint()?.to_socket_addr()?.ip();
        debug!(
            initiator = %initiator.short(),
            target = %request.target.short(),
            "introduced peers"
        );
        Ok(FirstStepResponse::Candidates {
            punch: answer.punch.with_ip(target_ip)?,
            listener: answer.listener.with_ip(target_ip)?,
        })
    }

    /// Target side. Answers with where we can be reached and starts dialing
    /// the initiator in the background.
    async fn on_second_step(&self, body: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let request: SecondStepRequest = deserialize_bounded(&body)?;
        let owner = self.owner()?;

        let remote_addr = request
            .endpoint
            .to_socket_addr()
            .map_err(|e| RpcError::Malformed(e.to_string()))?;
        let runtime = owner
            .tcp
            .runtime()
            .ok_or_else(|| RpcError::Handler("tcp transport is not registered".to_string()))?;
        let listener = owner
            .tcp
            .listener_endpoint()
            .ok_or_else(|| RpcError::Handler("tcp transport is not listening".to_string()))?;
        let local = owner
            .tcp
            .unused_local_addr()
            .map_err(|e| RpcError::Handler(format!("no punch port: {e:#}")))?;
        let punch = Endpoint::from(local);

        trace!(peer = %request.initiator.short(), %remote_addr, "dialing back initiator");
        runtime.spawn(owner.attempt_connect(request.initiator, remote_addr, Some(local), false));

        Ok(serialize(&SecondStepResponse { punch, listener })?)
    }
}

fn upgrade(weak: &Weak<TcpHolePunchingStream>) -> Result<Arc<TcpHolePunchingStream>, RpcError> {
    weak.upgrade().ok_or(RpcError::Stream(StreamError::Closed))
}

#[async_trait]
impl StreamNode for TcpHolePunchingStream {
    fn links(&self) -> &StreamLinks {
        &self.links
    }

    async fn receive(&self, message: Vec<u8>) -> Result<(), StreamError> {
        self.rpc
            .receive(self, message)
            .await
            .map_err(|e| StreamError::Protocol(e.to_string()))
    }

    async fn perform_handshake(&self) -> Result<(), StreamError> {
        self.rpc
            .make_rpc(self, HANDSHAKE, Vec::new(), self.handshake_timeout)
            .await
            .map_err(|e| StreamError::HandshakeFailed(e.to_string()))?;
        self.links.set_opened(true);
        if let Some(this) = self.this.upgrade() {
            this.claim_index()?;
        }
        Ok(())
    }

    async fn perform_closure(&self) -> Result<(), StreamError> {
        if self.opened()
            && let Err(e) = self.rpc.make_rpc(self, CLOSURE, Vec::new(), self.rpc_timeout).await
        {
            debug!(error = %e, "closure rpc failed");
        }
        self.links.set_opened(false);
        Ok(())
    }
}
