//! # TCP Transport
//!
//! Length-prefixed frames over TCP. Every connection starts with an identity
//! exchange:
//!
//! ```text
//! A -> B : [32][A's PeerId]
//! B -> A : [32][B's PeerId]
//! ```
//!
//! Both sides write first and then read, so neither waits on the other. A
//! payload that is not exactly 32 bytes, or that names ourselves, drops the
//! socket before any extension sees it.
//!
//! ## Connection lifecycle
//!
//! 1. Identity exchange (bounded by [`HANDSHAKE_TIMEOUT`])
//! 2. The root [`TcpStream`] is built and the extension chain extends it
//! 3. One IO task starts: it drains the write queue and reads frames, handing
//!    each frame to the chain on its own task
//! 4. The initiating side runs `perform_handshake` down the chain
//!
//! The chain exists before the first frame is read, so a handshake RPC from
//! the remote never arrives at a half-built chain.
//!
//! The IO task owns the root. When the socket ends the chain is closed and
//! released.
//!
//! ## Teardown
//!
//! `close` runs the chain's closure while frames can still leave, so closing
//! layers may tell the remote side. Only then is the socket shut down. A
//! connection whose handshake fails, or whose caller gives up while it is
//! being set up, is shut down before `process_stream` returns.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::endpoint::Endpoint;
use crate::extension::{ExtensionLeafNode, ExtensionNode};
use crate::messaging::{Message, MessageError, MessageReader, MessageSender, MessageWriter};
use crate::peer_id::PeerId;
use crate::stream::{StreamError, StreamLinks, StreamNode, StreamRef};
use crate::transport::{
    ConnectionError, Transport, TransportBinding, TransportDescriptor, TransportTrait,
};

// ============================================================================
// Constants
// ============================================================================

pub const TCP_TRANSPORT_NAME: &str = "TCP";

/// Upper bound for the identity exchange on a fresh socket.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub fn tcp_descriptor() -> TransportDescriptor {
    TransportDescriptor::new(
        TCP_TRANSPORT_NAME,
        [TransportTrait::Fast, TransportTrait::Reliable, TransportTrait::Supports],
    )
}

// ============================================================================
// TcpStream (chain root)
// ============================================================================

pub struct TcpStream {
    links: StreamLinks,
    this_id: PeerId,
    remote_id: PeerId,
    this_endpoint: Endpoint,
    remote_endpoint: Endpoint,
    outgoing: MessageSender,
    shutdown: watch::Sender<bool>,
    /// Set once teardown has started; keeps `close` idempotent.
    closing: AtomicBool,
    /// Set once nothing may be sent anymore.
    closed: AtomicBool,
}

#[async_trait]
impl StreamNode for TcpStream {
    fn links(&self) -> &StreamLinks {
        &self.links
    }

    async fn send(&self, message: Vec<u8>) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        let message = Message::read_from(message).map_err(|e| StreamError::Protocol(e.to_string()))?;
        self.outgoing.send(message).await.map_err(|_| StreamError::Closed)
    }

    /// Closes the chain, then stops the IO task. Idempotent.
    async fn close(&self) -> Result<(), StreamError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(peer = %self.remote_id.short(), "closing tcp stream");
        let _stop = StopOnDrop::armed(&self.shutdown);
        let result = self.perform_closure().await;
        self.closed.store(true, Ordering::Release);
        result
    }

    fn transport(&self) -> Result<TransportDescriptor, StreamError> {
        Ok(tcp_descriptor())
    }

    fn this_peer_id(&self) -> Result<PeerId, StreamError> {
        Ok(self.this_id)
    }

    fn remote_peer_id(&self) -> Result<PeerId, StreamError> {
        Ok(self.remote_id)
    }

    fn this_endpoint(&self) -> Result<Endpoint, StreamError> {
        Ok(self.this_endpoint.clone())
    }

    fn remote_endpoint(&self) -> Result<Endpoint, StreamError> {
        Ok(self.remote_endpoint.clone())
    }
}

/// Signals the IO task to stop when dropped, unless disarmed first.
struct StopOnDrop<'a> {
    shutdown: Option<&'a watch::Sender<bool>>,
}

impl<'a> StopOnDrop<'a> {
    fn armed(shutdown: &'a watch::Sender<bool>) -> Self {
        Self { shutdown: Some(shutdown) }
    }

    fn disarm(mut self) {
        self.shutdown = None;
    }
}

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

/// Owns the root until the socket ends or `close` is requested.
async fn run_connection(
    root: Arc<TcpStream>,
    mut reader: MessageReader<OwnedReadHalf>,
    writer: MessageWriter<OwnedWriteHalf>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = root.remote_id.short();
    let write_task = tokio::spawn(writer.run());

    let remote_gone = loop {
        tokio::select! {
            _ = shutdown.changed() => break false,
            read = reader.read() => match read {
                Ok(message) => {
                    trace!(peer = %peer, len = message.payload().len(), "frame received");
                    let root = root.clone();
                    tokio::spawn(async move {
                        if let Err(e) = root.receive(message.into_payload()).await {
                            debug!(peer = %root.remote_id.short(), error = %e, "frame handling failed");
                        }
                    });
                }
                Err(MessageError::Closed) => {
                    debug!(peer = %peer, "connection closed by remote");
                    break true;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "dropping connection");
                    break true;
                }
            }
        }
    };

    // Nothing reaches a remote whose socket has ended.
    if remote_gone {
        root.closed.store(true, Ordering::Release);
    }
    if !root.closing.swap(true, Ordering::AcqRel)
        && let Err(e) = root.perform_closure().await
    {
        debug!(peer = %peer, error = %e, "closure after disconnect failed");
    }
    root.closed.store(true, Ordering::Release);

    write_task.abort();
    let _ = write_task.await;
}

// ============================================================================
// Tcp transport
// ============================================================================

/// Cheap-to-clone handle to one TCP transport instance.
#[derive(Clone)]
pub struct Tcp {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    bind_addr: SocketAddr,
    identity: RwLock<Option<(PeerId, Handle)>>,
    extension: RwLock<Arc<dyn ExtensionNode>>,
    listener_addr: RwLock<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for TcpInner {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl Tcp {
    /// Listens on `bind_addr` once initialized. Port 0 picks a free port.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                bind_addr,
                identity: RwLock::new(None),
                extension: RwLock::new(Arc::new(ExtensionLeafNode)),
                listener_addr: RwLock::new(None),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Listens on every interface.
    pub fn with_port(port: u16) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Where peers can reach our listener. An unspecified bind address is
    /// reported as loopback; remote peers substitute what they observe.
    pub fn listener_endpoint(&self) -> Option<Endpoint> {
        let addr = (*self.inner.listener_addr.read().unwrap_or_else(PoisonError::into_inner))?;
        Some(Endpoint::from(reportable(addr)))
    }

    /// Stops accepting. Established connections stay up.
    pub fn close(&self) {
        if let Some(task) = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// Finds a local address whose port is free right now by binding port 0
    /// and releasing it.
    ///
    /// Racy: another socket may claim the port before the caller binds it.
    pub fn unused_local_addr(&self) -> Result<SocketAddr> {
        let ip = self.inner.bind_addr.ip();
        let socket = new_socket(&SocketAddr::new(ip, 0))?;
        socket.bind(SocketAddr::new(ip, 0)).context("bind ephemeral port")?;
        socket.local_addr().context("read ephemeral port")
    }

    /// [`unused_local_addr`](Self::unused_local_addr) as peers would dial it.
    pub fn unused_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::from(reportable(self.unused_local_addr()?)))
    }

    /// Opens a connection to `remote`, optionally from `local`.
    ///
    /// `perform_handshake` selects whether this side runs the chain
    /// handshake once the connection is extended.
    pub async fn raw_connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        perform_handshake: bool,
    ) -> Result<StreamRef> {
        let socket = new_socket(&remote)?;
        if let Some(local) = local {
            socket.bind(local).with_context(|| format!("bind {local}"))?;
        }
        let stream = socket
            .connect(remote)
            .await
            .with_context(|| format!("connect to {remote}"))?;
        self.inner.process_stream(stream, perform_handshake).await
    }

    /// Accepts a single connection on `local`.
    pub async fn raw_accept(&self, local: SocketAddr, perform_handshake: bool) -> Result<StreamRef> {
        let listener = self.raw_listen(local)?;
        self.accept_one(&listener, perform_handshake).await
    }

    /// Listener on `local` that shares the port with dialing sockets.
    pub fn raw_listen(&self, local: SocketAddr) -> Result<TcpListener> {
        let socket = new_socket(&local)?;
        socket.bind(local).with_context(|| format!("bind {local}"))?;
        socket.listen(1).context("listen")
    }

    /// Takes the next connection from `listener` through the chain.
    pub async fn accept_one(&self, listener: &TcpListener, perform_handshake: bool) -> Result<StreamRef> {
        let (stream, addr) = listener.accept().await.context("accept")?;
        trace!(%addr, "raw accept");
        self.inner.process_stream(stream, perform_handshake).await
    }

    /// Runtime the transport was registered on.
    pub fn runtime(&self) -> Option<Handle> {
        self.inner.identity().ok().map(|(_, runtime)| runtime)
    }
}

fn reportable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
        _ => addr,
    }
}

/// Socket that may share its local port with other punching sockets.
fn new_socket(addr: &SocketAddr) -> Result<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .context("create socket")?;
    socket.set_reuseaddr(true).context("SO_REUSEADDR")?;
    #[cfg(unix)]
    socket.set_reuseport(true).context("SO_REUSEPORT")?;
    Ok(socket)
}

impl TcpInner {
    fn identity(&self) -> Result<(PeerId, Handle)> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .context("tcp transport is not registered")
    }

    fn extension(&self) -> Arc<dyn ExtensionNode> {
        self.extension
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn process_stream(
        &self,
        socket: tokio::net::TcpStream,
        perform_handshake: bool,
    ) -> Result<StreamRef> {
        let (this_id, runtime) = self.identity()?;
        let this_addr = socket.local_addr().context("local address")?;
        let remote_addr = socket.peer_addr().context("peer address")?;
        socket.set_nodelay(true).context("TCP_NODELAY")?;

        let (read_half, write_half) = socket.into_split();
        let mut reader = MessageReader::new(read_half);
        let (mut writer, outgoing) = MessageWriter::new(write_half);

        let exchange = async {
            writer.write(&Message::read_from(this_id.as_bytes().to_vec())?).await?;
            reader.read().await
        };
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
            .await
            .context("peer id exchange timed out")?
            .context("peer id exchange")?;
        let remote_id = PeerId::from_slice(first.payload()).context("peer id exchange")?;
        if remote_id == this_id {
            bail!("refusing connection to ourselves at {remote_addr}");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let root = Arc::new(TcpStream {
            links: StreamLinks::list(),
            this_id,
            remote_id,
            this_endpoint: Endpoint::from(this_addr),
            remote_endpoint: Endpoint::from(remote_addr),
            outgoing,
            shutdown: shutdown_tx,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let root_ref: StreamRef = root.clone();

        self.extension()
            .extend_stream(&root_ref)
            .await
            .context("extend stream")?;
        runtime.spawn(run_connection(root.clone(), reader, writer, shutdown_rx));

        debug!(peer = %remote_id.short(), remote = %remote_addr, outbound = perform_handshake, "tcp connection up");

        // covers both the error return and a caller dropping this future
        let stop = StopOnDrop::armed(&root.shutdown);
        if perform_handshake {
            root_ref.perform_handshake().await.context("chain handshake")?;
        }
        stop.disarm();
        Ok(root_ref)
    }
}

async fn accept_loop(inner: Weak<TcpInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(e) = inner.process_stream(socket, false).await {
                        debug!(remote = %addr, error = %e, "inbound connection rejected");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

#[async_trait]
impl Transport for Tcp {
    fn descriptor(&self) -> TransportDescriptor {
        tcp_descriptor()
    }

    fn supports(&self, endpoint: &Endpoint) -> bool {
        endpoint.is_ip()
    }

    fn bind(&self, binding: TransportBinding) {
        *self.inner.identity.write().unwrap_or_else(PoisonError::into_inner) =
            Some((binding.peer_id, binding.runtime));
        self.set_extension(binding.extension);
    }

    fn set_extension(&self, extension: Arc<dyn ExtensionNode>) {
        *self.inner.extension.write().unwrap_or_else(PoisonError::into_inner) = extension;
    }

    async fn init(&self) -> Result<(), ConnectionError> {
        let (_, runtime) = self
            .inner
            .identity()
            .map_err(|_| ConnectionError::NotInitialized(TCP_TRANSPORT_NAME.to_string()))?;
        let addr = self.inner.bind_addr;
        let bind_error = |source| ConnectionError::Bind {
            addr: addr.to_string(),
            source,
        };

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        *self.inner.listener_addr.write().unwrap_or_else(PoisonError::into_inner) = Some(local);
        let task = runtime.spawn(accept_loop(Arc::downgrade(&self.inner), listener));
        if let Some(previous) = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }

        info!(addr = %local, "tcp transport listening");
        Ok(())
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<StreamRef, ConnectionError> {
        let remote = endpoint
            .to_socket_addr()
            .map_err(|e| ConnectionError::failed(endpoint, e))?;
        self.raw_connect(remote, None, true)
            .await
            .map_err(|e| ConnectionError::failed(endpoint, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StreamToChannelAdapter;
    use crate::stream::attach;
    use crate::transport::TransportManager;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    /// Attaches a channel adapter to every new connection and reports it.
    struct AdapterExtension {
        streams: mpsc::UnboundedSender<Arc<StreamToChannelAdapter>>,
    }

    #[async_trait]
    impl ExtensionNode for AdapterExtension {
        async fn extend_stream(&self, node: &StreamRef) -> Result<(), StreamError> {
            let adapter = StreamToChannelAdapter::new(crate::adapter::DEFAULT_CHANNEL_BUFFER);
            attach(node, adapter.clone())?;
            let _ = self.streams.send(adapter);
            Ok(())
        }
    }

    /// Leaf that says goodbye to the remote while closing, and whose
    /// handshake can be made to fail or never finish.
    struct ScriptedLeaf {
        links: StreamLinks,
        handshake: HandshakeOutcome,
    }

    #[derive(Clone, Copy)]
    enum HandshakeOutcome {
        Succeeds,
        Fails,
        Hangs,
    }

    #[async_trait]
    impl StreamNode for ScriptedLeaf {
        fn links(&self) -> &StreamLinks {
            &self.links
        }

        async fn perform_handshake(&self) -> Result<(), StreamError> {
            match self.handshake {
                HandshakeOutcome::Succeeds => Ok(()),
                HandshakeOutcome::Fails => Err(StreamError::HandshakeFailed("refused".to_string())),
                HandshakeOutcome::Hangs => std::future::pending().await,
            }
        }

        async fn perform_closure(&self) -> Result<(), StreamError> {
            self.send(b"bye".to_vec()).await?;
            self.links.set_opened(false);
            Ok(())
        }
    }

    struct ScriptedExtension {
        handshake: HandshakeOutcome,
        leaves: mpsc::UnboundedSender<Weak<ScriptedLeaf>>,
    }

    #[async_trait]
    impl ExtensionNode for ScriptedExtension {
        async fn extend_stream(&self, node: &StreamRef) -> Result<(), StreamError> {
            let leaf = Arc::new(ScriptedLeaf {
                links: StreamLinks::leaf(),
                handshake: self.handshake,
            });
            attach(node, leaf.clone())?;
            let _ = self.leaves.send(Arc::downgrade(&leaf));
            Ok(())
        }
    }

    async fn tcp_node_with(id: PeerId, extension: Arc<dyn ExtensionNode>) -> Tcp {
        let manager = TransportManager::new(id);
        let tcp = Tcp::new("127.0.0.1:0".parse().unwrap());
        manager.register_transport(Arc::new(tcp.clone())).await.unwrap();
        tcp.set_extension(extension);
        tcp
    }

    async fn tcp_node(id: PeerId) -> (Tcp, mpsc::UnboundedReceiver<Arc<StreamToChannelAdapter>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tcp = tcp_node_with(id, Arc::new(AdapterExtension { streams: tx })).await;
        (tcp, rx)
    }

    async fn scripted_node(
        handshake: HandshakeOutcome,
    ) -> (Tcp, mpsc::UnboundedReceiver<Weak<ScriptedLeaf>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let extension = ScriptedExtension { handshake, leaves: tx };
        let tcp = tcp_node_with(PeerId::random(), Arc::new(extension)).await;
        (tcp, rx)
    }

    async fn released<T>(node: Weak<T>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while node.upgrade().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("chain not released");
    }

    #[tokio::test]
    async fn connect_exchanges_ids_and_frames() {
        let (a_id, b_id) = (PeerId::random(), PeerId::random());
        let (a, mut a_streams) = tcp_node(a_id).await;
        let (b, mut b_streams) = tcp_node(b_id).await;

        let root = a.connect(&b.listener_endpoint().unwrap()).await.unwrap();
        assert_eq!(root.this_peer_id().unwrap(), a_id);
        assert_eq!(root.remote_peer_id().unwrap(), b_id);

        let a_side = a_streams.recv().await.unwrap();
        let b_side = b_streams.recv().await.unwrap();
        assert_eq!(b_side.remote_peer_id().unwrap(), a_id);

        a_side.sender().unwrap().send(b"ping".to_vec()).await.unwrap();
        tokio::spawn({
            let a_side = a_side.clone();
            async move { a_side.run().await }
        });
        assert_eq!(b_side.next_received().await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn self_connection_is_refused() {
        let id = PeerId::random();
        let (tcp, _streams) = tcp_node(id).await;
        let endpoint = tcp.listener_endpoint().unwrap();
        let err = tcp.connect(&endpoint).await.err().unwrap();
        assert!(matches!(err, ConnectionError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn wrong_length_id_drops_the_socket() {
        let (tcp, _streams) = tcp_node(PeerId::random()).await;
        let addr = tcp.listener_endpoint().unwrap().to_socket_addr().unwrap();

        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        socket.write_all(&Message::read_from(vec![1, 2, 3]).unwrap().to_frame()).await.unwrap();

        // their id frame, then EOF
        let mut buf = vec![0u8; 36];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], &32u32.to_be_bytes());
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn raw_accept_takes_one_connection_on_a_chosen_port() {
        let (a, mut a_streams) = tcp_node(PeerId::random()).await;
        let (b, _b_streams) = tcp_node(PeerId::random()).await;
        let local = b.unused_local_addr().unwrap();

        let accept = tokio::spawn({
            let b = b.clone();
            async move { b.raw_accept(local, false).await }
        });
        let root = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match a.raw_connect(local, None, true).await {
                    Ok(root) => break root,
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .expect("raw connect");

        let accepted = accept.await.unwrap().unwrap();
        assert_eq!(accepted.remote_peer_id().unwrap(), root.this_peer_id().unwrap());
        assert!(a_streams.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsupported_endpoints() {
        let tcp = Tcp::with_port(0);
        assert!(tcp.supports(&Endpoint::new("/ipv4/127.0.0.1:80/")));
        assert!(!tcp.supports(&Endpoint::new("/bt/00:11:22/")));
        assert!(tcp.listener_endpoint().is_none());
    }

    #[tokio::test]
    async fn unused_endpoint_is_dialable() {
        let tcp = Tcp::with_port(0);
        assert!(tcp.runtime().is_none());
        let addr = tcp.unused_endpoint().unwrap().to_socket_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn close_releases_the_chain() {
        let (a, mut a_streams) = tcp_node(PeerId::random()).await;
        let (b, mut b_streams) = tcp_node(PeerId::random()).await;

        let root = a.connect(&b.listener_endpoint().unwrap()).await.unwrap();
        let a_side = Arc::downgrade(&a_streams.recv().await.unwrap());
        let b_side = Arc::downgrade(&b_streams.recv().await.unwrap());

        root.close().await.unwrap();
        drop(root);

        tokio::time::timeout(Duration::from_secs(5), async {
            while a_side.upgrade().is_some() || b_side.upgrade().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("both chains released");
    }

    #[tokio::test]
    async fn close_lets_the_chain_reach_the_remote() {
        let (a, mut a_leaves) = scripted_node(HandshakeOutcome::Succeeds).await;
        let (b, mut b_streams) = tcp_node(PeerId::random()).await;

        let root = a.connect(&b.listener_endpoint().unwrap()).await.unwrap();
        let a_leaf = a_leaves.recv().await.unwrap();
        let b_side = b_streams.recv().await.unwrap();

        root.close().await.expect("closure frames must still go out");
        let farewell = tokio::time::timeout(Duration::from_secs(5), b_side.next_received())
            .await
            .expect("remote never heard the closure");
        assert_eq!(farewell.unwrap(), b"bye");

        assert!(root.close().await.is_ok());
        assert!(matches!(root.send(b"late".to_vec()).await, Err(StreamError::Closed)));
        drop(root);
        released(a_leaf).await;
    }

    #[tokio::test]
    async fn failed_handshake_tears_the_connection_down() {
        let (a, mut a_leaves) = scripted_node(HandshakeOutcome::Fails).await;
        let (b, mut b_streams) = tcp_node(PeerId::random()).await;

        let err = a.connect(&b.listener_endpoint().unwrap()).await.err().unwrap();
        assert!(matches!(err, ConnectionError::ConnectionFailed { .. }));

        let a_leaf = a_leaves.recv().await.unwrap();
        let b_side = Arc::downgrade(&b_streams.recv().await.unwrap());
        released(a_leaf).await;
        released(b_side).await;
    }

    #[tokio::test]
    async fn cancelled_handshake_tears_the_connection_down() {
        let (a, mut a_leaves) = scripted_node(HandshakeOutcome::Hangs).await;
        let (b, mut b_streams) = tcp_node(PeerId::random()).await;
        let remote = b.listener_endpoint().unwrap().to_socket_addr().unwrap();

        let a_leaf = {
            let connect = a.raw_connect(remote, None, true);
            tokio::pin!(connect);
            tokio::select! {
                _ = &mut connect => panic!("handshake cannot finish"),
                leaf = a_leaves.recv() => leaf.unwrap(),
            }
        };

        let b_side = Arc::downgrade(&b_streams.recv().await.unwrap());
        released(a_leaf).await;
        released(b_side).await;
    }
}
