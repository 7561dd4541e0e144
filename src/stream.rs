//! # Stream Chains
//!
//! Every physical connection is represented as a chain of [`StreamNode`]s.
//! The root is owned by the transport and performs the actual IO; each
//! protocol layer inserts one node below it.
//!
//! ```text
//!   TcpStream (root)         send: child -> parent
//!       |                    receive: parent -> child
//!   ProtocolRouterStream
//!     |           |
//!   HolePunch   KadDht
//! ```
//!
//! ## Ownership
//!
//! A parent owns its children (`Arc`), a child refers to its parent through a
//! `Weak`. The transport task owns the root, so once a connection dies the
//! whole chain is released and every non-owning handle to it (indexes,
//! routing-table entries) upgrades to `None`.
//!
//! ## Per-connection context
//!
//! Identity and endpoint accessors are answered by the root. Every other node
//! tunnels them up through its parent, which fails with
//! [`StreamError::Detached`] until the node has been attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;

use crate::endpoint::Endpoint;
use crate::peer_id::PeerId;
use crate::transport::TransportDescriptor;

pub type StreamRef = Arc<dyn StreamNode>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream node has no parent attached")]
    Detached,
    #[error("leaf stream node cannot hold a child")]
    LeafNode,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("closure failed: {0}")]
    ClosureFailed(String),
    #[error("stream is closed")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Parent/child slots and the local `opened` flag shared by every node.
pub struct StreamLinks {
    holds_child: bool,
    parent: RwLock<Option<Weak<dyn StreamNode>>>,
    child: RwLock<Option<StreamRef>>,
    opened: AtomicBool,
}

impl StreamLinks {
    /// Links of a terminal node. Starts opened: a node without a handshake
    /// of its own is usable as soon as it is attached.
    pub fn leaf() -> Self {
        Self::build(false)
    }

    /// Links of a node that forwards to one child.
    pub fn list() -> Self {
        Self::build(true)
    }

    fn build(holds_child: bool) -> Self {
        Self {
            holds_child,
            parent: RwLock::new(None),
            child: RwLock::new(None),
            opened: AtomicBool::new(true),
        }
    }

    /// For nodes that only become opened through their own handshake.
    pub fn initially_closed(self) -> Self {
        self.opened.store(false, Ordering::Release);
        self
    }

    pub fn holds_child(&self) -> bool {
        self.holds_child
    }

    pub fn parent(&self) -> Result<StreamRef, StreamError> {
        self.parent_opt().ok_or(StreamError::Detached)
    }

    pub fn parent_opt(&self) -> Option<StreamRef> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn child(&self) -> Option<StreamRef> {
        self.child
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_parent(&self, parent: Weak<dyn StreamNode>) {
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = Some(parent);
    }

    fn set_child(&self, child: Option<StreamRef>) {
        *self.child.write().unwrap_or_else(PoisonError::into_inner) = child;
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn set_opened(&self, opened: bool) {
        self.opened.store(opened, Ordering::Release);
    }
}

/// One protocol layer of one connection.
///
/// The default method bodies describe a pass-through list node; layers
/// override what they intercept.
#[async_trait]
pub trait StreamNode: Send + Sync + 'static {
    fn links(&self) -> &StreamLinks;

    /// Delivers `message` towards the remote peer. Flows child to parent
    /// until the root writes it out.
    async fn send(&self, message: Vec<u8>) -> Result<(), StreamError> {
        self.links().parent()?.send(message).await
    }

    /// Called by the parent with a message from the remote peer.
    async fn receive(&self, message: Vec<u8>) -> Result<(), StreamError> {
        match self.links().child() {
            Some(child) => child.receive(message).await,
            None => Ok(()),
        }
    }

    /// Runs top-down, once per connection, on the side that opened it.
    async fn perform_handshake(&self) -> Result<(), StreamError> {
        self.links().set_opened(true);
        if let Some(child) = self.links().child() {
            child.perform_handshake().await?;
        }
        Ok(())
    }

    /// Children close before their parent.
    async fn perform_closure(&self) -> Result<(), StreamError> {
        if let Some(child) = self.links().child() {
            child.perform_closure().await?;
        }
        self.links().set_opened(false);
        Ok(())
    }

    /// Asks the root to shut the connection down.
    async fn close(&self) -> Result<(), StreamError> {
        match self.links().parent_opt() {
            Some(parent) => parent.close().await,
            None => self.perform_closure().await,
        }
    }

    /// Local view only. The remote side may disagree.
    fn opened(&self) -> bool {
        self.links().is_opened()
    }

    fn transport(&self) -> Result<TransportDescriptor, StreamError> {
        self.links().parent()?.transport()
    }

    fn this_peer_id(&self) -> Result<PeerId, StreamError> {
        self.links().parent()?.this_peer_id()
    }

    fn remote_peer_id(&self) -> Result<PeerId, StreamError> {
        self.links().parent()?.remote_peer_id()
    }

    fn this_endpoint(&self) -> Result<Endpoint, StreamError> {
        self.links().parent()?.this_endpoint()
    }

    fn remote_endpoint(&self) -> Result<Endpoint, StreamError> {
        self.links().parent()?.remote_endpoint()
    }
}

/// Makes `child` the child of `parent`, replacing any previous child.
pub fn attach(parent: &StreamRef, child: StreamRef) -> Result<(), StreamError> {
    let links = parent.links();
    if !links.holds_child() {
        return Err(StreamError::LeafNode);
    }
    child.links().set_parent(Arc::downgrade(parent));
    links.set_child(Some(child));
    Ok(())
}

/// Points `child` at `parent` without occupying the parent's child slot.
/// For nodes that own several children themselves.
pub fn adopt(parent: &StreamRef, child: &StreamRef) {
    child.links().set_parent(Arc::downgrade(parent));
}

/// Walks up to the node that owns the physical connection.
pub fn root_of(node: StreamRef) -> StreamRef {
    let mut current = node;
    while let Some(parent) = current.links().parent_opt() {
        current = parent;
    }
    current
}

/// Pass-through node with one child slot.
pub struct StreamListNode {
    links: StreamLinks,
}

impl StreamListNode {
    pub fn new() -> Self {
        Self { links: StreamLinks::list() }
    }
}

impl Default for StreamListNode {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamNode for StreamListNode {
    fn links(&self) -> &StreamLinks {
        &self.links
    }
}

/// Terminal node that drops whatever it receives.
pub struct StreamLeafNode {
    links: StreamLinks,
}

impl StreamLeafNode {
    pub fn new() -> Self {
        Self { links: StreamLinks::leaf() }
    }
}

impl Default for StreamLeafNode {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamNode for StreamLeafNode {
    fn links(&self) -> &StreamLinks {
        &self.links
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connection: two roots wired back to back.

    use super::*;
    use crate::transport::TransportTrait;

    pub(crate) struct ConnectorEnd {
        links: StreamLinks,
        this_id: PeerId,
        remote_id: PeerId,
        this_endpoint: Endpoint,
        remote_endpoint: Endpoint,
        other: RwLock<Weak<ConnectorEnd>>,
    }

    impl ConnectorEnd {
        fn new(this_id: PeerId, remote_id: PeerId, this_endpoint: Endpoint, remote_endpoint: Endpoint) -> Self {
            Self {
                links: StreamLinks::list(),
                this_id,
                remote_id,
                this_endpoint,
                remote_endpoint,
                other: RwLock::new(Weak::new()),
            }
        }
    }

    pub(crate) fn memory_descriptor() -> TransportDescriptor {
        TransportDescriptor::new("memory", [TransportTrait::Reliable])
    }

    /// Returns the two roots of one in-memory connection between `a` and `b`.
    pub(crate) fn connected_pair(a: PeerId, b: PeerId) -> (StreamRef, StreamRef) {
        connected_pair_at(
            (a, Endpoint::new("/ipv4/127.0.0.1:1000/")),
            (b, Endpoint::new("/ipv4/127.0.0.1:2000/")),
        )
    }

    /// Like [`connected_pair`], with each side seen at the given endpoint.
    pub(crate) fn connected_pair_at(
        (a, a_endpoint): (PeerId, Endpoint),
        (b, b_endpoint): (PeerId, Endpoint),
    ) -> (StreamRef, StreamRef) {
        let left = Arc::new(ConnectorEnd::new(a, b, a_endpoint.clone(), b_endpoint.clone()));
        let right = Arc::new(ConnectorEnd::new(b, a, b_endpoint, a_endpoint));
        *left.other.write().unwrap() = Arc::downgrade(&right);
        *right.other.write().unwrap() = Arc::downgrade(&left);
        (left, right)
    }

    #[async_trait]
    impl StreamNode for ConnectorEnd {
        fn links(&self) -> &StreamLinks {
            &self.links
        }

        async fn send(&self, message: Vec<u8>) -> Result<(), StreamError> {
            let other = self.other.read().unwrap().upgrade().ok_or(StreamError::Closed)?;
            other.receive(message).await
        }

        fn transport(&self) -> Result<TransportDescriptor, StreamError> {
            Ok(memory_descriptor())
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
}

#[cfg(test)]
mod tests {
    use super::testing::connected_pair;
    use super::*;
    use tokio::sync::Mutex;

    /// Leaf that records what reaches it.
    struct Recorder {
        links: StreamLinks,
        received: Mutex<Vec<Vec<u8>>>,
        closures: std::sync::atomic::AtomicUsize,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                links: StreamLinks::leaf(),
                received: Mutex::new(Vec::new()),
                closures: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StreamNode for Recorder {
        fn links(&self) -> &StreamLinks {
            &self.links
        }

        async fn receive(&self, message: Vec<u8>) -> Result<(), StreamError> {
            self.received.lock().await.push(message);
            Ok(())
        }

        async fn perform_closure(&self) -> Result<(), StreamError> {
            self.closures.fetch_add(1, Ordering::SeqCst);
            self.links().set_opened(false);
            Ok(())
        }
    }

    #[tokio::test]
    async fn messages_cross_the_connector() {
        let a = PeerId::random();
        let b = PeerId::random();
        let (left, right) = connected_pair(a, b);

        let left_inter: StreamRef = Arc::new(StreamListNode::new());
        let right_inter: StreamRef = Arc::new(StreamListNode::new());
        attach(&left, left_inter.clone()).unwrap();
        attach(&right, right_inter.clone()).unwrap();

        let left_leaf = Arc::new(Recorder::new());
        let right_leaf = Arc::new(Recorder::new());
        attach(&left_inter, left_leaf.clone()).unwrap();
        attach(&right_inter, right_leaf.clone()).unwrap();

        left_leaf.send(b"A".to_vec()).await.unwrap();
        right_leaf.send(b"B".to_vec()).await.unwrap();

        assert_eq!(*right_leaf.received.lock().await, vec![b"A".to_vec()]);
        assert_eq!(*left_leaf.received.lock().await, vec![b"B".to_vec()]);
    }

    #[tokio::test]
    async fn accessors_tunnel_to_the_root() {
        let a = PeerId::random();
        let b = PeerId::random();
        let (left, _right) = connected_pair(a, b);

        let leaf: StreamRef = Arc::new(StreamLeafNode::new());
        assert_eq!(leaf.this_peer_id(), Err(StreamError::Detached));

        let inter: StreamRef = Arc::new(StreamListNode::new());
        attach(&left, inter.clone()).unwrap();
        attach(&inter, leaf.clone()).unwrap();

        assert_eq!(leaf.this_peer_id().unwrap(), a);
        assert_eq!(leaf.remote_peer_id().unwrap(), b);
        assert_eq!(leaf.transport().unwrap().name(), "memory");
        assert!(leaf.remote_endpoint().unwrap().is_ip());
        assert!(Arc::ptr_eq(&root_of(leaf), &left));
    }

    #[tokio::test]
    async fn leaves_cannot_hold_children() {
        let leaf: StreamRef = Arc::new(StreamLeafNode::new());
        let other: StreamRef = Arc::new(StreamLeafNode::new());
        assert_eq!(attach(&leaf, other), Err(StreamError::LeafNode));
    }

    #[tokio::test]
    async fn close_travels_up_then_closes_children_first() {
        let (left, _right) = connected_pair(PeerId::random(), PeerId::random());
        let inter: StreamRef = Arc::new(StreamListNode::new());
        let leaf = Arc::new(Recorder::new());
        attach(&left, inter.clone()).unwrap();
        attach(&inter, leaf.clone()).unwrap();

        leaf.close().await.unwrap();

        assert_eq!(leaf.closures.load(Ordering::SeqCst), 1);
        assert!(!leaf.opened());
        assert!(!inter.opened());
        assert!(!left.opened());
    }

    #[tokio::test]
    async fn dropping_the_root_releases_the_chain() {
        let (left, right) = connected_pair(PeerId::random(), PeerId::random());
        let leaf = Arc::new(Recorder::new());
        attach(&left, leaf.clone()).unwrap();
        let weak_leaf = Arc::downgrade(&leaf);
        drop(leaf);
        assert!(weak_leaf.upgrade().is_some());

        drop(left);
        drop(right);
        assert!(weak_leaf.upgrade().is_none());
    }
}
