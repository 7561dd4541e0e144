//! # RPC Layer
//!
//! Request/response correlation over a plain byte stream. An [`RpcBase`] is
//! embedded in a stream node; it frames outgoing requests, remembers who is
//! waiting for which answer and dispatches incoming requests to the handler
//! registered for their type.
//!
//! ## Frame Layout
//!
//! ```text
//! [signature: u8][type: u8][id: u32 BE][body ...]
//!   signature 0 = request, 1 = response
//! ```
//!
//! ## Correlation
//!
//! - Request ids come from a wrapping counter.
//! - At most one pending caller per id; the entry is removed on response,
//!   on timeout and when the caller is cancelled.
//! - A response whose id is not pending (late, duplicate) is dropped.
//! - Responses may arrive in any order; only the id matters.
//!
//! Retries are left to the caller: this layer knows nothing about
//! idempotency.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

use crate::stream::{StreamError, StreamNode};

// ============================================================================
// Wire Constants
// ============================================================================

pub const REQUEST_SIGNATURE: u8 = 0;
pub const RESPONSE_SIGNATURE: u8 = 1;

/// Signature + type + id.
const HEADER_LEN: usize = 1 + 1 + 4;

/// Timeout used when the caller has no better idea.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(5000);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc of type {ty} timed out after {timeout:?}")]
    Timeout { ty: u8, timeout: Duration },
    #[error("no handler registered for rpc type {0}")]
    UnregisteredType(u8),
    #[error("malformed rpc frame: {0}")]
    Malformed(String),
    /// The request was well formed but this side could not serve it.
    #[error("rpc handler failed: {0}")]
    Handler(String),
    #[error("rpc caller went away before the response")]
    Cancelled,
    #[error("rpc body codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFrame {
    pub signature: u8,
    pub ty: u8,
    pub id: u32,
    pub body: Vec<u8>,
}

impl RpcFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.push(self.signature);
        out.push(self.ty);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(mut bytes: Vec<u8>) -> Result<Self, RpcError> {
        if bytes.len() < HEADER_LEN {
            return Err(RpcError::Malformed(format!(
                "{} bytes is shorter than the {HEADER_LEN} byte header",
                bytes.len()
            )));
        }
        let body = bytes.split_off(HEADER_LEN);
        let id = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        Ok(Self {
            signature: bytes[0],
            ty: bytes[1],
            id,
            body,
        })
    }
}

// ============================================================================
// RpcBase
// ============================================================================

/// Answers one request body with a response body.
pub type RpcHandler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, RpcError>> + Send + Sync>;

pub struct RpcBase {
    handlers: RwLock<HashMap<u8, RpcHandler>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>,
    next_id: AtomicU32,
}

impl Default for RpcBase {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcBase {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    fn starting_at(first_id: u32) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(first_id),
        }
    }

    /// Registers the handler for requests of type `ty`, replacing any
    /// previous one.
    pub fn on_request<F, Fut>(&self, ty: u8, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, RpcError>> + Send + 'static,
    {
        let handler: RpcHandler = Arc::new(move |body| handler(body).boxed());
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ty, handler);
    }

    /// Number of callers still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Sends a request of type `ty` through `via` and waits for the matching
    /// response.
    ///
    /// The pending entry is registered before the request leaves, so even an
    /// immediate answer finds its caller.
    pub async fn make_rpc(
        &self,
        via: &dyn StreamNode,
        ty: u8,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        let _pending = PendingGuard { base: self, id };

        let request = RpcFrame {
            signature: REQUEST_SIGNATURE,
            ty,
            id,
            body,
        };
        trace!(ty, id, "rpc request");

        let exchange = async {
            via.send(request.encode()).await?;
            rx.await.map_err(|_| RpcError::Cancelled)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout { ty, timeout }),
        }
    }

    /// Handles one frame that arrived on `via`.
    pub async fn receive(&self, via: &dyn StreamNode, message: Vec<u8>) -> Result<(), RpcError> {
        let frame = RpcFrame::decode(message)?;
        match frame.signature {
            REQUEST_SIGNATURE => self.handle_request(via, frame).await,
            RESPONSE_SIGNATURE => {
                self.handle_response(frame);
                Ok(())
            }
            other => Err(RpcError::Malformed(format!("unknown signature {other}"))),
        }
    }

    async fn handle_request(&self, via: &dyn StreamNode, frame: RpcFrame) -> Result<(), RpcError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&frame.ty)
            .cloned();

        let Some(handler) = handler else {
            error!(ty = frame.ty, id = frame.id, "rpc request for unregistered type");
            return Err(RpcError::UnregisteredType(frame.ty));
        };

        let body = match handler(frame.body).await {
            Ok(body) => body,
            Err(e) => {
                warn!(ty = frame.ty, id = frame.id, error = %e, "rpc handler failed, not answering");
                return Err(e);
            }
        };

        let response = RpcFrame {
            signature: RESPONSE_SIGNATURE,
            ty: frame.ty,
            id: frame.id,
            body,
        };
        via.send(response.encode()).await?;
        Ok(())
    }

    fn handle_response(&self, frame: RpcFrame) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&frame.id);
        match waiter {
            Some(tx) => {
                trace!(ty = frame.ty, id = frame.id, "rpc response");
                let _ = tx.send(frame.body);
            }
            None => trace!(ty = frame.ty, id = frame.id, "dropping response nobody waits for"),
        }
    }
}

/// Removes the pending entry however `make_rpc` ends.
struct PendingGuard<'a> {
    base: &'a RpcBase,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.base
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::peer_id::PeerId;
    use crate::stream::testing::connected_pair;
    use crate::stream::{attach, StreamLinks, StreamRef};
    use async_trait::async_trait;

    /// Leaf whose whole job is running an [`RpcBase`].
    pub(crate) struct RpcLeaf {
        links: StreamLinks,
        pub(crate) rpc: RpcBase,
    }

    impl RpcLeaf {
        pub(crate) fn new(rpc: RpcBase) -> Arc<Self> {
            Arc::new(Self {
                links: StreamLinks::leaf(),
                rpc,
            })
        }

        pub(crate) async fn call(&self, ty: u8, body: &[u8], timeout: Duration) -> Result<Vec<u8>, RpcError> {
            self.rpc.make_rpc(self, ty, body.to_vec(), timeout).await
        }
    }

    #[async_trait]
    impl StreamNode for RpcLeaf {
        fn links(&self) -> &StreamLinks {
            &self.links
        }

        async fn receive(&self, message: Vec<u8>) -> Result<(), StreamError> {
            self.rpc
                .receive(self, message)
                .await
                .map_err(|e| StreamError::Protocol(e.to_string()))
        }
    }

    fn wired_pair(left: RpcBase, right: RpcBase) -> (StreamRef, StreamRef, Arc<RpcLeaf>, Arc<RpcLeaf>) {
        let (l_root, r_root) = connected_pair(PeerId::random(), PeerId::random());
        let l = RpcLeaf::new(left);
        let r = RpcLeaf::new(right);
        attach(&l_root, l.clone()).unwrap();
        attach(&r_root, r.clone()).unwrap();
        (l_root, r_root, l, r)
    }

    fn echo_upper() -> RpcBase {
        let base = RpcBase::new();
        base.on_request(7, |body: Vec<u8>| async move { Ok(body.to_ascii_uppercase()) });
        base
    }

    #[test]
    fn frame_layout_is_big_endian() {
        let frame = RpcFrame {
            signature: RESPONSE_SIGNATURE,
            ty: 3,
            id: 0x0102_0304,
            body: vec![9, 9],
        };
        assert_eq!(frame.encode(), vec![1, 3, 1, 2, 3, 4, 9, 9]);
        assert_eq!(RpcFrame::decode(frame.encode()).unwrap(), frame);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(matches!(RpcFrame::decode(vec![0, 1, 2]), Err(RpcError::Malformed(_))));
    }

    #[tokio::test]
    async fn round_trip() {
        let (_l, _r, left, _right) = wired_pair(RpcBase::new(), echo_upper());
        let response = left.call(7, b"hello", DEFAULT_RPC_TIMEOUT).await.unwrap();
        assert_eq!(response, b"HELLO");
        assert_eq!(left.rpc.pending_requests(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_do_not_cross() {
        let (_l, _r, left, _right) = wired_pair(RpcBase::new(), echo_upper());
        let first = left.call(7, b"one", DEFAULT_RPC_TIMEOUT).await.unwrap();
        let second = left.call(7, b"two", DEFAULT_RPC_TIMEOUT).await.unwrap();
        assert_eq!(first, b"ONE");
        assert_eq!(second, b"TWO");
    }

    #[tokio::test]
    async fn reordered_responses_reach_their_callers() {
        let slow_first = RpcBase::new();
        slow_first.on_request(1, |body: Vec<u8>| async move {
            let delay = if body == b"slow" { 80 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(body)
        });
        let (_l, _r, left, _right) = wired_pair(RpcBase::new(), slow_first);

        let (slow, fast) = tokio::join!(
            left.call(1, b"slow", DEFAULT_RPC_TIMEOUT),
            left.call(1, b"fast", DEFAULT_RPC_TIMEOUT),
        );
        assert_eq!(slow.unwrap(), b"slow");
        assert_eq!(fast.unwrap(), b"fast");
    }

    #[tokio::test]
    async fn timeout_discards_pending_entry() {
        let stalling = RpcBase::new();
        stalling.on_request(2, |_body: Vec<u8>| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        });
        let (_l, _r, left, _right) = wired_pair(RpcBase::new(), stalling);

        let err = left.call(2, b"", Duration::from_millis(30)).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(left.rpc.pending_requests(), 0);
    }

    #[tokio::test]
    async fn unregistered_type_fails_loudly() {
        let (_l, _r, _left, right) = wired_pair(RpcBase::new(), RpcBase::new());
        let request = RpcFrame {
            signature: REQUEST_SIGNATURE,
            ty: 42,
            id: 0,
            body: Vec::new(),
        };
        let err = right.rpc.receive(right.as_ref(), request.encode()).await.unwrap_err();
        assert!(matches!(err, RpcError::UnregisteredType(42)));
    }

    #[tokio::test]
    async fn unknown_response_is_ignored() {
        let (_l, _r, left, _right) = wired_pair(RpcBase::new(), RpcBase::new());
        let stray = RpcFrame {
            signature: RESPONSE_SIGNATURE,
            ty: 0,
            id: 99,
            body: vec![1],
        };
        assert!(left.rpc.receive(left.as_ref(), stray.encode()).await.is_ok());
    }

    #[tokio::test]
    async fn request_ids_wrap() {
        let (_l, _r, left, _right) = wired_pair(RpcBase::starting_at(u32::MAX), echo_upper());
        assert_eq!(left.call(7, b"a", DEFAULT_RPC_TIMEOUT).await.unwrap(), b"A");
        assert_eq!(left.call(7, b"b", DEFAULT_RPC_TIMEOUT).await.unwrap(), b"B");
        assert_eq!(left.rpc.next_id.load(Ordering::Relaxed), 1);
    }
}
