//! # Extensions
//!
//! One [`ExtensionNode`] exists per protocol feature for the whole process.
//! Its job is to insert that feature's [`StreamNode`](crate::stream::StreamNode)
//! into every fresh connection chain handed to it by a transport.
//!
//! Extensions are composed once at startup and never torn down.

use std::sync::Arc;

use async_trait::async_trait;

use crate::stream::{attach, StreamError, StreamListNode, StreamRef};
use crate::transport::TransportManager;

#[async_trait]
pub trait ExtensionNode: Send + Sync + 'static {
    /// Called once when the extension is installed on a manager.
    async fn init(&self, _manager: &Arc<TransportManager>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Inserts this feature's stream node below `node`.
    async fn extend_stream(&self, node: &StreamRef) -> Result<(), StreamError>;
}

/// Extension that adds nothing. Connections end at their root.
pub struct ExtensionLeafNode;

#[async_trait]
impl ExtensionNode for ExtensionLeafNode {
    async fn extend_stream(&self, _node: &StreamRef) -> Result<(), StreamError> {
        Ok(())
    }
}

/// Inserts a pass-through node and lets a nested extension extend it.
pub struct ExtensionListNode {
    child: Arc<dyn ExtensionNode>,
}

impl ExtensionListNode {
    pub fn new(child: Arc<dyn ExtensionNode>) -> Self {
        Self { child }
    }
}

#[async_trait]
impl ExtensionNode for ExtensionListNode {
    async fn init(&self, manager: &Arc<TransportManager>) -> anyhow::Result<()> {
        self.child.init(manager).await
    }

    async fn extend_stream(&self, node: &StreamRef) -> Result<(), StreamError> {
        let list: StreamRef = Arc::new(StreamListNode::new());
        attach(node, list.clone())?;
        self.child.extend_stream(&list).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_id::PeerId;
    use crate::stream::testing::connected_pair;
    use crate::stream::{StreamLeafNode, StreamNode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct LeafInserter {
        inits: AtomicUsize,
    }

    #[async_trait]
    impl ExtensionNode for LeafInserter {
        async fn init(&self, _manager: &Arc<TransportManager>) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn extend_stream(&self, node: &StreamRef) -> Result<(), StreamError> {
            attach(node, Arc::new(StreamLeafNode::new()))
        }
    }

    #[tokio::test]
    async fn leaf_extension_leaves_the_root_alone() {
        let (root, _other) = connected_pair(PeerId::random(), PeerId::random());
        ExtensionLeafNode.extend_stream(&root).await.unwrap();
        assert!(root.links().child().is_none());
    }

    #[tokio::test]
    async fn list_extension_nests_its_child() {
        let (root, _other) = connected_pair(PeerId::random(), PeerId::random());
        let inner = Arc::new(LeafInserter::default());
        let list = ExtensionListNode::new(inner.clone());

        list.extend_stream(&root).await.unwrap();

        let middle = root.links().child().unwrap();
        let leaf = middle.links().child().unwrap();
        assert!(leaf.links().child().is_none());
        assert_eq!(leaf.remote_peer_id().unwrap(), root.remote_peer_id().unwrap());

        let manager = TransportManager::new(PeerId::random());
        manager.set_extension(Arc::new(list)).await.unwrap();
        assert_eq!(inner.inits.load(Ordering::SeqCst), 1);
    }
}
