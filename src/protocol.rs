//! # Protocol Router
//!
//! Lets several extensions share one connection. Each registered protocol
//! gets its own sub-chain; outgoing payloads are tagged with the protocol
//! they belong to and incoming payloads are routed by that tag.
//!
//! ## Wire Format
//!
//! ```text
//! [name_len: u8][name: name_len bytes, utf-8][major: u16 BE][minor: u16 BE][revision: u16 BE][payload ...]
//! ```
//!
//! ## Compatibility
//!
//! An incoming tag is accepted by the local protocol with the same name when
//! `local.least_supported_version <= tag.version <= local.version`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::extension::ExtensionNode;
use crate::stream::{adopt, attach, StreamError, StreamLinks, StreamNode, StreamRef};
use crate::transport::TransportManager;

const VERSION_BYTES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16, revision: u16) -> Self {
        Self { major, minor, revision }
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.revision).cmp(&(other.major, other.minor, other.revision))
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolDescriptor {
    name: String,
    version: ProtocolVersion,
    least_supported_version: ProtocolVersion,
}

impl ProtocolDescriptor {
    /// Supports only `version` itself.
    pub fn new(name: impl Into<String>, version: ProtocolVersion) -> Self {
        Self {
            name: name.into(),
            version,
            least_supported_version: version,
        }
    }

    pub fn with_least_supported(mut self, least: ProtocolVersion) -> Self {
        self.least_supported_version = least;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn least_supported_version(&self) -> ProtocolVersion {
        self.least_supported_version
    }

    /// Whether a peer speaking `self` can be served by `current`.
    pub fn compatible_with(&self, current: &ProtocolDescriptor) -> bool {
        self.name == current.name
            && current.least_supported_version <= self.version
            && self.version <= current.version
    }

    pub fn encode_header(&self) -> Result<Vec<u8>, StreamError> {
        let name = self.name.as_bytes();
        let len = u8::try_from(name.len())
            .map_err(|_| StreamError::Protocol(format!("protocol name {:?} is too long", self.name)))?;
        let mut out = Vec::with_capacity(1 + name.len() + VERSION_BYTES);
        out.push(len);
        out.extend_from_slice(name);
        out.extend_from_slice(&self.version.major.to_be_bytes());
        out.extend_from_slice(&self.version.minor.to_be_bytes());
        out.extend_from_slice(&self.version.revision.to_be_bytes());
        Ok(out)
    }

    /// Parses a header, returning the tag and the header length.
    pub fn decode_header(bytes: &[u8]) -> Result<(ProtocolDescriptor, usize), StreamError> {
        let truncated = || StreamError::Protocol("truncated protocol header".to_string());
        let name_len = *bytes.first().ok_or_else(truncated)? as usize;
        let header_len = 1 + name_len + VERSION_BYTES;
        if bytes.len() < header_len {
            return Err(truncated());
        }
        let name = std::str::from_utf8(&bytes[1..1 + name_len])
            .map_err(|_| StreamError::Protocol("protocol name is not utf-8".to_string()))?;
        let v = &bytes[1 + name_len..header_len];
        let version = ProtocolVersion::new(
            u16::from_be_bytes([v[0], v[1]]),
            u16::from_be_bytes([v[2], v[3]]),
            u16::from_be_bytes([v[4], v[5]]),
        );
        Ok((ProtocolDescriptor::new(name, version), header_len))
    }
}

impl fmt::Display for ProtocolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

// ============================================================================
// Extension
// ============================================================================

struct Route {
    descriptor: ProtocolDescriptor,
    header: Vec<u8>,
    extension: Arc<dyn ExtensionNode>,
}

#[derive(Default)]
pub struct ProtocolRouterExtension {
    routes: Vec<Route>,
}

impl ProtocolRouterExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(
        mut self,
        descriptor: ProtocolDescriptor,
        extension: Arc<dyn ExtensionNode>,
    ) -> Result<Self, StreamError> {
        if self.routes.iter().any(|r| r.descriptor.name == descriptor.name) {
            return Err(StreamError::Protocol(format!("protocol {} registered twice", descriptor.name)));
        }
        let header = descriptor.encode_header()?;
        self.routes.push(Route {
            descriptor,
            header,
            extension,
        });
        Ok(self)
    }
}

#[async_trait]
impl ExtensionNode for ProtocolRouterExtension {
    async fn init(&self, manager: &Arc<TransportManager>) -> anyhow::Result<()> {
        for route in &self.routes {
            route.extension.init(manager).await?;
        }
        Ok(())
    }

    async fn extend_stream(&self, node: &StreamRef) -> Result<(), StreamError> {
        let slots = self
            .routes
            .iter()
            .map(|route| {
                Arc::new(ProtocolSlot {
                    links: StreamLinks::list(),
                    descriptor: route.descriptor.clone(),
                    header: route.header.clone(),
                })
            })
            .collect();
        let router = Arc::new(ProtocolRouterStream {
            links: StreamLinks::leaf(),
            slots,
        });

        let router_ref: StreamRef = router.clone();
        attach(node, router_ref.clone())?;
        for (route, slot) in self.routes.iter().zip(&router.slots) {
            let slot_ref: StreamRef = slot.clone();
            adopt(&router_ref, &slot_ref);
            route.extension.extend_stream(&slot_ref).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Streams
// ============================================================================

/// Per-connection router. Owns one slot per registered protocol.
pub struct ProtocolRouterStream {
    links: StreamLinks,
    slots: Vec<Arc<ProtocolSlot>>,
}

#[async_trait]
impl StreamNode for ProtocolRouterStream {
    fn links(&self) -> &StreamLinks {
        &self.links
    }

    async fn receive(&self, message: Vec<u8>) -> Result<(), StreamError> {
        let (tag, header_len) = ProtocolDescriptor::decode_header(&message)?;
        let Some(slot) = self.slots.iter().find(|s| tag.compatible_with(&s.descriptor)) else {
            warn!(protocol = %tag, "dropping frame for unsupported protocol");
            return Err(StreamError::Protocol(format!("unsupported protocol {tag}")));
        };
        slot.receive(message[header_len..].to_vec()).await
    }

    async fn perform_handshake(&self) -> Result<(), StreamError> {
        self.links.set_opened(true);
        for slot in &self.slots {
            slot.perform_handshake().await?;
        }
        Ok(())
    }

    async fn perform_closure(&self) -> Result<(), StreamError> {
        let mut first_error = None;
        for slot in &self.slots {
            if let Err(e) = slot.perform_closure().await {
                debug!(protocol = %slot.descriptor, error = %e, "protocol closure failed");
                first_error.get_or_insert(e);
            }
        }
        self.links.set_opened(false);
        first_error.map_or(Ok(()), Err)
    }
}

/// Entry point of one protocol's sub-chain. Tags what it sends.
pub struct ProtocolSlot {
    links: StreamLinks,
    descriptor: ProtocolDescriptor,
    header: Vec<u8>,
}

#[async_trait]
impl StreamNode for ProtocolSlot {
    fn links(&self) -> &StreamLinks {
        &self.links
    }

    async fn send(&self, message: Vec<u8>) -> Result<(), StreamError> {
        let mut tagged = Vec::with_capacity(self.header.len() + message.len());
        tagged.extend_from_slice(&self.header);
        tagged.extend_from_slice(&message);
        self.links.parent()?.send(tagged).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StreamToChannelAdapter;
    use crate::peer_id::PeerId;
    use crate::stream::testing::connected_pair;
    use std::sync::Mutex;

    /// Attaches an adapter and remembers it.
    #[derive(Default)]
    struct Capture {
        adapters: Mutex<Vec<Arc<StreamToChannelAdapter>>>,
    }

    impl Capture {
        fn last(&self) -> Arc<StreamToChannelAdapter> {
            self.adapters.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ExtensionNode for Capture {
        async fn extend_stream(&self, node: &StreamRef) -> Result<(), StreamError> {
            let adapter = StreamToChannelAdapter::new(4);
            attach(node, adapter.clone())?;
            self.adapters.lock().unwrap().push(adapter);
            Ok(())
        }
    }

    fn v(major: u16, minor: u16, revision: u16) -> ProtocolVersion {
        ProtocolVersion::new(major, minor, revision)
    }

    #[test]
    fn versions_order_lexicographically() {
        assert!(v(1, 0, 0) < v(1, 0, 1));
        assert!(v(1, 9, 9) < v(2, 0, 0));
        assert!(v(0, 2, 0) > v(0, 1, 7));
    }

    #[test]
    fn compatibility_window() {
        let current = ProtocolDescriptor::new("KadDHT", v(1, 2, 0)).with_least_supported(v(1, 0, 0));
        assert!(ProtocolDescriptor::new("KadDHT", v(1, 0, 0)).compatible_with(&current));
        assert!(ProtocolDescriptor::new("KadDHT", v(1, 2, 0)).compatible_with(&current));
        assert!(!ProtocolDescriptor::new("KadDHT", v(1, 3, 0)).compatible_with(&current));
        assert!(!ProtocolDescriptor::new("KadDHT", v(0, 9, 0)).compatible_with(&current));
        assert!(!ProtocolDescriptor::new("TCPHole", v(1, 0, 0)).compatible_with(&current));
    }

    #[test]
    fn header_round_trip() {
        let descriptor = ProtocolDescriptor::new("TCPHole", v(1, 0, 3));
        let mut bytes = descriptor.encode_header().unwrap();
        assert_eq!(bytes[0], 7);
        bytes.extend_from_slice(b"body");
        let (decoded, len) = ProtocolDescriptor::decode_header(&bytes).unwrap();
        assert_eq!(decoded, descriptor);
        assert_eq!(&bytes[len..], b"body");
        assert!(ProtocolDescriptor::decode_header(&bytes[..5]).is_err());
    }

    #[test]
    fn long_names_are_refused() {
        let descriptor = ProtocolDescriptor::new("x".repeat(300), v(1, 0, 0));
        assert!(ProtocolRouterExtension::new()
            .with_protocol(descriptor, Arc::new(Capture::default()))
            .is_err());
    }

    #[tokio::test]
    async fn frames_reach_the_matching_protocol() {
        let alpha = Arc::new(Capture::default());
        let beta = Arc::new(Capture::default());
        let router = ProtocolRouterExtension::new()
            .with_protocol(ProtocolDescriptor::new("alpha", v(1, 0, 0)), alpha.clone())
            .unwrap()
            .with_protocol(ProtocolDescriptor::new("beta", v(1, 0, 0)), beta.clone())
            .unwrap();

        let (left, right) = connected_pair(PeerId::random(), PeerId::random());
        router.extend_stream(&left).await.unwrap();
        let (left_alpha, left_beta) = (alpha.last(), beta.last());
        router.extend_stream(&right).await.unwrap();
        let (right_alpha, right_beta) = (alpha.last(), beta.last());

        left_alpha.send(b"to alpha".to_vec()).await.unwrap();
        left_beta.send(b"to beta".to_vec()).await.unwrap();
        right_beta.send(b"back".to_vec()).await.unwrap();

        assert_eq!(right_alpha.next_received().await.unwrap(), b"to alpha");
        assert_eq!(right_beta.next_received().await.unwrap(), b"to beta");
        assert_eq!(left_beta.next_received().await.unwrap(), b"back");
        assert_eq!(left_alpha.remote_peer_id().unwrap(), right_alpha.this_peer_id().unwrap());
    }

    #[tokio::test]
    async fn unknown_protocol_is_a_protocol_error() {
        let router = ProtocolRouterExtension::new()
            .with_protocol(ProtocolDescriptor::new("alpha", v(1, 0, 0)), Arc::new(Capture::default()))
            .unwrap();
        let (left, _right) = connected_pair(PeerId::random(), PeerId::random());
        router.extend_stream(&left).await.unwrap();

        let mut frame = ProtocolDescriptor::new("alpha", v(2, 0, 0)).encode_header().unwrap();
        frame.push(1);
        let err = left.receive(frame).await.unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));
    }
}
