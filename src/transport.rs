//! # Transports
//!
//! A [`Transport`] turns endpoints into connected stream chains. The
//! [`TransportManager`] is the single registry of transports for one local
//! identity and the owner of the root [`ExtensionNode`] every new
//! connection is extended with.
//!
//! ## Registration
//!
//! ```text
//! register_transport(t)
//!   t.bind(peer id, runtime, extension)   identity + scheduling context
//!   t.init()                              binds sockets, starts accepting
//!   transports[t.name] = t
//! ```
//!
//! ## Selection
//!
//! Transports advertise [`TransportTrait`]s. Callers pick one with a
//! [`TraitFilter`] such as `TraitFilter::reliable() & TraitFilter::supports(ep)`.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{BitAnd, BitOr, Not};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::extension::{ExtensionLeafNode, ExtensionNode};
use crate::peer_id::PeerId;
use crate::stream::StreamRef;

// ============================================================================
// Descriptors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportTrait {
    Fast,
    Reliable,
    EnergyEfficient,
    /// The transport can test endpoints with [`Transport::supports`].
    Supports,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportDescriptor {
    name: String,
    traits: BTreeSet<TransportTrait>,
}

impl TransportDescriptor {
    pub fn new(name: impl Into<String>, traits: impl IntoIterator<Item = TransportTrait>) -> Self {
        Self {
            name: name.into(),
            traits: traits.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn traits(&self) -> impl Iterator<Item = TransportTrait> + '_ {
        self.traits.iter().copied()
    }

    pub fn has(&self, t: TransportTrait) -> bool {
        self.traits.contains(&t)
    }
}

/// Predicate over transports, composed with `&`, `|` and `!`.
#[derive(Debug, Clone)]
pub enum TraitFilter {
    Has(TransportTrait),
    Supports(Endpoint),
    And(Box<TraitFilter>, Box<TraitFilter>),
    Or(Box<TraitFilter>, Box<TraitFilter>),
    Not(Box<TraitFilter>),
}

impl TraitFilter {
    pub fn fast() -> Self {
        Self::Has(TransportTrait::Fast)
    }

    pub fn reliable() -> Self {
        Self::Has(TransportTrait::Reliable)
    }

    pub fn energy_efficient() -> Self {
        Self::Has(TransportTrait::EnergyEfficient)
    }

    pub fn supports(endpoint: Endpoint) -> Self {
        Self::Supports(endpoint)
    }

    pub fn test(&self, transport: &dyn Transport) -> bool {
        match self {
            Self::Has(t) => transport.descriptor().has(*t),
            Self::Supports(endpoint) => {
                transport.descriptor().has(TransportTrait::Supports) && transport.supports(endpoint)
            }
            Self::And(a, b) => a.test(transport) && b.test(transport),
            Self::Or(a, b) => a.test(transport) || b.test(transport),
            Self::Not(a) => !a.test(transport),
        }
    }
}

impl BitAnd for TraitFilter {
    type Output = TraitFilter;

    fn bitand(self, rhs: TraitFilter) -> TraitFilter {
        TraitFilter::And(Box::new(self), Box::new(rhs))
    }
}

impl BitOr for TraitFilter {
    type Output = TraitFilter;

    fn bitor(self, rhs: TraitFilter) -> TraitFilter {
        TraitFilter::Or(Box::new(self), Box::new(rhs))
    }
}

impl Not for TraitFilter {
    type Output = TraitFilter;

    fn not(self) -> TraitFilter {
        TraitFilter::Not(Box::new(self))
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection to {endpoint} failed: {source}")]
    ConnectionFailed {
        endpoint: Endpoint,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("no transport supports {0}")]
    UnsupportedEndpoint(Endpoint),
    #[error("transport {0} is not initialized")]
    NotInitialized(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConnectionError {
    pub fn failed(
        endpoint: &Endpoint,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.clone(),
            source: source.into(),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Context handed to a transport when it is registered.
#[derive(Clone)]
pub struct TransportBinding {
    pub peer_id: PeerId,
    pub runtime: Handle,
    pub extension: Arc<dyn ExtensionNode>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn descriptor(&self) -> TransportDescriptor;

    fn supports(&self, endpoint: &Endpoint) -> bool;

    /// Stores identity, scheduling context and the extension chain. Called
    /// once, before [`init`](Self::init).
    fn bind(&self, binding: TransportBinding);

    /// Replaces the extension applied to connections opened from now on.
    fn set_extension(&self, extension: Arc<dyn ExtensionNode>);

    async fn init(&self) -> Result<(), ConnectionError>;

    /// Opens a connection and returns the root of its chain once the
    /// identity exchange is done.
    async fn connect(&self, endpoint: &Endpoint) -> Result<StreamRef, ConnectionError>;
}

// ============================================================================
// TransportManager
// ============================================================================

pub struct TransportManager {
    peer_id: PeerId,
    runtime: Handle,
    transports: RwLock<BTreeMap<String, Arc<dyn Transport>>>,
    extension: RwLock<Arc<dyn ExtensionNode>>,
}

impl TransportManager {
    /// Uses the ambient tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn new(peer_id: PeerId) -> Arc<Self> {
        Self::with_runtime(peer_id, Handle::current())
    }

    pub fn with_runtime(peer_id: PeerId, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            runtime,
            transports: RwLock::new(BTreeMap::new()),
            extension: RwLock::new(Arc::new(ExtensionLeafNode)),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn extension(&self) -> Arc<dyn ExtensionNode> {
        self.extension
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs the root extension on every registered transport and runs its
    /// `init` against this manager.
    pub async fn set_extension(self: &Arc<Self>, extension: Arc<dyn ExtensionNode>) -> anyhow::Result<()> {
        *self.extension.write().unwrap_or_else(PoisonError::into_inner) = extension.clone();
        for transport in self.transports() {
            transport.set_extension(extension.clone());
        }
        extension.init(self).await
    }

    pub async fn register_transport(&self, transport: Arc<dyn Transport>) -> Result<(), ConnectionError> {
        let descriptor = transport.descriptor();
        transport.bind(TransportBinding {
            peer_id: self.peer_id,
            runtime: self.runtime.clone(),
            extension: self.extension(),
        });
        transport.init().await?;

        let previous = self
            .transports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.name().to_string(), transport);
        if previous.is_some() {
            warn!(transport = descriptor.name(), "replaced registered transport");
        }
        info!(transport = descriptor.name(), peer = %self.peer_id.short(), "transport registered");
        Ok(())
    }

    pub fn transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn transports_matching(&self, filter: &TraitFilter) -> Vec<Arc<dyn Transport>> {
        self.transports()
            .into_iter()
            .filter(|t| filter.test(t.as_ref()))
            .collect()
    }

    /// Connects through the first transport that supports `endpoint`.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<StreamRef, ConnectionError> {
        let filter = TraitFilter::supports(endpoint.clone());
        let Some(transport) = self.transports_matching(&filter).into_iter().next() else {
            return Err(ConnectionError::UnsupportedEndpoint(endpoint.clone()));
        };
        debug!(transport = transport.descriptor().name(), %endpoint, "connecting");
        transport.connect(endpoint).await
    }
}
