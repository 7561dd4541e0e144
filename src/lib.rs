//! # p2beer - Peer-to-Peer Overlay
//!
//! p2beer connects peers into an overlay network built from:
//!
//! - **Identity**: 256-bit [`PeerId`]s compared under the XOR metric
//! - **DHT**: Kademlia-style peer discovery with iterative lookups
//! - **Streams**: every connection is a chain of [`StreamNode`]s, one per
//!   protocol layer, built by a matching chain of [`ExtensionNode`]s
//! - **Transport**: TCP with length-prefixed framing and an identity exchange
//! - **NAT Traversal**: TCP hole punching through a mediator peer
//!
//! ## Architecture
//!
//! - Outbound bytes travel child → parent (`send`); inbound bytes travel
//!   parent → child (`receive`). The root writes to the socket.
//! - Extensions are created once and shared by every connection; streams
//!   are created per connection and live as long as its IO task.
//! - The routing table is owned by an actor; everything else talks to it
//!   through a cheap-to-clone handle.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API wiring the whole stack |
//! | `peer_id` | Peer identities and the XOR metric |
//! | `endpoint` | Transport-agnostic addresses |
//! | `stream` | `StreamNode` chain primitives |
//! | `extension` | `ExtensionNode` chain primitives |
//! | `protocol` | Protocol versioning and per-protocol multiplexing |
//! | `adapter` | Stream to channel bridge |
//! | `rpc` | Request/response correlation over a stream |
//! | `messaging` | Length-prefixed frames |
//! | `transport` | Transport trait, capability filters, `TransportManager` |
//! | `tcp` | TCP transport |
//! | `holepunch` | TCP hole punching |
//! | `routing` | k-bucket routing table |
//! | `dht` | Kademlia DHT |
//! | `protocols` | Protocol trait definitions (`Dht`) |
//! | `messages` | Serialization types for the RPC protocols |

mod adapter;
mod dht;
mod endpoint;
mod extension;
mod holepunch;
mod messages;
mod messaging;
mod node;
mod peer_id;
mod protocol;
mod protocols;
mod routing;
mod rpc;
mod stream;
mod tcp;
mod transport;

pub use adapter::{StreamToChannelAdapter, DEFAULT_CHANNEL_BUFFER};
pub use dht::{kad_dht_protocol, DhtConfig, KadDhtExtension, KadDhtRpc, KadDhtStream, FIND_PEERS, KAD_DHT_PROTOCOL};
pub use endpoint::{Endpoint, EndpointError};
pub use extension::{ExtensionLeafNode, ExtensionListNode, ExtensionNode};
pub use holepunch::{
    hole_punch_protocol, HolePunchConfig, HolePunchError, TcpHolePunchingExtension, TcpHolePunchingStream,
    HOLE_PUNCH_PROTOCOL,
};
pub use messaging::{Message, MessageError, MessageReader, MessageSender, MessageWriter, MAX_MESSAGE_SIZE};
pub use node::{Node, NodeConfig};
pub use peer_id::{PeerId, PeerIdError, PEER_ID_BITS, PEER_ID_BYTES};
pub use protocol::{ProtocolDescriptor, ProtocolRouterExtension, ProtocolRouterStream, ProtocolVersion};
pub use protocols::Dht;
pub use routing::{Peer, RoutingTable, DEFAULT_K};
pub use rpc::{RpcBase, RpcError, RpcFrame, DEFAULT_RPC_TIMEOUT};
pub use stream::{adopt, attach, root_of, StreamError, StreamLeafNode, StreamLinks, StreamListNode, StreamNode, StreamRef};
pub use tcp::{tcp_descriptor, Tcp, TcpStream, TCP_TRANSPORT_NAME};
pub use transport::{
    ConnectionError, TraitFilter, Transport, TransportBinding, TransportDescriptor, TransportManager, TransportTrait,
};
