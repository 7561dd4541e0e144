//! # RPC Message Bodies
//!
//! Serializable bodies carried inside RPC frames. Each extension has its own
//! type-id namespace because each runs its own [`RpcBase`](crate::rpc::RpcBase).
//!
//! | Protocol | Type | Request | Response |
//! |----------|------|---------|----------|
//! | KadDHT | `FIND_PEERS = 0` | [`FindPeersRequest`] | [`FindPeersResponse`] |
//! | TCPHole | `CONNECTION_FIRST_STEP = 0` | [`FirstStepRequest`] | [`FirstStepResponse`] |
//! | TCPHole | `CONNECTION_SECOND_STEP = 1` | [`SecondStepRequest`] | [`SecondStepResponse`] |
//! | TCPHole | `HANDSHAKE = 2` | empty | empty |
//! | TCPHole | `CLOSURE = 3` | empty | empty |
//!
//! All decoding goes through [`deserialize_bounded`], so a hostile length
//! field cannot make us allocate more than [`MAX_DESERIALIZE_SIZE`].

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::peer_id::PeerId;
use crate::routing::Peer;

/// Upper bound for any decoded body. A full `FIND_PEERS` answer is a few KiB.
pub const MAX_DESERIALIZE_SIZE: u64 = 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Kademlia
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindPeersRequest {
    pub target: PeerId,
}

/// Peers the responder knows as nearest to the requested target. Streams are
/// never serialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindPeersResponse {
    pub peers: Vec<Peer>,
}

// ============================================================================
// Hole punching
// ============================================================================

/// Initiator to mediator: "introduce me to `target`, I'll dial from `endpoint`".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirstStepRequest {
    pub target: PeerId,
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirstStepResponse {
    /// The mediator has no stream to the target, or the target refused.
    Unreachable,
    /// Target endpoints, rewritten with the address the mediator observes.
    Candidates { punch: Endpoint, listener: Endpoint },
}

/// Mediator to target: `initiator` is about to dial from `endpoint`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecondStepRequest {
    pub initiator: PeerId,
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondStepResponse {
    pub punch: Endpoint,
    pub listener: Endpoint,
}
