//! # Peer Identifiers
//!
//! A [`PeerId`] is a fixed 256-bit identifier. It names a node and is also a
//! point in the Kademlia XOR metric space, so every routing decision in the
//! overlay is expressed through the operations defined here.
//!
//! ## Metric
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | `xor(a, b)` | distance between `a` and `b` as a 256-bit unsigned integer |
//! | `lcp(a, b)` | leading zero bits of `a ^ b` (0..=256) |
//! | `self.xor_cmp(a, b)` | orders `a` and `b` by distance to `self` |
//!
//! Identifiers are self-asserted. Nothing here authenticates a peer.

use std::cmp::Ordering;
use std::ops::{BitAnd, BitOr, BitXor, Not};

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Width of a [`PeerId`] in bytes.
pub const PEER_ID_BYTES: usize = 32;

/// Width of a [`PeerId`] in bits. Also the number of k-buckets a fully
/// split routing table can hold.
pub const PEER_ID_BITS: usize = PEER_ID_BYTES * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdError {
    #[error("peer id must be 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("peer id is not valid hex")]
    InvalidHex,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_BYTES]);

impl PeerId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Builds an id from an untrusted buffer. The buffer must be exactly
    /// [`PEER_ID_BYTES`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let arr: [u8; PEER_ID_BYTES] = bytes
            .try_into()
            .map_err(|_| PeerIdError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Derives a stable id from arbitrary seed material (BLAKE3).
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(*blake3::hash(seed).as_bytes())
    }

    pub const fn zeroes() -> Self {
        Self([0u8; PEER_ID_BYTES])
    }

    pub const fn max() -> Self {
        Self([0xFFu8; PEER_ID_BYTES])
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }

    #[inline]
    pub fn xor(&self, other: &PeerId) -> PeerId {
        self.zip_with(other, |a, b| a ^ b)
    }

    #[inline]
    pub fn and(&self, other: &PeerId) -> PeerId {
        self.zip_with(other, |a, b| a & b)
    }

    #[inline]
    pub fn or(&self, other: &PeerId) -> PeerId {
        self.zip_with(other, |a, b| a | b)
    }

    #[inline]
    pub fn inv(&self) -> PeerId {
        let mut out = self.0;
        out.iter_mut().for_each(|b| *b = !*b);
        PeerId(out)
    }

    fn zip_with(&self, other: &PeerId, op: impl Fn(u8, u8) -> u8) -> PeerId {
        let mut out = [0u8; PEER_ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = op(self.0[i], other.0[i]);
        }
        PeerId(out)
    }

    /// Tests bit `pos`, most significant bit first within each byte.
    ///
    /// # Panics
    /// Panics if `pos >= PEER_ID_BITS`.
    #[inline]
    pub fn bit_at(&self, pos: usize) -> bool {
        let byte = self.0[pos / 8];
        (byte >> (7 - pos % 8)) & 1 == 1
    }

    /// Compares `a` and `b` by their XOR distance to `self`.
    ///
    /// Only the first byte where `a` and `b` differ matters: the id whose
    /// byte agrees more with `self` there is the closer one.
    pub fn xor_cmp(&self, a: &PeerId, b: &PeerId) -> Ordering {
        match (0..PEER_ID_BYTES).find(|&i| a.0[i] != b.0[i]) {
            Some(i) => (a.0[i] ^ self.0[i]).cmp(&(b.0[i] ^ self.0[i])),
            None => Ordering::Equal,
        }
    }

    /// Length of the common prefix of `self` and `other`, in bits.
    #[inline]
    pub fn lcp(&self, other: &PeerId) -> usize {
        self.xor(other).count_leading_zero_bits()
    }

    pub fn count_leading_zero_bits(&self) -> usize {
        let mut zeros = 0usize;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, PeerIdError> {
        let bytes = hex::decode(s).map_err(|_| PeerIdError::InvalidHex)?;
        Self::from_slice(&bytes)
    }

    /// First eight bytes in hex, used as the peer field in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Binary rendering, one space-separated group per byte.
    pub fn to_string_bin(&self) -> String {
        self.0
            .iter()
            .map(|b| format!("{b:08b}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; PEER_ID_BYTES]> for PeerId {
    fn from(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = PeerIdError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl BitXor for PeerId {
    type Output = PeerId;

    fn bitxor(self, rhs: PeerId) -> PeerId {
        self.xor(&rhs)
    }
}

impl BitAnd for PeerId {
    type Output = PeerId;

    fn bitand(self, rhs: PeerId) -> PeerId {
        self.and(&rhs)
    }
}

impl BitOr for PeerId {
    type Output = PeerId;

    fn bitor(self, rhs: PeerId) -> PeerId {
        self.or(&rhs)
    }
}

impl Not for PeerId {
    type Output = PeerId;

    fn not(self) -> PeerId {
        self.inv()
    }
}
