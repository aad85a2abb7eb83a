//! Core protocol types

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Size of a peer ID in bytes (32 bytes / 256 bits)
pub const PEER_ID_SIZE: usize = 32;

/// Number of bits in a peer ID (one routing bucket per bit)
pub const PEER_ID_BITS: usize = PEER_ID_SIZE * 8;

type Blake2b256 = Blake2b<U32>;

/// A unique identifier for a peer in the network
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Create a PeerId from a byte array
    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        PeerId(bytes)
    }

    /// Derive a PeerId from public key material (BLAKE2b-256)
    pub fn from_public_key(key: &[u8]) -> Self {
        let digest = Blake2b256::digest(key);
        let mut bytes = [0u8; PEER_ID_SIZE];
        bytes.copy_from_slice(&digest);
        PeerId(bytes)
    }

    /// Generate a random PeerId
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        PeerId(bytes)
    }

    /// Get the bytes of this PeerId
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| ProtocolError::InvalidPeerId(e.to_string()))?;

        if bytes.len() != PEER_ID_SIZE {
            return Err(ProtocolError::InvalidPeerId(format!(
                "expected {} bytes, got {}",
                PEER_ID_SIZE,
                bytes.len()
            )));
        }

        let mut arr = [0u8; PEER_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(PeerId(arr))
    }

    /// Calculate XOR distance between two peer IDs
    pub fn distance(&self, other: &PeerId) -> Distance {
        let mut result = [0u8; PEER_ID_SIZE];
        for (i, item) in result.iter_mut().enumerate() {
            *item = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    /// Apply an XOR distance to this ID, yielding the ID at that distance
    pub fn xor(&self, distance: &Distance) -> PeerId {
        let mut result = [0u8; PEER_ID_SIZE];
        for (i, item) in result.iter_mut().enumerate() {
            *item = self.0[i] ^ distance.0[i];
        }
        PeerId(result)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// XOR distance between two peer IDs
///
/// Compares as a big-endian unsigned integer of `PEER_ID_BITS` bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Distance([u8; PEER_ID_SIZE]);

impl Distance {
    /// Distance between identical IDs
    pub const ZERO: Distance = Distance([0u8; PEER_ID_SIZE]);

    /// Largest representable distance
    pub const MAX: Distance = Distance([0xff; PEER_ID_SIZE]);

    /// Create a distance from raw bytes
    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Distance(bytes)
    }

    /// Raw bytes of the distance
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Number of leading zero bits
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for byte in self.0.iter() {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    /// Routing bucket for this distance: the position of the highest set bit
    ///
    /// Bucket `i` holds distances in `[2^i, 2^(i+1))`. Returns `None` for a
    /// zero distance.
    pub fn bucket_index(&self) -> Option<usize> {
        let zeros = self.leading_zeros() as usize;
        if zeros == PEER_ID_BITS {
            None
        } else {
            Some(PEER_ID_BITS - 1 - zeros)
        }
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}
