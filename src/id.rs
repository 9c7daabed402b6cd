//! # Overlay Identifiers
//!
//! This module defines the two identifier types of the overlay:
//!
//! - [`NodeId`]: a 160-bit unsigned integer naming a node in the keyspace.
//!   Ids are uniformly random, interpreted as big-endian numerals on a
//!   wrap-around ring of size 2^160, and carved into base-2^b digits for
//!   prefix routing.
//! - [`OverlayId`]: the opaque application-chosen byte string naming the
//!   network. Nodes with different overlay ids refuse to peer.
//!
//! A fixed-size byte array with bit-level helpers stands in for an
//! arbitrary-precision integer; every operation the routing engine needs
//! (ordering, modular subtraction, ring distance, digit extraction, common
//! prefix length) is O(width).

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Width of a node identifier in bytes.
pub const ID_BYTES: usize = 20;

/// Width of a node identifier in bits.
pub const ID_BITS: usize = ID_BYTES * 8;

/// A 160-bit node identifier in the keyspace `[0, 2^160)`.
///
/// The derived `Ord` over the big-endian byte array is exactly numeric
/// order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; ID_BYTES]);

    /// The ring antipode of zero; ids at most this far clockwise from a
    /// point sit on its "larger" side.
    pub(crate) const HALF: NodeId = {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = 0x80;
        NodeId(bytes)
    };

    /// Draws a uniformly random identifier.
    pub fn random() -> NodeId {
        let mut bytes = [0u8; ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> NodeId {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// `self - other` modulo 2^160: the clockwise arc from `other` to
    /// `self`.
    pub fn sub_mod(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        let mut borrow = 0i16;
        for i in (0..ID_BYTES).rev() {
            let diff = self.0[i] as i16 - other.0[i] as i16 - borrow;
            if diff < 0 {
                out[i] = (diff + 256) as u8;
                borrow = 1;
            } else {
                out[i] = diff as u8;
                borrow = 0;
            }
        }
        NodeId(out)
    }

    /// Shorter of the two arcs between `self` and `other` on the ring.
    pub fn ring_distance(&self, other: &NodeId) -> NodeId {
        let cw = self.sub_mod(other);
        let ccw = other.sub_mod(self);
        if cw <= ccw { cw } else { ccw }
    }

    /// Extracts the `index`-th base-2^`bits` digit, most significant first.
    ///
    /// `bits` must be 1, 2, 4, or 8 so digits pack evenly into bytes.
    pub fn digit(&self, index: usize, bits: u8) -> u8 {
        debug_assert!(matches!(bits, 1 | 2 | 4 | 8));
        let per_byte = (8 / bits) as usize;
        let byte = self.0[index / per_byte];
        let shift = 8 - bits * ((index % per_byte) as u8 + 1);
        (byte >> shift) & ((1u16 << bits) - 1) as u8
    }

    /// Number of leading base-2^`bits` digits shared with `other`.
    pub fn common_prefix(&self, other: &NodeId, bits: u8) -> usize {
        let digits = ID_BITS / bits as usize;
        for i in 0..digits {
            if self.digit(i, bits) != other.digit(i, bits) {
                return i;
            }
        }
        digits
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", &hex::encode(self.0)[..8])
    }
}

/// Opaque application identifier naming an overlay network.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlayId(Vec<u8>);

impl OverlayId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> OverlayId {
        OverlayId(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Fixed-width digest carried in discovery beacons so arbitrarily long
    /// overlay names fit a single datagram.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(&self.0).into()
    }
}

impl From<&str> for OverlayId {
    fn from(s: &str) -> OverlayId {
        OverlayId(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "OverlayId({:?})", s),
            Err(_) => write!(f, "OverlayId(0x{})", hex::encode(&self.0)),
        }
    }
}
