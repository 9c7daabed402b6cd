//! Immutable node configuration.
//!
//! One [`OverlayConfig`] value is handed to the node at construction and
//! never mutated; tests that need different knobs build a fresh node with a
//! fresh config rather than poking shared state.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::id::ID_BITS;

/// Tunables of a single overlay node.
#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// Leaf set capacity `l`, split evenly across both ring sides.
    pub leaf_set_size: usize,
    /// Neighborhood set capacity.
    pub neighborhood_size: usize,
    /// Routing digit width `b` in bits; ids have `160 / b` digits.
    pub digit_bits: u8,
    /// How long to wait for the remote init packet on a fresh session.
    pub init_timeout: Duration,
    /// Period of the leaf-set repair state exchange.
    pub exchange_period: Duration,
    /// Period of the discovery beacon on each interface.
    pub beacon_interval: Duration,
    /// Upper bound on a single session frame's ciphertext length.
    pub max_frame: usize,
    /// Well-known UDP ports probed by the discovery beacon; each interface
    /// binds the first free one.
    pub probe_ports: Vec<u16>,
    /// Interfaces the node listens on.
    pub bind_ips: Vec<IpAddr>,
    /// Capacity of the per-peer and node-wide message queues.
    pub queue_depth: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            leaf_set_size: 16,
            neighborhood_size: 16,
            digit_bits: 4,
            init_timeout: Duration::from_secs(3),
            exchange_period: Duration::from_secs(30),
            beacon_interval: Duration::from_secs(1),
            max_frame: 16 * 1024 * 1024,
            probe_ports: (33810..33818).collect(),
            bind_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            queue_depth: 64,
        }
    }
}

impl OverlayConfig {
    /// Number of digits in a node id under this digit width.
    pub fn digits(&self) -> usize {
        ID_BITS / self.digit_bits as usize
    }

    /// Number of columns in the prefix table (2^b).
    pub fn columns(&self) -> usize {
        1 << self.digit_bits
    }
}
