//! # Public Node API
//!
//! This module provides the application-facing entry point. A [`Node`]
//! wraps the overlay core into four calls:
//!
//! ```ignore
//! let node = Node::new(OverlayId::from("my-app"), key, app);
//! node.boot().await?;
//! node.send(dest, msg)?;
//! node.shutdown().await;
//! ```
//!
//! Construction is cheap and infallible: the node draws its random id and
//! builds its channels, but touches no sockets until [`boot`](Node::boot).
//! Messages whose destination resolves to the local node are handed to the
//! [`Application`] callback; everything else is forwarded through the
//! overlay. Delivery order is first-in-first-out per source along a stable
//! path, with no guarantee across sources or route changes.

use std::net::IpAddr;
use std::sync::Arc;

use x25519_dalek::StaticSecret;

use crate::config::OverlayConfig;
use crate::id::{NodeId, OverlayId};
use crate::messages::Message;
use crate::overlay::Overlay;

/// Receiver of locally-delivered messages.
///
/// `deliver` is invoked from the forwarding task; it must not block
/// indefinitely or the node stops routing.
pub trait Application: Send + Sync + 'static {
    fn deliver(&self, msg: Message);
}

/// Failure to bring a node up.
#[derive(Debug)]
pub enum BootError {
    /// A session listener could not bind on this interface.
    Bind { ip: IpAddr, source: std::io::Error },
    /// No discovery probe port was free on this interface.
    Discovery { ip: IpAddr, source: std::io::Error },
    AlreadyBooted,
}

impl std::fmt::Display for BootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootError::Bind { ip, source } => {
                write!(f, "failed to bind session listener on {}: {}", ip, source)
            }
            BootError::Discovery { ip, source } => {
                write!(f, "failed to start discovery on {}: {}", ip, source)
            }
            BootError::AlreadyBooted => write!(f, "node is already booted"),
        }
    }
}

impl std::error::Error for BootError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootError::Bind { source, .. } | BootError::Discovery { source, .. } => Some(source),
            BootError::AlreadyBooted => None,
        }
    }
}

/// Failure to accept a message for routing.
#[derive(Debug)]
pub enum SendError {
    /// The local outbound queue is full; retry later.
    Saturated,
    /// The message does not fit the wire limits.
    Encode(bincode::Error),
    /// The node is shut down.
    Shutdown,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Saturated => write!(f, "outbound queue is saturated"),
            SendError::Encode(err) => write!(f, "message not encodable: {}", err),
            SendError::Shutdown => write!(f, "node is shut down"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Encode(err) => Some(err),
            _ => None,
        }
    }
}

/// One overlay node.
pub struct Node {
    overlay: Arc<Overlay>,
}

impl Node {
    /// Creates a node on `overlay` with the default configuration.
    ///
    /// `key` is the overlay's static x25519 secret; every node of the
    /// overlay holds it, and sessions authenticate against it.
    pub fn new(overlay: OverlayId, key: StaticSecret, app: Arc<dyn Application>) -> Node {
        Node::with_config(overlay, key, app, OverlayConfig::default())
    }

    /// Creates a node with explicit configuration.
    pub fn with_config(
        overlay: OverlayId,
        key: StaticSecret,
        app: Arc<dyn Application>,
        config: OverlayConfig,
    ) -> Node {
        Node {
            overlay: Overlay::new(overlay, key, app, config),
        }
    }

    /// The node's random identifier in the keyspace. Fresh on every
    /// construction; nothing is persisted.
    pub fn node_id(&self) -> NodeId {
        self.overlay.node_id()
    }

    /// Addresses the session listeners are bound to; empty before boot.
    pub fn listen_addrs(&self) -> Vec<String> {
        self.overlay.listen_addrs()
    }

    /// Binds the configured interfaces, starts discovery and begins
    /// accepting peers.
    pub async fn boot(&self) -> Result<(), BootError> {
        self.overlay.clone().boot().await
    }

    /// Routes `msg` toward `dest`: delivered locally when this node is the
    /// numerically responsible one, forwarded otherwise.
    ///
    /// Non-blocking; fails with [`SendError::Saturated`] when the local
    /// outbound queue is full.
    pub fn send(&self, dest: NodeId, msg: Message) -> Result<(), SendError> {
        self.overlay.send(dest, msg)
    }

    /// Stops accepting, closes every session and waits for the node's
    /// tasks to drain. Idempotent.
    pub async fn shutdown(&self) {
        self.overlay.shutdown().await;
    }
}
