//! # Weft - Structured-Overlay Messaging
//!
//! Weft is a peer-to-peer overlay node: it joins a network named by an
//! application identifier, draws a random 160-bit id, discovers peers on
//! the local link, establishes mutually-authenticated encrypted sessions
//! with them and from then on routes messages toward any numeric
//! destination id by Pastry-style prefix routing.
//!
//! ## Architecture
//!
//! The node is a set of cooperating tasks wired by bounded channels: per
//! interface an acceptor and a discovery beacon fan into a shaker that
//! handshakes fresh sessions; integrated peers land in the routing state
//! (leaf set, neighborhood set, prefix table); a forwarding task applies
//! the routing rule and invokes the application callback for local
//! deliveries; a maintenance task repairs routing gaps with periodic state
//! exchanges.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Public `Node` facade: new / boot / send / shutdown |
//! | `config` | Immutable per-node configuration |
//! | `id` | 160-bit `NodeId` arithmetic and `OverlayId` |
//! | `hkdf` | Lazy extract-and-expand key derivation |
//! | `session` | Authenticated, encrypted, framed transport |
//! | `discovery` | LAN beacon intake over UDP probe ports |
//! | `messages` | Bincode wire records and the message shape |
//! | `routing` | Leaf set, neighborhood set, prefix table, route rule |
//! | `peer` | Shared peer records owned by the routing state |
//! | `overlay` | Acceptor / shaker / forwarder / maintenance fabric |
//!
//! ## Trust model
//!
//! Every node of an overlay holds the overlay's static x25519 key; the
//! session handshake seals a fresh secret against it, so nodes of
//! different overlays (or outsiders without the key) cannot complete a
//! handshake. There is no persistence: a restarted node is a new id.

mod config;
mod discovery;
pub mod hkdf;
mod id;
mod messages;
mod node;
mod overlay;
mod peer;
mod routing;
pub mod session;

pub use config::OverlayConfig;
pub use hkdf::{ExpansionExhausted, HkdfStream};
pub use id::{NodeId, OverlayId, ID_BITS, ID_BYTES};
pub use messages::{Header, InitPacket, Message, StateExchange};
pub use node::{Application, BootError, Node, SendError};
pub use overlay::HandshakeError;
pub use peer::Peer;
pub use session::{Listener, Session, SessionError};

// Key types of the session handshake, re-exported so applications need no
// direct dependency for key handling.
pub use x25519_dalek::{PublicKey, StaticSecret};
