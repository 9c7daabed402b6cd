//! Peer records shared by the routing structures.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};

use crate::id::NodeId;
use crate::messages::Message;

/// A fully-initialized remote peer: the session behind it is live and the
/// overlay handshake has completed.
///
/// One record exists per remote id; the leaf set, neighborhood set and
/// prefix table all share it through an `Arc`. Dropping the last routing
/// reference closes the owned session (the routing state calls
/// [`close`](Peer::close) before letting go).
pub struct Peer {
    id: NodeId,
    /// Every address the remote listens on, sorted for stable dial
    /// preference.
    addrs: Vec<String>,
    /// Network proximity scalar (handshake round-trip, microseconds).
    proximity: u64,
    /// True when the local end initiated the session.
    outbound: bool,
    outbox: mpsc::Sender<Message>,
    quit: watch::Sender<bool>,
    alive: AtomicBool,
}

impl Peer {
    pub(crate) fn new(
        id: NodeId,
        mut addrs: Vec<String>,
        proximity: u64,
        outbound: bool,
        outbox: mpsc::Sender<Message>,
        quit: watch::Sender<bool>,
    ) -> Peer {
        addrs.sort();
        addrs.dedup();
        Peer {
            id,
            addrs,
            proximity,
            outbound,
            outbox,
            quit,
            alive: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn proximity(&self) -> u64 {
        self.proximity
    }

    pub(crate) fn outbound(&self) -> bool {
        self.outbound
    }

    /// False once the session died or the record was closed; a closed
    /// outbox means the writer task is gone.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.outbox.is_closed()
    }

    /// Marks the record dead without tearing the session down; used when
    /// the session reader reported the death itself.
    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Tears the owned session down. Idempotent.
    pub(crate) fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.quit.send(true);
    }

    /// Queues a message without waiting; callers that may block use
    /// [`sender`](Peer::sender) instead.
    pub(crate) fn try_enqueue(&self, msg: Message) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.outbox.try_send(msg)
    }

    /// The raw outbox for backpressured sends.
    pub(crate) fn sender(&self) -> mpsc::Sender<Message> {
        self.outbox.clone()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addrs", &self.addrs)
            .field("proximity", &self.proximity)
            .field("outbound", &self.outbound)
            .field("alive", &self.is_alive())
            .finish()
    }
}
