//! # Overlay Core
//!
//! The task fabric turning raw sessions and LAN discoveries into a routed
//! overlay. One node runs, for its lifetime:
//!
//! - per bound interface: a session accept pump and a discovery beacon,
//!   both fanning into overlay-wide channels;
//! - one **shaker** draining those channels, dialing discovered endpoints
//!   and spawning a short-lived handshake task per session so a stalled
//!   peer never blocks the pipeline;
//! - one **forwarder** applying the routing rule to local sends and inbound
//!   traffic, delivering to the application, and merging state exchanges;
//! - one **maintenance** task issuing the periodic repair exchange;
//! - per live peer: a pump moving decoded session messages into the
//!   forwarder and reporting peer death.
//!
//! Every long-lived task watches one shared `watch` channel for shutdown.
//! The routing state is the only multi-producer structure; it sits behind a
//! single mutex that is never held across a suspension point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tracing::{debug, info, trace, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::OverlayConfig;
use crate::discovery::{self, Probe};
use crate::id::{NodeId, OverlayId};
use crate::messages::{self, Header, InitPacket, Message, OverlayPacket, StateExchange};
use crate::node::{Application, BootError, SendError};
use crate::peer::Peer;
use crate::routing::{RouteDecision, RoutingState};
use crate::session::{self, Listener, Session};

/// How many times a message is re-routed after a next hop dies mid-send.
const REROUTE_ATTEMPTS: usize = 3;

/// Capacity of the recently-dialed damper.
const DIAL_CACHE: usize = 256;

/// Failure modes of the overlay handshake. The session is closed on every
/// one of them; there is no retry at this layer.
#[derive(Debug)]
pub enum HandshakeError {
    /// The remote init packet did not arrive within the init timeout.
    Timeout,
    /// The session died before the init packet arrived.
    Closed,
    /// The first record was not an init packet.
    Protocol,
    Codec(bincode::Error),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::Timeout => write!(f, "timed out waiting for the init packet"),
            HandshakeError::Closed => write!(f, "session closed before the init packet"),
            HandshakeError::Protocol => write!(f, "first record was not an init packet"),
            HandshakeError::Codec(err) => write!(f, "malformed init packet: {}", err),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::Codec(err) => Some(err),
            _ => None,
        }
    }
}

/// Work items of the forwarding task.
enum FwdEvent {
    /// A routed message, locally originated or arriving from a peer.
    Route { msg: Message },
    /// A decoded session message from an integrated peer.
    Inbound { from: NodeId, msg: Message },
    /// A peer's session reader stopped.
    PeerDown(NodeId),
}

pub(crate) struct Overlay {
    node_id: NodeId,
    overlay_id: OverlayId,
    local_key: StaticSecret,
    remote_keys: HashMap<Vec<u8>, PublicKey>,
    config: OverlayConfig,
    app: Arc<dyn Application>,
    routing: Mutex<RoutingState>,
    /// Damps duplicate dials per endpoint; entries are cleared on eviction
    /// so rediscovery can redial at once.
    dialed: Mutex<LruCache<SocketAddr, Instant>>,
    fwd_tx: mpsc::Sender<FwdEvent>,
    fwd_rx: Mutex<Option<mpsc::Receiver<FwdEvent>>>,
    quit_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<Vec<Listener>>,
    booted: AtomicBool,
    down: AtomicBool,
}

impl Overlay {
    pub fn new(
        overlay_id: OverlayId,
        local_key: StaticSecret,
        app: Arc<dyn Application>,
        config: OverlayConfig,
    ) -> Arc<Overlay> {
        let node_id = NodeId::random();
        // The overlay trusts one static key; dialers and listeners both
        // resolve it through this table.
        let mut remote_keys = HashMap::new();
        remote_keys.insert(
            overlay_id.as_bytes().to_vec(),
            PublicKey::from(&local_key),
        );

        let (fwd_tx, fwd_rx) = mpsc::channel(config.queue_depth);
        let (quit_tx, _) = watch::channel(false);
        let cache_size = NonZeroUsize::new(DIAL_CACHE).expect("nonzero cache capacity");

        Arc::new(Overlay {
            routing: Mutex::new(RoutingState::new(node_id, &config)),
            node_id,
            overlay_id,
            local_key,
            remote_keys,
            config,
            app,
            dialed: Mutex::new(LruCache::new(cache_size)),
            fwd_tx,
            fwd_rx: Mutex::new(Some(fwd_rx)),
            quit_tx,
            tasks: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            booted: AtomicBool::new(false),
            down: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn listen_addrs(&self) -> Vec<String> {
        self.routing.lock().addrs()
    }

    fn quit_rx(&self) -> watch::Receiver<bool> {
        self.quit_tx.subscribe()
    }

    /// Binds every configured interface, starts discovery and begins
    /// accepting peers.
    pub async fn boot(self: Arc<Self>) -> Result<(), BootError> {
        if self.booted.swap(true, Ordering::SeqCst) {
            return Err(BootError::AlreadyBooted);
        }

        let (sess_tx, sess_rx) = mpsc::channel(self.config.queue_depth);
        let (probe_tx, probe_rx) = mpsc::channel(self.config.queue_depth);

        for &ip in &self.config.bind_ips {
            let (mut inbound, listener) = session::listen(
                SocketAddr::new(ip, 0),
                self.local_key.clone(),
                self.remote_keys.clone(),
                &self.config,
            )
            .await
            .map_err(|source| BootError::Bind { ip, source })?;
            let listen_addr = listener.local_addr();
            self.routing.lock().push_addr(listen_addr.to_string());

            let beacon = discovery::spawn(
                ip,
                self.overlay_id.digest(),
                listen_addr.port(),
                &self.config,
                probe_tx.clone(),
                self.quit_rx(),
            )
            .await
            .map_err(|source| BootError::Discovery { ip, source })?;

            // Fan inbound sessions of this interface into the shared
            // channel the shaker drains.
            let sess_tx = sess_tx.clone();
            let mut quit = self.quit_rx();
            let pump = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = quit.changed() => break,
                        session = inbound.recv() => match session {
                            Some(session) => {
                                if sess_tx.send(session).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });

            let mut tasks = self.tasks.lock();
            tasks.push(beacon);
            tasks.push(pump);
            self.listeners.lock().push(listener);
        }

        let fwd_rx = self
            .fwd_rx
            .lock()
            .take()
            .expect("forwarding receiver consumed before boot");
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().shaker(sess_rx, probe_rx)));
        tasks.push(tokio::spawn(self.clone().forwarder(fwd_rx)));
        tasks.push(tokio::spawn(self.clone().maintenance()));
        self.tasks.lock().extend(tasks);

        info!(
            node = %self.node_id,
            overlay = ?self.overlay_id,
            addrs = ?self.listen_addrs(),
            "overlay node booted"
        );
        Ok(())
    }

    /// Routes a locally originated message toward `dest`.
    pub fn send(&self, dest: NodeId, msg: Message) -> Result<(), SendError> {
        let wire = messages::wrap_route(dest, msg).map_err(SendError::Encode)?;
        self.fwd_tx
            .try_send(FwdEvent::Route { msg: wire })
            .map_err(|err| match err {
                TrySendError::Full(_) => SendError::Saturated,
                TrySendError::Closed(_) => SendError::Shutdown,
            })
    }

    /// Tears the node down: stops accepting, closes every session and
    /// waits for the spawned tasks to exit.
    pub async fn shutdown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.quit_tx.send(true);

        let listeners: Vec<_> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.stop().await;
        }
        let _ = self.routing.lock().drain();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(node = %self.node_id, "overlay node shut down");
    }

    /// Fans in discoveries and fresh sessions; never blocks on a slow
    /// handshake.
    async fn shaker(
        self: Arc<Self>,
        mut sess_rx: mpsc::Receiver<Session>,
        mut probe_rx: mpsc::Receiver<Probe>,
    ) {
        let mut quit = self.quit_rx();
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                probe = probe_rx.recv() => match probe {
                    Some(probe) => self.clone().spawn_dial(SocketAddr::new(probe.ip, probe.port)),
                    None => break,
                },
                session = sess_rx.recv() => match session {
                    Some(session) => {
                        let overlay = self.clone();
                        tokio::spawn(overlay.shake(session, false));
                    }
                    None => break,
                },
            }
        }
    }

    /// Opportunistically dials an observed endpoint unless it is one of our
    /// own listeners or was dialed a moment ago.
    fn spawn_dial(self: Arc<Self>, addr: SocketAddr) {
        if self.listen_addrs().contains(&addr.to_string()) {
            return;
        }
        {
            let damp = self.config.beacon_interval * 4;
            let mut dialed = self.dialed.lock();
            if let Some(last) = dialed.get(&addr) {
                if last.elapsed() < damp {
                    return;
                }
            }
            dialed.put(addr, Instant::now());
        }

        let overlay = self;
        tokio::spawn(async move {
            let Some(remote_pub) = overlay
                .remote_keys
                .get(overlay.overlay_id.as_bytes())
                .copied()
            else {
                return;
            };
            let dialing = session::dial(
                addr,
                &overlay.overlay_id,
                &overlay.local_key,
                remote_pub,
                &overlay.config,
            );
            match timeout(overlay.config.init_timeout, dialing).await {
                Ok(Ok(session)) => overlay.clone().shake(session, true).await,
                Ok(Err(err)) => debug!(%addr, error = %err, "dial failed"),
                Err(_) => debug!(%addr, "dial timed out"),
            }
        });
    }

    /// One overlay handshake: init packets both ways, then integration.
    async fn shake(self: Arc<Self>, session: Session, outbound: bool) {
        let peer_addr = session.peer_addr();
        if let Err(err) = self.handshake(session, outbound).await {
            debug!(peer = %peer_addr, error = %err, "overlay handshake failed");
        }
    }

    async fn handshake(&self, session: Session, outbound: bool) -> Result<(), HandshakeError> {
        let started = Instant::now();
        let (in_tx, mut in_rx) = mpsc::channel(self.config.queue_depth);
        let (quit_tx, quit_rx) = watch::channel(false);
        let out_tx = session.communicate(in_tx, quit_rx);

        let init = InitPacket {
            id: self.node_id,
            addrs: self.routing.lock().addrs(),
        };
        let hello = match control_message(&OverlayPacket::Init(init)) {
            Ok(msg) => msg,
            Err(err) => {
                let _ = quit_tx.send(true);
                return Err(HandshakeError::Codec(err));
            }
        };
        if out_tx.send(hello).await.is_err() {
            return Err(HandshakeError::Closed);
        }

        let packet = match timeout(self.config.init_timeout, in_rx.recv()).await {
            Err(_) => {
                let _ = quit_tx.send(true);
                return Err(HandshakeError::Timeout);
            }
            Ok(None) => return Err(HandshakeError::Closed),
            Ok(Some(msg)) => match messages::decode_packet(&msg) {
                Ok(OverlayPacket::Init(packet)) => packet,
                Ok(_) => {
                    let _ = quit_tx.send(true);
                    return Err(HandshakeError::Protocol);
                }
                Err(err) => {
                    let _ = quit_tx.send(true);
                    return Err(HandshakeError::Codec(err));
                }
            },
        };

        let proximity = (started.elapsed().as_micros() as u64).max(1);
        let peer = Arc::new(Peer::new(
            packet.id,
            packet.addrs,
            proximity,
            outbound,
            out_tx,
            quit_tx,
        ));
        // Handshakes racing a shutdown must not resurrect routing state.
        if self.down.load(Ordering::SeqCst) {
            peer.close();
            return Ok(());
        }
        // Integration decides ownership; rejected sessions are closed
        // inside.
        if !self.routing.lock().integrate(peer.clone()) {
            return Ok(());
        }

        let id = peer.id();
        let fwd_tx = self.fwd_tx.clone();
        let pump_peer = peer.clone();
        let pump = tokio::spawn(async move {
            while let Some(msg) = in_rx.recv().await {
                if fwd_tx
                    .send(FwdEvent::Inbound { from: id, msg })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            // Session reader is gone; flag the record before reporting so
            // the forwarder can tell this death from a replaced session.
            pump_peer.mark_dead();
            let _ = fwd_tx.send(FwdEvent::PeerDown(id)).await;
        });
        self.tasks.lock().push(pump);

        info!(peer = %id, proximity_us = proximity, outbound, "peer joined the overlay");
        self.send_state(&peer, true);
        Ok(())
    }

    /// Applies routing decisions and merges state; the only task invoking
    /// the application callback.
    async fn forwarder(self: Arc<Self>, mut fwd_rx: mpsc::Receiver<FwdEvent>) {
        let mut quit = self.quit_rx();
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                event = fwd_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        FwdEvent::Route { msg } => self.dispatch(msg).await,
                        FwdEvent::Inbound { from, msg } => self.clone().inbound(from, msg).await,
                        FwdEvent::PeerDown(id) => self.peer_down(&id),
                    }
                }
            }
        }
    }

    async fn inbound(self: Arc<Self>, from: NodeId, msg: Message) {
        match messages::decode_packet(&msg) {
            Ok(OverlayPacket::Route { .. }) => self.dispatch(msg).await,
            Ok(OverlayPacket::State(state)) => self.merge_state(from, state),
            Ok(OverlayPacket::Init(_)) => {
                trace!(peer = %from, "stray init packet ignored")
            }
            Err(err) => {
                debug!(peer = %from, error = %err, "undecodable overlay record, evicting");
                self.peer_down_forced(&from);
            }
        }
    }

    /// Routes one wire message: local delivery or next hop, with a bounded
    /// number of re-routes when a chosen hop dies under us.
    async fn dispatch(&self, msg: Message) {
        let (dest, app_meta) = match messages::decode_packet(&msg) {
            Ok(OverlayPacket::Route { dest, meta }) => (dest, meta),
            _ => return,
        };
        let mut msg = msg;
        for _ in 0..REROUTE_ATTEMPTS {
            let decision = self.routing.lock().route(&dest);
            match decision {
                RouteDecision::Local => {
                    trace!(dest = %dest, "delivering locally");
                    self.app.deliver(messages::unwrap_route(msg, app_meta));
                    return;
                }
                RouteDecision::Forward(peer) => {
                    trace!(dest = %dest, next = %peer.id(), "forwarding");
                    // Backpressure point: a full outbox parks the
                    // forwarder until the peer drains.
                    match peer.sender().send(msg).await {
                        Ok(()) => return,
                        Err(failed) => {
                            msg = failed.0;
                            peer.mark_dead();
                            self.peer_down(&peer.id());
                        }
                    }
                }
            }
        }
        warn!(dest = %dest, "message dropped, forwarding kept failing");
    }

    /// Merges a received state exchange: unknown entries become dial
    /// candidates, and the integration-time exchange is answered in kind.
    fn merge_state(self: Arc<Self>, from: NodeId, state: StateExchange) {
        let unknown: Vec<(NodeId, Vec<String>)> = {
            let routing = self.routing.lock();
            state
                .entries
                .into_iter()
                .filter(|(id, _)| *id != self.node_id && !routing.contains(id))
                .collect()
        };
        for (id, addrs) in unknown {
            trace!(peer = %id, via = %from, "state exchange named an unknown peer");
            for addr in addrs {
                if let Ok(addr) = addr.parse::<SocketAddr>() {
                    self.clone().spawn_dial(addr);
                }
            }
        }
        if state.respond {
            let peer = self.routing.lock().peer(&from);
            if let Some(peer) = peer {
                self.send_state(&peer, false);
            }
        }
    }

    /// Queues our routing snapshot on `peer`. Best effort: a full outbox
    /// just skips this round.
    fn send_state(&self, peer: &Peer, respond: bool) {
        let entries = self.routing.lock().snapshot();
        match control_message(&OverlayPacket::State(StateExchange { respond, entries })) {
            Ok(msg) => {
                if peer.try_enqueue(msg).is_err() {
                    trace!(peer = %peer.id(), "state exchange skipped, outbox busy");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode state exchange"),
        }
    }

    /// Evicts `id` if its record is actually dead. A replaced session's
    /// pump reports the old record's death; the live replacement stays.
    fn peer_down(&self, id: &NodeId) {
        let evicted = {
            let mut routing = self.routing.lock();
            match routing.peer(id) {
                Some(peer) if !peer.is_alive() => routing.evict(id),
                _ => None,
            }
        };
        if let Some(peer) = evicted {
            self.forget_dials(&peer);
            info!(peer = %id, "peer left the overlay");
        }
    }

    /// Evicts unconditionally; used when the peer misbehaved.
    fn peer_down_forced(&self, id: &NodeId) {
        let evicted = self.routing.lock().evict(id);
        if let Some(peer) = evicted {
            self.forget_dials(&peer);
        }
    }

    fn forget_dials(&self, peer: &Peer) {
        let mut dialed = self.dialed.lock();
        for addr in peer.addrs() {
            if let Ok(addr) = addr.parse::<SocketAddr>() {
                dialed.pop(&addr);
            }
        }
    }

    /// Periodic repair: push our state to one random leaf.
    async fn maintenance(self: Arc<Self>) {
        let mut quit = self.quit_rx();
        let mut ticker = time::interval(self.config.exchange_period);
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = ticker.tick() => {
                    let leaf = self.routing.lock().random_leaf();
                    if let Some(leaf) = leaf {
                        trace!(peer = %leaf.id(), "periodic state exchange");
                        self.send_state(&leaf, false);
                    }
                }
            }
        }
    }
}

fn control_message(packet: &OverlayPacket) -> Result<Message, bincode::Error> {
    Ok(Message {
        head: Header {
            meta: messages::serialize(packet)?,
            ..Header::default()
        },
        data: Vec::new(),
    })
}
