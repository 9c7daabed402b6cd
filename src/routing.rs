//! # Routing State
//!
//! The three Pastry-style structures and the forwarding rule:
//!
//! - **Leaf set**: the numerically closest peers on each side of the local
//!   id on the wrap-around ring, `l/2` per side, nearest first.
//! - **Neighborhood set**: the peers closest by network proximity, used to
//!   seed prefix-table cells, never consulted for forwarding.
//! - **Prefix table**: a `digits × 2^b` grid where cell `(r, c)` holds at
//!   most one peer sharing exactly `r` leading digits with the local id and
//!   continuing with digit `c`. The column of the local id's own digit
//!   stays empty by construction.
//!
//! A peer record may sit in several structures at once; the state owns the
//! single `Arc` per id and destroys the record (closing its session) when
//! the last structure lets go. All methods are synchronous and run under
//! one exclusive lock held by the overlay, so every lookup observes a
//! consistent snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, trace};

use crate::config::OverlayConfig;
use crate::id::NodeId;
use crate::peer::Peer;

/// Outcome of the forwarding rule for one destination.
#[derive(Clone, Debug)]
pub(crate) enum RouteDecision {
    /// The local node is the responsible one; deliver to the application.
    Local,
    /// Pass the message to this peer.
    Forward(Arc<Peer>),
}

pub(crate) struct RoutingState {
    local: NodeId,
    digit_bits: u8,
    leaf_each_side: usize,
    neighborhood_size: usize,
    /// Ring-smaller side of the leaf set, nearest first.
    below: Vec<NodeId>,
    /// Ring-larger side of the leaf set, nearest first.
    above: Vec<NodeId>,
    neighbors: Vec<NodeId>,
    table: Vec<Vec<Option<NodeId>>>,
    peers: HashMap<NodeId, Arc<Peer>>,
    /// Local listener addresses, sorted; guarded by the same lock as the
    /// routing structures.
    addrs: Vec<String>,
}

impl RoutingState {
    pub fn new(local: NodeId, config: &OverlayConfig) -> RoutingState {
        RoutingState {
            local,
            digit_bits: config.digit_bits,
            leaf_each_side: config.leaf_set_size / 2,
            neighborhood_size: config.neighborhood_size,
            below: Vec::new(),
            above: Vec::new(),
            neighbors: Vec::new(),
            table: vec![vec![None; config.columns()]; config.digits()],
            peers: HashMap::new(),
            addrs: Vec::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn peer(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.peers.get(id).cloned()
    }

    /// Records a local listener address.
    pub fn push_addr(&mut self, addr: String) {
        self.addrs.push(addr);
        self.addrs.sort();
    }

    pub fn addrs(&self) -> Vec<String> {
        self.addrs.clone()
    }

    /// Places a freshly shaken peer into the structures it qualifies for.
    ///
    /// Returns true when the peer became part of the routing state. On a
    /// duplicate id the incumbent stays and the newcomer's session is
    /// closed, with two exceptions: a dead incumbent is replaced outright,
    /// and a cross-connected pair (one session per direction) resolves to
    /// the session initiated by the numerically smaller endpoint, so both
    /// ends of the pair converge on the same one.
    pub fn integrate(&mut self, peer: Arc<Peer>) -> bool {
        let id = peer.id();
        if id == self.local {
            debug!(peer = %id, "refusing to integrate own id");
            peer.close();
            return false;
        }

        if let Some(existing) = self.peers.get(&id) {
            let replace = if !existing.is_alive() {
                true
            } else if existing.outbound() != peer.outbound() {
                let canonical_outbound = self.local < id;
                peer.outbound() == canonical_outbound
            } else {
                false
            };
            if !replace {
                trace!(peer = %id, "duplicate session closed, incumbent kept");
                peer.close();
                return false;
            }
            trace!(peer = %id, "incumbent session replaced");
            self.remove_references(&id);
            if let Some(old) = self.peers.remove(&id) {
                old.close();
            }
        }

        self.peers.insert(id, peer.clone());
        let mut displaced = Vec::new();
        self.place_leaf(id, &mut displaced);
        self.place_neighbor(&peer, &mut displaced);
        self.place_table(&peer, &mut displaced);

        if !self.referenced(&id) {
            // Qualified for nothing; not part of the overlay state.
            self.peers.remove(&id);
            peer.close();
            self.collect(&displaced);
            debug!(peer = %id, "peer not competitive for any structure");
            return false;
        }
        self.collect(&displaced);
        debug!(peer = %id, peers = self.peers.len(), "peer integrated");
        true
    }

    /// Removes every reference to `id`, closes the owned session and
    /// returns the record.
    pub fn evict(&mut self, id: &NodeId) -> Option<Arc<Peer>> {
        let peer = self.peers.remove(id)?;
        self.remove_references(id);
        peer.close();
        debug!(peer = %id, peers = self.peers.len(), "peer evicted");
        Some(peer)
    }

    /// Applies the forwarding rule to `dest` against the current state.
    pub fn route(&self, dest: &NodeId) -> RouteDecision {
        if *dest == self.local {
            return RouteDecision::Local;
        }

        // Within the leaf span the numerically closest leaf (the local node
        // included) is responsible; ties go to the lower id.
        if !self.below.is_empty() || !self.above.is_empty() {
            let lowest = self.below.last().copied().unwrap_or(self.local);
            let highest = self.above.last().copied().unwrap_or(self.local);
            let span = highest.sub_mod(&lowest);
            if dest.sub_mod(&lowest) <= span {
                let mut best = self.local;
                let mut best_dist = self.local.ring_distance(dest);
                for id in self.below.iter().chain(self.above.iter()) {
                    let dist = id.ring_distance(dest);
                    if dist < best_dist || (dist == best_dist && *id < best) {
                        best = *id;
                        best_dist = dist;
                    }
                }
                if best == self.local {
                    return RouteDecision::Local;
                }
                if let Some(peer) = self.peers.get(&best) {
                    return RouteDecision::Forward(peer.clone());
                }
            }
        }

        // Prefix rule: one more matching digit than the local id has.
        let row = self.local.common_prefix(dest, self.digit_bits);
        let column = dest.digit(row, self.digit_bits) as usize;
        if let Some(id) = self.table[row][column] {
            if let Some(peer) = self.peers.get(&id) {
                return RouteDecision::Forward(peer.clone());
            }
        }

        // Rare fallback on table gaps: any peer at least as prefix-close
        // that is numerically closer than the local node.
        let local_dist = self.local.ring_distance(dest);
        let mut best: Option<(NodeId, NodeId)> = None;
        for (id, _) in self.peers.iter() {
            if id.common_prefix(dest, self.digit_bits) < row {
                continue;
            }
            let dist = id.ring_distance(dest);
            if dist >= local_dist {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_dist, best_id)) => {
                    dist < best_dist || (dist == best_dist && *id < best_id)
                }
            };
            if better {
                best = Some((dist, *id));
            }
        }
        match best.and_then(|(_, id)| self.peers.get(&id)) {
            Some(peer) => RouteDecision::Forward(peer.clone()),
            // Nobody reachable is closer: the local node is responsible.
            None => RouteDecision::Local,
        }
    }

    /// All known peers as `(id, addrs)` tuples for a state exchange.
    pub fn snapshot(&self) -> Vec<(NodeId, Vec<String>)> {
        self.peers
            .values()
            .map(|peer| (peer.id(), peer.addrs().to_vec()))
            .collect()
    }

    /// A uniformly chosen leaf-set peer, if any.
    pub fn random_leaf(&self) -> Option<Arc<Peer>> {
        let total = self.below.len() + self.above.len();
        if total == 0 {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..total);
        let id = if pick < self.below.len() {
            self.below[pick]
        } else {
            self.above[pick - self.below.len()]
        };
        self.peers.get(&id).cloned()
    }

    /// Empties the state for shutdown, closing every session.
    pub fn drain(&mut self) -> Vec<Arc<Peer>> {
        self.below.clear();
        self.above.clear();
        self.neighbors.clear();
        for row in &mut self.table {
            row.iter_mut().for_each(|cell| *cell = None);
        }
        let peers: Vec<_> = self.peers.drain().map(|(_, peer)| peer).collect();
        for peer in &peers {
            peer.close();
        }
        peers
    }

    fn place_leaf(&mut self, id: NodeId, displaced: &mut Vec<NodeId>) {
        let local = self.local;
        let clockwise = id.sub_mod(&local);
        let (list, arc) = if clockwise <= NodeId::HALF {
            (&mut self.above, clockwise)
        } else {
            (&mut self.below, local.sub_mod(&id))
        };
        let above = clockwise <= NodeId::HALF;
        let pos = list
            .binary_search_by_key(&arc, |other| {
                if above {
                    other.sub_mod(&local)
                } else {
                    local.sub_mod(other)
                }
            })
            .unwrap_or_else(|pos| pos);
        list.insert(pos, id);
        if list.len() > self.leaf_each_side {
            if let Some(dropped) = list.pop() {
                displaced.push(dropped);
            }
        }
    }

    fn place_neighbor(&mut self, peer: &Arc<Peer>, displaced: &mut Vec<NodeId>) {
        if self.neighbors.len() < self.neighborhood_size {
            self.neighbors.push(peer.id());
            return;
        }
        let farthest = self
            .neighbors
            .iter()
            .enumerate()
            .max_by_key(|(_, id)| self.proximity_of(id));
        if let Some((slot, _)) = farthest {
            if peer.proximity() < self.proximity_of(&self.neighbors[slot]) {
                displaced.push(self.neighbors[slot]);
                self.neighbors[slot] = peer.id();
            }
        }
    }

    fn place_table(&mut self, peer: &Arc<Peer>, displaced: &mut Vec<NodeId>) {
        let id = peer.id();
        // The first differing digit can never be the local id's own, so the
        // diagonal column stays empty.
        let row = self.local.common_prefix(&id, self.digit_bits);
        let column = id.digit(row, self.digit_bits) as usize;
        match self.table[row][column] {
            None => self.table[row][column] = Some(id),
            Some(existing) => {
                if peer.proximity() < self.proximity_of(&existing) {
                    displaced.push(existing);
                    self.table[row][column] = Some(id);
                }
            }
        }
    }

    fn proximity_of(&self, id: &NodeId) -> u64 {
        self.peers.get(id).map(|p| p.proximity()).unwrap_or(u64::MAX)
    }

    fn referenced(&self, id: &NodeId) -> bool {
        if self.below.contains(id) || self.above.contains(id) || self.neighbors.contains(id) {
            return true;
        }
        let row = self.local.common_prefix(id, self.digit_bits);
        row < self.table.len() && self.table[row][id.digit(row, self.digit_bits) as usize] == Some(*id)
    }

    fn remove_references(&mut self, id: &NodeId) {
        self.below.retain(|other| other != id);
        self.above.retain(|other| other != id);
        self.neighbors.retain(|other| other != id);
        let row = self.local.common_prefix(id, self.digit_bits);
        if row < self.table.len() {
            let column = id.digit(row, self.digit_bits) as usize;
            if self.table[row][column] == Some(*id) {
                self.table[row][column] = None;
            }
        }
    }

    /// Destroys records that lost their last structure slot.
    fn collect(&mut self, displaced: &[NodeId]) {
        for id in displaced {
            if !self.referenced(id) {
                if let Some(peer) = self.peers.remove(id) {
                    trace!(peer = %id, "displaced peer destroyed");
                    peer.close();
                }
            }
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        // Leaf sides sorted by ring arc, nearest first.
        for list in [&self.below, &self.above] {
            for pair in list.windows(2) {
                let a = pair[0].ring_distance(&self.local);
                let b = pair[1].ring_distance(&self.local);
                assert!(a <= b, "leaf side out of order");
            }
            assert!(list.len() <= self.leaf_each_side);
        }
        assert!(self.neighbors.len() <= self.neighborhood_size);
        // Every occupied cell genuinely has the stated prefix and digit.
        for (row, cells) in self.table.iter().enumerate() {
            for (column, cell) in cells.iter().enumerate() {
                if let Some(id) = cell {
                    assert_eq!(self.local.common_prefix(id, self.digit_bits), row);
                    assert_eq!(id.digit(row, self.digit_bits) as usize, column);
                    assert!(self.peers.contains_key(id));
                }
            }
        }
        // Every peer is referenced somewhere; no structure names a stranger.
        for id in self.peers.keys() {
            assert!(self.referenced(id), "peer {} unreferenced", id);
        }
        for id in self.below.iter().chain(&self.above).chain(&self.neighbors) {
            assert!(self.peers.contains_key(id), "structure names missing peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ID_BYTES;
    use crate::messages::Message;
    use tokio::sync::{mpsc, watch};

    /// Keeps channel ends alive so test peers stay "live".
    struct Harness {
        state: RoutingState,
        keep: Vec<mpsc::Receiver<Message>>,
    }

    fn nid(lead: &[u8]) -> NodeId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[..lead.len()].copy_from_slice(lead);
        NodeId::from_bytes(bytes)
    }

    /// Local id plus a small clockwise offset.
    fn above_of(local: NodeId, offset: u8) -> NodeId {
        let mut bytes = *local.as_bytes();
        bytes[ID_BYTES - 1] += offset;
        NodeId::from_bytes(bytes)
    }

    fn below_of(local: NodeId, offset: u8) -> NodeId {
        let mut delta = [0u8; ID_BYTES];
        delta[ID_BYTES - 1] = offset;
        local.sub_mod(&NodeId::from_bytes(delta))
    }

    fn config(leaf: usize, neighborhood: usize) -> OverlayConfig {
        OverlayConfig {
            leaf_set_size: leaf,
            neighborhood_size: neighborhood,
            ..OverlayConfig::default()
        }
    }

    fn harness(local: NodeId, config: &OverlayConfig) -> Harness {
        Harness {
            state: RoutingState::new(local, config),
            keep: Vec::new(),
        }
    }

    impl Harness {
        fn make_peer(&mut self, id: NodeId, proximity: u64, outbound: bool) -> Arc<Peer> {
            let (tx, rx) = mpsc::channel(4);
            let (quit, _) = watch::channel(false);
            self.keep.push(rx);
            Arc::new(Peer::new(
                id,
                vec![format!("127.0.0.1:{}", 1000 + self.keep.len())],
                proximity,
                outbound,
                tx,
                quit,
            ))
        }

        fn add(&mut self, id: NodeId, proximity: u64) -> Arc<Peer> {
            let peer = self.make_peer(id, proximity, true);
            assert!(self.state.integrate(peer.clone()), "peer should integrate");
            self.state.check_invariants();
            peer
        }
    }

    #[test]
    fn own_id_rejected() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(4, 4));
        let peer = h.make_peer(local, 10, true);
        assert!(!h.state.integrate(peer.clone()));
        assert!(!peer.is_alive());
        assert_eq!(h.state.peer_count(), 0);
    }

    #[test]
    fn leaf_sides_sorted_and_trimmed() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(4, 0));

        let far = h.add(above_of(local, 9), 10);
        h.add(above_of(local, 3), 10);
        h.add(below_of(local, 5), 10);
        // A closer third "above" peer trims the farthest off that side.
        h.add(above_of(local, 1), 10);

        assert_eq!(h.state.above, vec![above_of(local, 1), above_of(local, 3)]);
        assert_eq!(h.state.below, vec![below_of(local, 5)]);
        // The trimmed peer still holds its prefix-table slot, so the
        // record survives.
        assert!(h.state.contains(&far.id()));
        assert!(far.is_alive());
    }

    #[test]
    fn displaced_from_every_structure_is_destroyed() {
        let local = nid(&[0x80]);
        // One leaf slot per side, no neighborhood.
        let mut h = harness(local, &config(2, 0));

        // Holds a leaf slot and table cell (0, 1).
        let x = h.add(nid(&[0x10]), 900);
        // Closer on the ring: takes the leaf slot, x keeps its cell.
        h.add(nid(&[0x70]), 10);
        assert!(h.state.contains(&x.id()));
        assert!(x.is_alive());

        // Same cell with lower proximity: x loses its last slot.
        h.add(nid(&[0x1f]), 100);
        assert!(!h.state.contains(&x.id()));
        assert!(!x.is_alive());
    }

    #[test]
    fn prefix_cells_prefer_lower_proximity() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(0, 0));

        // Same cell (row 0, column 1): first differing digit is 1 for both.
        let slow = h.make_peer(nid(&[0x1a]), 900, true);
        assert!(h.state.integrate(slow.clone()));
        let fast = h.make_peer(nid(&[0x1b]), 100, true);
        assert!(h.state.integrate(fast.clone()));
        h.state.check_invariants();

        assert!(h.state.contains(&fast.id()));
        assert!(!h.state.contains(&slow.id()), "slower peer displaced");
        assert!(!slow.is_alive());

        // A still slower candidate for the occupied cell loses instead.
        let slower = h.make_peer(nid(&[0x1c]), 5000, true);
        assert!(!h.state.integrate(slower.clone()));
        assert!(!slower.is_alive());
        assert!(h.state.contains(&fast.id()));
    }

    #[test]
    fn neighborhood_keeps_the_nearest() {
        let local = nid(&[0x80]);
        // Leaf set disabled: only proximity decides.
        let mut h = harness(local, &config(0, 2));
        let a = h.add(nid(&[0x01]), 300);
        h.add(nid(&[0x02]), 100);
        h.add(nid(&[0x03]), 200);

        assert_eq!(h.state.peer_count(), 2);
        assert!(!h.state.contains(&a.id()), "farthest neighbor displaced");
    }

    #[test]
    fn duplicate_integration_is_bounded_idempotent() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(4, 4));
        let id = above_of(local, 1);
        let first = h.add(id, 10);
        let second = h.make_peer(id, 10, true);

        assert!(!h.state.integrate(second.clone()));
        h.state.check_invariants();
        assert_eq!(h.state.peer_count(), 1);
        assert!(first.is_alive(), "incumbent survives");
        assert!(!second.is_alive(), "newcomer session closed");
    }

    #[test]
    fn dead_incumbent_is_replaced() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(4, 4));
        let id = above_of(local, 1);
        let first = h.add(id, 10);
        first.mark_dead();

        let second = h.make_peer(id, 10, true);
        assert!(h.state.integrate(second.clone()));
        h.state.check_invariants();
        assert_eq!(h.state.peer_count(), 1);
        assert!(second.is_alive());
        assert!(!first.is_alive());
    }

    #[test]
    fn cross_connect_converges_on_lower_initiator() {
        // Local id is below the peer id, so the canonical session is the
        // one the local node initiated.
        let local = nid(&[0x10]);
        let peer_id = nid(&[0x90]);
        let mut h = harness(local, &config(4, 4));

        let inbound = h.make_peer(peer_id, 10, false);
        assert!(h.state.integrate(inbound.clone()));
        let outbound = h.make_peer(peer_id, 10, true);
        assert!(h.state.integrate(outbound.clone()), "outbound wins below peer");
        assert!(!inbound.is_alive());
        assert!(outbound.is_alive());

        // Mirror: local above the peer keeps the inbound session.
        let local = nid(&[0xf0]);
        let mut h = harness(local, &config(4, 4));
        let outbound = h.make_peer(peer_id, 10, true);
        assert!(h.state.integrate(outbound.clone()));
        let inbound = h.make_peer(peer_id, 10, false);
        assert!(h.state.integrate(inbound.clone()), "inbound wins above peer");
        assert!(!outbound.is_alive());
        assert!(inbound.is_alive());
    }

    #[test]
    fn evict_destroys_the_record() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(4, 4));
        let peer = h.add(above_of(local, 1), 10);

        let evicted = h.state.evict(&peer.id()).expect("present");
        h.state.check_invariants();
        assert!(!evicted.is_alive());
        assert_eq!(h.state.peer_count(), 0);
        assert!(h.state.evict(&peer.id()).is_none());
    }

    #[test]
    fn route_to_self_is_local() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(4, 4));
        h.add(above_of(local, 1), 10);
        assert!(matches!(h.state.route(&local), RouteDecision::Local));
    }

    #[test]
    fn route_with_no_peers_is_local() {
        let local = nid(&[0x80]);
        let h = harness(local, &config(4, 4));
        assert!(matches!(h.state.route(&nid(&[0x01])), RouteDecision::Local));
    }

    #[test]
    fn leaf_range_picks_numerically_closest() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(8, 0));
        let near = h.add(above_of(local, 1), 10);
        let far = h.add(above_of(local, 4), 10);
        h.add(below_of(local, 2), 10);

        // Exact leaf id.
        match h.state.route(&far.id()) {
            RouteDecision::Forward(peer) => assert_eq!(peer.id(), far.id()),
            other => panic!("expected forward, got {:?}", other),
        }
        // Between local and the near leaf, local wins.
        assert!(matches!(h.state.route(&local), RouteDecision::Local));
        // Closest leaf to an in-range destination.
        match h.state.route(&above_of(local, 2)) {
            RouteDecision::Forward(peer) => assert_eq!(peer.id(), near.id()),
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn leaf_range_tie_prefers_lower_id() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(8, 0));
        let lower = h.add(above_of(local, 1), 10);
        h.add(above_of(local, 3), 10);

        // Distance 1 to both leaves: the lower id wins.
        match h.state.route(&above_of(local, 2)) {
            RouteDecision::Forward(peer) => assert_eq!(peer.id(), lower.id()),
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn prefix_table_routes_outside_leaf_span() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(4, 4));
        let handler = h.add(nid(&[0x1f, 0x22]), 10);

        // Destination far outside the leaf span, first digit 1: the cell
        // peer takes it even though its remaining digits differ.
        match h.state.route(&nid(&[0x10])) {
            RouteDecision::Forward(peer) => assert_eq!(peer.id(), handler.id()),
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn table_gap_falls_back_to_closer_peer() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(2, 4));
        // Occupies row 0 column 2; destination needs column 1, which is
        // empty, but this peer is numerically closer than local.
        let stand_in = h.add(nid(&[0x20]), 10);

        match h.state.route(&nid(&[0x10])) {
            RouteDecision::Forward(peer) => assert_eq!(peer.id(), stand_in.id()),
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn no_closer_peer_means_local_delivery() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(2, 4));
        // Ring distance to the destination: local 0x70…, peer 0x71….
        h.add(nid(&[0x9f]), 10);

        assert!(matches!(h.state.route(&nid(&[0x10])), RouteDecision::Local));
    }

    #[test]
    fn snapshot_lists_every_peer() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(8, 8));
        let a = h.add(above_of(local, 1), 10);
        let b = h.add(nid(&[0x20]), 20);

        let mut snapshot = h.state.snapshot();
        snapshot.sort_by_key(|(id, _)| *id);
        let mut want = vec![
            (b.id(), b.addrs().to_vec()),
            (a.id(), a.addrs().to_vec()),
        ];
        want.sort_by_key(|(id, _)| *id);
        assert_eq!(snapshot, want);
    }

    #[test]
    fn drain_closes_everything() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(8, 8));
        let a = h.add(above_of(local, 1), 10);
        let b = h.add(below_of(local, 1), 10);

        let drained = h.state.drain();
        assert_eq!(drained.len(), 2);
        assert!(!a.is_alive());
        assert!(!b.is_alive());
        assert_eq!(h.state.peer_count(), 0);
        assert!(h.state.random_leaf().is_none());
    }

    #[test]
    fn addrs_stay_sorted() {
        let local = nid(&[0x80]);
        let mut h = harness(local, &config(4, 4));
        h.state.push_addr("127.0.0.1:9000".into());
        h.state.push_addr("127.0.0.1:1000".into());
        assert_eq!(
            h.state.addrs(),
            vec!["127.0.0.1:1000".to_string(), "127.0.0.1:9000".to_string()]
        );
    }
}
