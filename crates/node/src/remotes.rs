//! Remote-node set: connected peers, handshake state, reported heights.

use concord_types::PeerId;
use std::collections::HashMap;

/// What we know about one connected peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteNode {
    /// Tip height the peer last reported.
    pub height: u64,
    /// Hello exchanged and genesis verified.
    pub handshaked: bool,
}

/// Tracks protocol handles for every connected peer.
#[derive(Debug, Default)]
pub struct RemoteNodeSet {
    peers: HashMap<PeerId, RemoteNode>,
    /// Total peers dropped over the node's lifetime, including benign
    /// transport-level drops.
    drops: u64,
}

impl RemoteNodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers that completed the handshake.
    pub fn handshaked_count(&self) -> usize {
        self.peers.values().filter(|p| p.handshaked).count()
    }

    pub fn peer_drops(&self) -> u64 {
        self.drops
    }

    pub fn get(&self, peer: PeerId) -> Option<&RemoteNode> {
        self.peers.get(&peer)
    }

    pub fn is_handshaked(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).is_some_and(|p| p.handshaked)
    }

    pub fn on_connected(&mut self, peer: PeerId) {
        self.peers.entry(peer).or_default();
    }

    pub fn mark_handshaked(&mut self, peer: PeerId, height: u64) {
        let entry = self.peers.entry(peer).or_default();
        entry.handshaked = true;
        entry.height = height;
    }

    pub fn update_height(&mut self, peer: PeerId, height: u64) {
        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.height = entry.height.max(height);
        }
    }

    pub fn remove(&mut self, peer: PeerId) -> bool {
        let removed = self.peers.remove(&peer).is_some();
        if removed {
            self.drops += 1;
        }
        removed
    }
}
