//! Synchronizer state.

use concord_core::{Action, DropReason, SyncConfig, TimerId};
use concord_messages::PeerMessage;
use concord_types::{Block, BlockBody, BlockHeader, Commit, Hash, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Per-peer sync bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
struct PeerSync {
    /// Tip height the peer last reported.
    height: u64,
    /// Consecutive failures (timeouts, invalid answers).
    failures: u32,
}

/// What the synchronizer is waiting for.
#[derive(Debug)]
enum Phase {
    Idle,
    /// Sent `GetHeaders`, awaiting the answer.
    FetchingHeaders {
        peer: PeerId,
        from: u64,
        count: u64,
        since: Duration,
    },
    /// Headers validated; sent `GetBodies`.
    FetchingBodies {
        peer: PeerId,
        headers: Vec<BlockHeader>,
        since: Duration,
    },
    /// Awaiting the commit certificate for a batch's final block.
    FetchingTipCommit {
        peer: PeerId,
        block: Box<Block>,
        since: Duration,
    },
}

/// Synchronizer state machine.
pub struct SyncState {
    config: SyncConfig,

    /// Local committed tip (height, hash); follows `BlockCommitted`.
    local_height: u64,
    local_tip_hash: Hash,

    peers: HashMap<PeerId, PeerSync>,
    /// Round-robin cursor over eligible peers.
    cursor: usize,

    phase: Phase,

    /// Highest height handed to the store but not yet confirmed committed.
    /// No new fetch starts below this, so batches never overlap.
    applying_until: Option<u64>,

    /// The consensus engine has voted at `local_height + 1`; the store tip
    /// belongs to the engine until that height commits.
    engine_active: bool,

    now: Duration,
}

impl SyncState {
    pub fn new(config: SyncConfig, local_height: u64, local_tip_hash: Hash) -> Self {
        Self {
            config,
            local_height,
            local_tip_hash,
            peers: HashMap::new(),
            cursor: 0,
            phase: Phase::Idle,
            applying_until: None,
            engine_active: false,
            now: Duration::ZERO,
        }
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    /// Arm the periodic tick. Called once at startup; each tick re-arms.
    pub fn start(&mut self) -> Vec<Action> {
        vec![self.tick_timer()]
    }

    /// Highest height any peer has reported.
    pub fn target_height(&self) -> u64 {
        self.peers
            .values()
            .map(|p| p.height)
            .max()
            .unwrap_or(0)
            .max(self.local_height)
    }

    /// Idle when the local tip has caught up with every peer. The engine
    /// is gated on this before proposing.
    pub fn is_idle(&self) -> bool {
        self.local_height >= self.target_height()
    }

    /// Gate set by the coordinator once the engine votes at the next
    /// height; released when that height commits.
    pub fn set_engine_active(&mut self, active: bool) {
        self.engine_active = active;
    }

    // ── Peer tracking ─────────────────────────────────────────────────────

    /// A peer completed its handshake with this reported height.
    pub fn on_peer_registered(&mut self, peer: PeerId, height: u64) -> Vec<Action> {
        self.peers.insert(peer, PeerSync { height, failures: 0 });
        debug!(%peer, height, "Registered sync peer");
        self.maybe_start_fetch()
    }

    /// Peer announced a new committed tip.
    pub fn on_block_height_announced(&mut self, peer: PeerId, height: u64) -> Vec<Action> {
        match self.peers.get_mut(&peer) {
            Some(state) => state.height = state.height.max(height),
            // Announcement before the handshake completed; ignore.
            None => return vec![],
        }
        trace!(%peer, height, "Peer height updated");
        self.maybe_start_fetch()
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId) -> Vec<Action> {
        self.peers.remove(&peer);
        if self.phase_peer() == Some(peer) {
            debug!(%peer, "In-flight sync peer disconnected, retrying elsewhere");
            self.phase = Phase::Idle;
            return self.maybe_start_fetch();
        }
        vec![]
    }

    // ── Push path ─────────────────────────────────────────────────────────

    /// Peer pushed a freshly committed block.
    ///
    /// If it fills the local gap, fetch its commit certificate and apply;
    /// if it is further ahead, treat it as a height announcement.
    pub fn on_block_announced(&mut self, peer: PeerId, block: Box<Block>) -> Vec<Action> {
        let height = block.header.height;
        if let Some(state) = self.peers.get_mut(&peer) {
            state.height = state.height.max(height);
        }

        if height != self.local_height + 1 {
            return self.maybe_start_fetch();
        }
        if !matches!(self.phase, Phase::Idle) || self.applying() || self.engine_active {
            return vec![];
        }
        if block.header.last_block_hash != self.local_tip_hash {
            warn!(%peer, height, "Announced block does not link to local tip");
            return self.fail_peer(peer, DropReason::InvalidData);
        }

        debug!(%peer, height, "Fetching commit for announced block");
        let actions = vec![Action::SendTo {
            peer,
            message: PeerMessage::GetConsentedHeader { height },
        }];
        self.phase = Phase::FetchingTipCommit {
            peer,
            block,
            since: self.now,
        };
        actions
    }

    // ── Fetch pipeline ────────────────────────────────────────────────────

    /// Response to `GetHeaders`.
    pub fn on_headers_received(
        &mut self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
    ) -> Vec<Action> {
        let (expected, from, count) = match &self.phase {
            Phase::FetchingHeaders {
                peer, from, count, ..
            } => (*peer, *from, *count),
            _ => {
                trace!(%peer, "Unsolicited headers ignored");
                return vec![];
            }
        };
        if peer != expected {
            return vec![];
        }

        if headers.is_empty() || headers.len() as u64 > count {
            warn!(%peer, got = headers.len(), "Bad header count from peer");
            return self.fail_peer(peer, DropReason::InvalidData);
        }

        // Linkage validation: contiguous heights rooted at our tip.
        let mut prev_hash = self.local_tip_hash;
        for (i, header) in headers.iter().enumerate() {
            if header.height != from + i as u64 || header.last_block_hash != prev_hash {
                warn!(%peer, height = header.height, "Header chain does not link");
                return self.fail_peer(peer, DropReason::InvalidData);
            }
            prev_hash = header.hash();
        }

        let heights: Vec<u64> = headers.iter().map(|h| h.height).collect();
        debug!(%peer, from, count = heights.len(), "Headers linked, fetching bodies");
        self.phase = Phase::FetchingBodies {
            peer,
            headers,
            since: self.now,
        };
        vec![Action::SendTo {
            peer,
            message: PeerMessage::GetBodies { heights },
        }]
    }

    /// Response to `GetBodies`.
    pub fn on_bodies_received(&mut self, peer: PeerId, bodies: Vec<BlockBody>) -> Vec<Action> {
        let headers = match &self.phase {
            Phase::FetchingBodies { peer: expected, headers, .. } if *expected == peer => {
                headers.clone()
            }
            _ => {
                trace!(%peer, "Unsolicited bodies ignored");
                return vec![];
            }
        };

        if bodies.len() != headers.len() {
            warn!(%peer, want = headers.len(), got = bodies.len(), "Body count mismatch");
            return self.fail_peer(peer, DropReason::InvalidData);
        }

        let mut blocks = Vec::with_capacity(headers.len());
        for (header, body) in headers.into_iter().zip(bodies) {
            let block = Block { header, body };
            if let Err(e) = block.verify_internal() {
                warn!(%peer, height = block.header.height, error = %e, "Body does not match header");
                return self.fail_peer(peer, DropReason::InvalidData);
            }
            blocks.push(block);
        }

        // Each block is proven by the next body's commit; the batch tip
        // needs a ConsentedHeader round trip.
        let mut actions = Vec::new();
        let last = blocks.len() - 1;
        for i in 0..last {
            let commit = blocks[i + 1].body.last_commit.clone();
            actions.push(Action::ApplySyncedBlock {
                peer,
                block: Arc::new(blocks[i].clone()),
                commit,
            });
        }
        let tip = Box::new(blocks[last].clone());
        let tip_height = tip.header.height;
        if last > 0 {
            self.applying_until = Some(tip_height - 1);
        }

        debug!(%peer, applying = last, tip = tip_height, "Applying synced batch");
        actions.push(Action::SendTo {
            peer,
            message: PeerMessage::GetConsentedHeader { height: tip_height },
        });
        self.phase = Phase::FetchingTipCommit {
            peer,
            block: tip,
            since: self.now,
        };
        actions
    }

    /// Response to `GetConsentedHeader`.
    pub fn on_consented_header_received(
        &mut self,
        peer: PeerId,
        header: Box<BlockHeader>,
        commit: Commit,
    ) -> Vec<Action> {
        let block = match &self.phase {
            Phase::FetchingTipCommit { peer: expected, block, .. } if *expected == peer => {
                block.clone()
            }
            _ => {
                trace!(%peer, "Unsolicited consented header ignored");
                return vec![];
            }
        };

        if header.hash() != block.hash()
            || commit
                .verify(block.hash(), block.header.height, &block.body.next_validator_set)
                .is_err()
        {
            warn!(%peer, height = block.header.height, "Invalid commit certificate for synced tip");
            return self.fail_peer(peer, DropReason::InvalidData);
        }

        let height = block.header.height;
        self.applying_until = Some(self.applying_until.map_or(height, |u| u.max(height)));
        self.phase = Phase::Idle;
        debug!(%peer, height, "Applying synced tip block");
        vec![Action::ApplySyncedBlock {
            peer,
            block: Arc::new(*block),
            commit,
        }]
    }

    // ── Store feedback ────────────────────────────────────────────────────

    /// A block reached the store (either path).
    pub fn on_block_committed(&mut self, height: u64, hash: Hash) -> Vec<Action> {
        if height > self.local_height {
            self.local_height = height;
            self.local_tip_hash = hash;
        }
        if self.applying_until.is_some_and(|until| height >= until) {
            self.applying_until = None;
            if self.is_idle() {
                info!(height, "Sync complete");
            }
        }
        self.maybe_start_fetch()
    }

    /// A synced block failed store validation: drop the peer, restart.
    pub fn on_apply_failed(&mut self, peer: PeerId, height: u64) -> Vec<Action> {
        warn!(%peer, height, "Synced block failed to apply");
        self.applying_until = None;
        self.fail_peer(peer, DropReason::InvalidData)
    }

    // ── Timeouts ──────────────────────────────────────────────────────────

    /// Periodic tick: detect request timeouts and keep fetching.
    pub fn on_tick(&mut self) -> Vec<Action> {
        let mut actions = vec![self.tick_timer()];

        if let Some((peer, since)) = self.phase_deadline() {
            if self.now.saturating_sub(since) > self.config.request_timeout {
                warn!(%peer, "Sync request timed out");
                actions.extend(self.fail_peer(peer, DropReason::Timeout));
                return actions;
            }
        }

        actions.extend(self.maybe_start_fetch());
        actions
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn tick_timer(&self) -> Action {
        Action::SetTimer {
            id: TimerId::Sync,
            duration: self.config.tick_interval,
        }
    }

    fn applying(&self) -> bool {
        self.applying_until.is_some()
    }

    fn phase_peer(&self) -> Option<PeerId> {
        match &self.phase {
            Phase::Idle => None,
            Phase::FetchingHeaders { peer, .. }
            | Phase::FetchingBodies { peer, .. }
            | Phase::FetchingTipCommit { peer, .. } => Some(*peer),
        }
    }

    fn phase_deadline(&self) -> Option<(PeerId, Duration)> {
        match &self.phase {
            Phase::Idle => None,
            Phase::FetchingHeaders { peer, since, .. }
            | Phase::FetchingBodies { peer, since, .. }
            | Phase::FetchingTipCommit { peer, since, .. } => Some((*peer, *since)),
        }
    }

    /// Record a failure, drop the peer, and retry with another.
    fn fail_peer(&mut self, peer: PeerId, reason: DropReason) -> Vec<Action> {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.failures += 1;
        }
        if self.phase_peer() == Some(peer) {
            self.phase = Phase::Idle;
        }
        let mut actions = vec![Action::DropPeer { peer, reason }];
        actions.extend(self.maybe_start_fetch());
        actions
    }

    /// Begin a header fetch if we are behind and nothing is in flight.
    ///
    /// The engine gate only holds while the contested height (`local + 1`)
    /// is the one we are missing; once peers report heights beyond it, the
    /// network has finalized that height and certificates override our
    /// votes.
    fn maybe_start_fetch(&mut self) -> Vec<Action> {
        let engine_owns_tip =
            self.engine_active && self.target_height() <= self.local_height + 1;
        if !matches!(self.phase, Phase::Idle)
            || self.applying()
            || engine_owns_tip
            || self.is_idle()
        {
            return vec![];
        }

        let from = self.local_height + 1;
        let count = self
            .config
            .batch_size
            .min(self.target_height() - self.local_height);
        let Some(peer) = self.select_peer(from + count - 1) else {
            trace!(from, "No eligible sync peer");
            return vec![];
        };

        info!(%peer, from, count, target = self.target_height(), "Requesting headers");
        self.phase = Phase::FetchingHeaders {
            peer,
            from,
            count,
            since: self.now,
        };
        vec![Action::SendTo {
            peer,
            message: PeerMessage::GetHeaders { from, count },
        }]
    }

    /// Round-robin over peers that can serve up to `needed` and have not
    /// failed too often.
    fn select_peer(&mut self, needed: u64) -> Option<PeerId> {
        let mut eligible: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| s.height >= needed && s.failures < self.config.max_peer_failures)
            .map(|(p, _)| *p)
            .collect();
        if eligible.is_empty() {
            // Fall back to anyone claiming at least the next block.
            eligible = self
                .peers
                .iter()
                .filter(|(_, s)| {
                    s.height > self.local_height && s.failures < self.config.max_peer_failures
                })
                .map(|(p, _)| *p)
                .collect();
        }
        if eligible.is_empty() {
            return None;
        }
        eligible.sort();
        let peer = eligible[self.cursor % eligible.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(peer)
    }
}
