//! Node state machine.

use crate::remotes::RemoteNodeSet;
use concord_core::{
    Action, DropReason, Event, NodeConfig, NodeError, StateMachine, TimerId,
};
use concord_engine::{EngineState, RecoveredVotes};
use concord_executor::ExecutorState;
use concord_mempool::PoolState;
use concord_messages::PeerMessage;
use concord_store::{BlockStore, StoreError};
use concord_sync::SyncState;
use concord_types::{Block, Commit, Hash, KeyPair, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Combined node state machine.
///
/// Composes the consensus engine, transaction pool, executor and
/// synchronizer, owns the handshake and remote-node set, and routes every
/// event to the right sub-machine. The runner performs all I/O.
pub struct NodeStateMachine {
    config: NodeConfig,
    genesis_hash: Hash,

    engine: EngineState,
    pool: PoolState,
    executor: ExecutorState,
    sync: SyncState,
    remotes: RemoteNodeSet,
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("height", &self.engine.height())
            .field("round", &self.engine.round())
            .field("step", &self.engine.step())
            .field("pool", &self.pool.len())
            .field("peers", &self.remotes.len())
            .finish()
    }
}

impl NodeStateMachine {
    /// Assemble a node from recovered chain state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeConfig,
        key: KeyPair,
        genesis_hash: Hash,
        tip: &Block,
        last_commit: Commit,
        executed_height: u64,
        app_state_hash: Hash,
        recovered: RecoveredVotes,
    ) -> Self {
        let engine = EngineState::new(
            config.consensus.clone(),
            key,
            tip,
            last_commit,
            executed_height,
            app_state_hash,
            recovered,
        );
        let pool = PoolState::new(config.pool.clone());
        let executor = ExecutorState::new(executed_height, app_state_hash);
        let sync = SyncState::new(config.sync.clone(), tip.header.height, tip.hash());

        Self {
            config,
            genesis_hash,
            engine,
            pool,
            executor,
            sync,
            remotes: RemoteNodeSet::new(),
        }
    }

    /// Assemble a node by reading the recovered state from a store whose
    /// `ready` has been called.
    pub fn from_store(
        config: NodeConfig,
        key: KeyPair,
        store: &Arc<dyn BlockStore>,
    ) -> Result<Self, StoreError> {
        let genesis_hash = store.genesis_hash()?;
        let tip = store.block_of(store.height())?;
        let last_commit = store.last_commit()?;
        let (executed_height, app_state_hash) = store.executed()?;

        let mut recovered = RecoveredVotes::default();
        for vote in store.own_votes_above(store.height())? {
            recovered.insert(vote.height, vote.round, vote.step, vote.block_hash);
        }

        Ok(Self::new(
            config,
            key,
            genesis_hash,
            &tip,
            last_commit,
            executed_height,
            app_state_hash,
            recovered,
        ))
    }

    /// Start all subsystems. Returns the initial timer actions.
    pub fn start(&mut self) -> Vec<Action> {
        info!(
            height = self.engine.height(),
            validator = self.engine.is_validator(),
            "Starting node"
        );
        let mut actions = self.executor.start();
        actions.extend(self.sync.start());
        actions.extend(self.engine.set_sync_idle(self.sync.is_idle()));
        actions.extend(self.engine.start());
        self.finish(actions)
    }

    /// Queue committed-but-unexecuted blocks for replay at startup.
    pub fn replay_unexecuted(&mut self, blocks: Vec<Arc<Block>>) -> Vec<Action> {
        let mut actions = vec![];
        for block in blocks {
            actions.extend(self.executor.on_block_committed(block));
        }
        actions
    }

    /// Ordered shutdown of the sub-machines. Timers are the runner's to
    /// cancel; the executor stops dispatching new work here.
    pub fn stop(&mut self) {
        self.executor.stop();
    }

    pub fn engine(&self) -> &EngineState {
        &self.engine
    }

    pub fn pool(&self) -> &PoolState {
        &self.pool
    }

    pub fn executor(&self) -> &ExecutorState {
        &self.executor
    }

    pub fn sync(&self) -> &SyncState {
        &self.sync
    }

    pub fn remotes(&self) -> &RemoteNodeSet {
        &self.remotes
    }

    /// Local committed tip height.
    pub fn height(&self) -> u64 {
        self.engine.height().saturating_sub(1)
    }

    // ── Peer lifecycle ────────────────────────────────────────────────────

    fn on_peer_connected(&mut self, peer: PeerId) -> Vec<Action> {
        debug!(%peer, "Peer connected, sending hello");
        self.remotes.on_connected(peer);
        vec![
            Action::SendTo {
                peer,
                message: PeerMessage::Hello {
                    height: self.height(),
                    genesis: self.genesis_hash,
                },
            },
            Action::SetTimer {
                id: TimerId::Handshake { peer },
                duration: self.config.handshake_timeout,
            },
        ]
    }

    fn on_hello(&mut self, peer: PeerId, height: u64, genesis: Hash) -> Vec<Action> {
        if genesis != self.genesis_hash {
            warn!(%peer, theirs = %genesis, ours = %self.genesis_hash, "Foreign chain peer");
            return vec![
                Action::EmitError {
                    error: NodeError::ForeignChain { peer },
                },
                Action::DropPeer {
                    peer,
                    reason: DropReason::ForeignChain,
                },
            ];
        }

        info!(%peer, height, "Handshake complete");
        self.remotes.mark_handshaked(peer, height);
        let mut actions = vec![Action::CancelTimer {
            id: TimerId::Handshake { peer },
        }];
        actions.extend(self.sync.on_peer_registered(peer, height));
        actions
    }

    fn on_handshake_timer(&mut self, peer: PeerId) -> Vec<Action> {
        if self.remotes.is_handshaked(peer) {
            return vec![];
        }
        warn!(%peer, "Handshake timed out");
        vec![
            Action::EmitError {
                error: NodeError::HandshakeTimeout { peer },
            },
            Action::DropPeer {
                peer,
                reason: DropReason::HandshakeTimeout,
            },
        ]
    }

    fn on_peer_disconnected(&mut self, peer: PeerId) -> Vec<Action> {
        self.remotes.remove(peer);
        self.pool.on_peer_disconnected(peer);
        self.sync.on_peer_disconnected(peer)
    }

    // ── Commit fan-out ────────────────────────────────────────────────────

    fn on_block_committed(&mut self, block: Arc<Block>, commit: Commit) -> Vec<Action> {
        let height = block.header.height;
        let hash = block.hash();

        // Engine first (it may broadcast the new block), then the
        // executor (strict height order), then the synchronizer.
        let mut actions = self.engine.on_block_committed(&block, &commit);
        actions.extend(self.executor.on_block_committed(Arc::clone(&block)));
        actions.extend(self.sync.on_block_committed(height, hash));
        actions.push(Action::EmitCommittedBlock { block });
        actions
    }

    fn on_block_executed(
        &mut self,
        height: u64,
        app_state_hash: Hash,
        tx_hashes: Vec<Hash>,
    ) -> Vec<Action> {
        let mut actions = self.executor.on_block_executed(height, app_state_hash);
        actions.extend(self.pool.on_block_executed(&tx_hashes));
        actions.extend(self.engine.on_block_executed(height, app_state_hash));
        actions
    }

    // ── Post-pass over produced actions ───────────────────────────────────

    /// Fill coordinator-level data into actions and refresh the gates
    /// between sub-machines.
    fn finish(&mut self, mut actions: Vec<Action>) -> Vec<Action> {
        // Keep the engine's view of sync idleness current; becoming idle
        // may arm the next height's pacing timer.
        actions.extend(self.engine.set_sync_idle(self.sync.is_idle()));

        // Store mutual exclusion: once the engine has voted at the next
        // height, the synchronizer keeps its hands off the tip.
        self.sync
            .set_engine_active(self.engine.has_voted_current_height());

        for action in &mut actions {
            if let Action::SelectTransactions {
                candidates, max, ..
            } = action
            {
                if candidates.is_empty() {
                    *candidates = self.pool.candidates(*max);
                }
            }
        }

        actions
    }
}

impl StateMachine for NodeStateMachine {
    fn set_time(&mut self, now: Duration) {
        self.engine.set_time(now);
        self.sync.set_time(now);
    }

    fn handle(&mut self, event: Event) -> Vec<Action> {
        let actions = match event {
            // ── Timers ───────────────────────────────────────────────────
            Event::ConsensusTimeout {
                height,
                round,
                step,
            } => self.engine.on_timeout(height, round, step),
            Event::SyncTimer => self.sync.on_tick(),
            Event::HandshakeTimer { peer } => self.on_handshake_timer(peer),

            // ── Peer lifecycle ───────────────────────────────────────────
            Event::PeerConnected { peer } => self.on_peer_connected(peer),
            Event::PeerDisconnected { peer } => self.on_peer_disconnected(peer),
            Event::HelloReceived {
                peer,
                height,
                genesis,
            } => self.on_hello(peer, height, genesis),

            // ── Gossip and consensus messages ────────────────────────────
            Event::TransactionReceived { source, tx } => {
                match source {
                    // Peer-sourced transactions require a completed
                    // handshake; local submissions always pass.
                    Some(peer) if !self.remotes.is_handshaked(peer) => vec![],
                    _ => self.pool.on_transaction_received(source, tx),
                }
            }
            Event::BlockHeightAnnounced { peer, height } => {
                self.remotes.update_height(peer, height);
                self.sync.on_block_height_announced(peer, height)
            }
            Event::BlockAnnounced { peer, block } => {
                self.remotes.update_height(peer, block.header.height);
                self.sync.on_block_announced(peer, block)
            }
            Event::ProposalReceived { proposal } => self.engine.on_proposal(proposal),
            Event::VoteReceived { vote } => self.engine.on_vote(vote),

            // ── Sync responses ───────────────────────────────────────────
            Event::HeadersReceived { peer, headers } => {
                self.sync.on_headers_received(peer, headers)
            }
            Event::BodiesReceived { peer, bodies } => {
                self.sync.on_bodies_received(peer, bodies)
            }
            Event::ConsentedHeaderReceived {
                peer,
                header,
                commit,
            } => self.sync.on_consented_header_received(peer, header, commit),

            // ── Delegated-work callbacks ─────────────────────────────────
            Event::TransactionValidated {
                source,
                tx,
                verdict,
            } => self.pool.on_transaction_validated(source, tx, verdict),
            Event::ProposalSignatureVerified { proposal, valid } => {
                self.engine.on_proposal_verified(proposal, valid)
            }
            Event::VoteSignatureVerified { vote, valid } => {
                self.engine.on_vote_verified(vote, valid)
            }
            Event::TransactionsSelected {
                height,
                round,
                transactions,
            } => self
                .engine
                .on_transactions_selected(height, round, transactions),

            // ── Store and executor feedback ──────────────────────────────
            Event::BlockCommitted { block, commit } => self.on_block_committed(block, commit),
            Event::SyncApplyFailed { peer, height } => self.sync.on_apply_failed(peer, height),
            Event::BlockExecuted {
                height,
                app_state_hash,
                tx_hashes,
            } => self.on_block_executed(height, app_state_hash, tx_hashes),
        };

        self.finish(actions)
    }
}
