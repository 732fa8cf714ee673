//! Deterministic simulation runner.
//!
//! Each node has its own in-memory store and dapp. When a node emits
//! delegated work (signature checks, dapp calls, store writes), the runner
//! performs it inline, so a whole network runs single-threaded on a
//! virtual clock. Wire messages are encoded and decoded through the real
//! codec on every hop.

use crate::dapp::HashChainDapp;
use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use concord_core::{
    Action, Dapp, DappError, Event, NodeConfig, NodeError, StateMachine, TimerId, TxVerdict,
};
use concord_engine::RecoveredVotes;
use concord_messages::{decode_message, encode_message, PeerMessage};
use concord_node::{event_for_message, NodeStateMachine, Responder};
use concord_store::{BlockStore, MemoryStore, StoreError};
use concord_types::{
    Block, Commit, GenesisConfig, Hash, KeyPair, PeerId, Transaction, ValidatorEntry,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Index of a simulated node; doubles as its `PeerId`.
pub type NodeIndex = u32;

/// What travels through the global queue.
#[derive(Debug)]
enum QueuedItem {
    /// An event for the destination node.
    Event(Event),
    /// An encoded wire frame from another node.
    Frame { from: NodeIndex, bytes: Vec<u8> },
}

/// Deterministic simulation runner.
///
/// Processes items in `(time, priority, sequence)` order and executes
/// actions inline. Given the same seed, every run produces identical
/// results.
pub struct SimulationRunner {
    nodes: Vec<NodeStateMachine>,
    stores: Vec<Arc<dyn BlockStore>>,
    dapps: Vec<HashChainDapp>,
    responders: Vec<Responder>,
    keys: Vec<KeyPair>,
    genesis: Block,

    network: SimulatedNetwork,
    rng: ChaCha8Rng,

    queue: BTreeMap<EventKey, QueuedItem>,
    sequence: u64,
    now: Duration,
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    committed: Vec<Vec<Arc<Block>>>,
    errors: Vec<Vec<NodeError>>,
}

impl SimulationRunner {
    /// Build a network of validators with equal voting power.
    pub fn new(network_config: NetworkConfig, seed: u64) -> Self {
        Self::with_node_config(network_config, NodeConfig::default(), seed)
    }

    pub fn with_node_config(
        network_config: NetworkConfig,
        node_config: NodeConfig,
        seed: u64,
    ) -> Self {
        let num = network_config.num_validators;
        let keys: Vec<KeyPair> = (0..num)
            .map(|i| {
                let mut seed_bytes = [0u8; 32];
                let key_seed = seed.wrapping_add(i as u64).wrapping_mul(0x517cc1b727220a95);
                seed_bytes[..8].copy_from_slice(&key_seed.to_le_bytes());
                seed_bytes[8..16].copy_from_slice(&(i as u64).to_le_bytes());
                KeyPair::from_seed(&seed_bytes)
            })
            .collect();

        let genesis = GenesisConfig {
            validators: keys
                .iter()
                .map(|k| ValidatorEntry {
                    public_key: k.public_key(),
                    voting_power: 1,
                })
                .collect(),
            timestamp: 0,
            app_state_hash: Hash::of(b"genesis-app"),
        }
        .genesis_block();

        let mut stores: Vec<Arc<dyn BlockStore>> = Vec::new();
        let mut dapps = Vec::new();
        let mut responders = Vec::new();
        let mut nodes = Vec::new();
        for key in &keys {
            let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new());
            store.ready(&genesis).expect("fresh store accepts genesis");
            responders.push(Responder::new(Arc::clone(&store)));
            stores.push(store);
            dapps.push(HashChainDapp::new(genesis.header.app_state_hash));
            nodes.push(NodeStateMachine::new(
                node_config.clone(),
                key.clone(),
                genesis.hash(),
                &genesis,
                Commit::empty(),
                0,
                genesis.header.app_state_hash,
                RecoveredVotes::default(),
            ));
        }

        info!(num_validators = num, seed, "Created simulation");
        Self {
            nodes,
            stores,
            dapps,
            responders,
            keys,
            genesis,
            network: SimulatedNetwork::new(network_config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            timers: HashMap::new(),
            committed: (0..num).map(|_| Vec::new()).collect(),
            errors: (0..num).map(|_| Vec::new()).collect(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn num_nodes(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    pub fn keys(&self) -> &[KeyPair] {
        &self.keys
    }

    pub fn node(&self, node: NodeIndex) -> &NodeStateMachine {
        &self.nodes[node as usize]
    }

    pub fn store(&self, node: NodeIndex) -> &Arc<dyn BlockStore> {
        &self.stores[node as usize]
    }

    pub fn dapp(&self, node: NodeIndex) -> &HashChainDapp {
        &self.dapps[node as usize]
    }

    pub fn height(&self, node: NodeIndex) -> u64 {
        self.stores[node as usize].height()
    }

    pub fn committed_blocks(&self, node: NodeIndex) -> &[Arc<Block>] {
        &self.committed[node as usize]
    }

    pub fn errors(&self, node: NodeIndex) -> &[NodeError] {
        &self.errors[node as usize]
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// The proposer index for `(height, round)` under the genesis set.
    pub fn proposer_at(&self, height: u64, round: u32) -> u32 {
        self.genesis
            .body
            .next_validator_set
            .proposer_index(height, round)
    }

    // ── Setup ────────────────────────────────────────────────────────────

    /// Start every node's state machine (arms initial timers).
    pub fn start_nodes(&mut self) {
        for node in 0..self.nodes.len() as NodeIndex {
            let actions = self.nodes[node as usize].start();
            self.process_actions(node, actions);
        }
    }

    /// Connect two nodes; both sides handshake.
    pub fn connect(&mut self, a: NodeIndex, b: NodeIndex) {
        self.network.connect(a, b);
        self.schedule(a, Duration::ZERO, Event::PeerConnected { peer: PeerId(b as u64) });
        self.schedule(b, Duration::ZERO, Event::PeerConnected { peer: PeerId(a as u64) });
    }

    /// Fully connect a set of nodes.
    pub fn connect_all(&mut self, nodes: &[NodeIndex]) {
        for (i, &a) in nodes.iter().enumerate() {
            for &b in &nodes[i + 1..] {
                self.connect(a, b);
            }
        }
    }

    /// Submit a transaction at the local client of `node`.
    pub fn submit_transaction(&mut self, node: NodeIndex, tx: Transaction) {
        self.schedule(
            node,
            Duration::ZERO,
            Event::TransactionReceived { source: None, tx },
        );
    }

    /// Inject an arbitrary event after `delay` (test hook).
    pub fn schedule(&mut self, node: NodeIndex, delay: Duration, event: Event) {
        let time = self.now + delay;
        self.push(node, time, QueuedItem::Event(event));
    }

    // ── Main loop ────────────────────────────────────────────────────────

    /// Run the simulation until the virtual clock reaches `end`.
    pub fn run_until(&mut self, end: Duration) {
        while let Some((&key, _)) = self.queue.first_key_value() {
            if key.time > end {
                break;
            }
            let (key, item) = self.queue.pop_first().expect("non-empty");
            self.now = key.time;
            let node = key.node;

            if self.network.is_offline(node) {
                continue;
            }

            let event = match item {
                QueuedItem::Event(event) => Some(event),
                QueuedItem::Frame { from, bytes } => self.open_frame(node, from, &bytes),
            };
            let Some(event) = event else { continue };

            trace!(now = ?self.now, node, event = event.type_name(), "Processing");
            self.nodes[node as usize].set_time(self.now);
            let actions = self.nodes[node as usize].handle(event);
            self.process_actions(node, actions);
        }
        self.now = end;
    }

    /// Run for an additional stretch of virtual time.
    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;
        self.run_until(end);
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn push(&mut self, node: NodeIndex, time: Duration, item: QueuedItem) -> EventKey {
        let priority = match &item {
            QueuedItem::Event(event) => event.priority(),
            QueuedItem::Frame { .. } => concord_core::EventPriority::Network,
        };
        let key = EventKey {
            time,
            priority,
            sequence: self.sequence,
            node,
        };
        self.sequence += 1;
        self.queue.insert(key, item);
        key
    }

    /// Decode a delivered frame; requests are answered from the store
    /// right here, everything else becomes an event.
    fn open_frame(&mut self, node: NodeIndex, from: NodeIndex, bytes: &[u8]) -> Option<Event> {
        let message = match decode_message(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(node, from, error = %e, "Malformed frame in simulation");
                return None;
            }
        };

        if message.is_request() {
            match self.responders[node as usize].respond(&message) {
                Ok(Some(reply)) => self.deliver(node, from, &reply),
                Ok(None) => {}
                Err(e) => {
                    debug!(node, from, error = %e, "Bad request, dropping peer");
                    self.disconnect_pair(node, from);
                }
            }
            return None;
        }

        event_for_message(PeerId(from as u64), message)
    }

    fn deliver(&mut self, from: NodeIndex, to: NodeIndex, message: &PeerMessage) {
        if to as usize >= self.nodes.len() {
            return;
        }
        if let Some(delay) = self.network.sample_delivery(from, to, &mut self.rng) {
            let bytes = encode_message(message);
            let time = self.now + delay;
            self.push(to, time, QueuedItem::Frame { from, bytes });
        }
    }

    fn disconnect_pair(&mut self, a: NodeIndex, b: NodeIndex) {
        self.network.disconnect(a, b);
        if (a as usize) < self.nodes.len() {
            self.schedule(a, Duration::ZERO, Event::PeerDisconnected { peer: PeerId(b as u64) });
        }
        if (b as usize) < self.nodes.len() {
            self.schedule(b, Duration::ZERO, Event::PeerDisconnected { peer: PeerId(a as u64) });
        }
    }

    fn process_actions(&mut self, from: NodeIndex, actions: Vec<Action>) {
        for action in actions {
            self.process_action(from, action);
        }
    }

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for to in self.network.peers_of(from) {
                    self.deliver(from, to, &message);
                }
            }
            Action::SendTo { peer, message } => {
                self.deliver(from, peer.0 as NodeIndex, &message);
            }
            Action::GossipExcept { except, message } => {
                for to in self.network.peers_of(from) {
                    if Some(PeerId(to as u64)) != except {
                        self.deliver(from, to, &message);
                    }
                }
            }
            Action::DropPeer { peer, reason } => {
                debug!(node = from, %peer, ?reason, "Dropping peer");
                self.disconnect_pair(from, peer.0 as NodeIndex);
            }

            Action::SetTimer { id, duration } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.queue.remove(&old);
                }
                let time = self.now + duration;
                let key = self.push(from, time, QueuedItem::Event(id.to_event()));
                self.timers.insert((from, id), key);
            }
            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.queue.remove(&key);
                }
            }

            // Delegated work executes inline and instantly.
            Action::ValidateTransaction { source, tx } => {
                let verdict = if !tx.verify_signature() {
                    TxVerdict::BadSignature
                } else if !self.dapps[from as usize].validate_transaction(&tx) {
                    TxVerdict::AppRejected
                } else {
                    TxVerdict::Valid
                };
                self.schedule(
                    from,
                    Duration::ZERO,
                    Event::TransactionValidated {
                        source,
                        tx,
                        verdict,
                    },
                );
            }
            Action::VerifyProposalSignature {
                proposal,
                public_key,
            } => {
                let valid = proposal.verify(&public_key);
                self.schedule(
                    from,
                    Duration::ZERO,
                    Event::ProposalSignatureVerified { proposal, valid },
                );
            }
            Action::VerifyVoteSignature { vote, public_key } => {
                let valid = vote.verify(&public_key);
                self.schedule(
                    from,
                    Duration::ZERO,
                    Event::VoteSignatureVerified { vote, valid },
                );
            }
            Action::SelectTransactions {
                height,
                round,
                candidates,
                max,
            } => {
                let mut transactions = self.dapps[from as usize].select_transactions(candidates);
                transactions.truncate(max);
                self.schedule(
                    from,
                    Duration::ZERO,
                    Event::TransactionsSelected {
                        height,
                        round,
                        transactions,
                    },
                );
            }

            Action::ExecuteBlock { block } => self.execute_block(from, block),

            Action::PersistOwnVote {
                height,
                round,
                step,
                block_hash,
            } => {
                let _ = self.stores[from as usize].record_own_vote(concord_store::OwnVote {
                    height,
                    round,
                    step,
                    block_hash,
                });
            }

            Action::CommitBlock { block, commit } => {
                match self.stores[from as usize].put(&block, &commit) {
                    Ok(()) => {
                        self.schedule(
                            from,
                            Duration::ZERO,
                            Event::BlockCommitted { block, commit },
                        );
                    }
                    Err(e) => {
                        // A certified block failing to persist is fatal.
                        self.fatal(from, NodeError::Store {
                            reason: e.to_string(),
                        });
                    }
                }
            }

            Action::ApplySyncedBlock {
                peer,
                block,
                commit,
            } => {
                let height = block.header.height;
                match self.stores[from as usize].put(&block, &commit) {
                    Ok(()) => {
                        self.schedule(
                            from,
                            Duration::ZERO,
                            Event::BlockCommitted { block, commit },
                        );
                    }
                    Err(StoreError::Database(reason)) => {
                        self.fatal(from, NodeError::Store { reason });
                    }
                    Err(e) => {
                        debug!(node = from, height, error = %e, "Synced block rejected");
                        self.schedule(
                            from,
                            Duration::ZERO,
                            Event::SyncApplyFailed { peer, height },
                        );
                    }
                }
            }

            Action::EmitCommittedBlock { block } => {
                self.committed[from as usize].push(block);
            }

            Action::EmitError { error } => {
                if error.is_fatal() {
                    self.fatal(from, error);
                } else {
                    self.errors[from as usize].push(error);
                }
            }
        }
    }

    fn execute_block(&mut self, from: NodeIndex, block: Arc<Block>) {
        let height = block.header.height;
        let dapp = &mut self.dapps[from as usize];
        let mut tx_hashes = Vec::with_capacity(block.body.transactions.len());
        for tx in block.body.transactions.iter() {
            tx_hashes.push(tx.hash());
            match dapp.execute_transaction(tx) {
                Ok(()) | Err(DappError::Rejected(_)) => {}
                Err(DappError::Fault(reason)) => {
                    self.fatal(from, NodeError::ExecutorFault { reason });
                    return;
                }
            }
        }
        let app_state_hash = dapp.app_state_hash();
        let _ = self.stores[from as usize].set_executed(height, app_state_hash);
        self.schedule(
            from,
            Duration::ZERO,
            Event::BlockExecuted {
                height,
                app_state_hash,
                tx_hashes,
            },
        );
    }

    fn fatal(&mut self, node: NodeIndex, error: NodeError) {
        warn!(node, %error, "Fatal error, node stops");
        self.errors[node as usize].push(error);
        self.network.set_offline(node);
    }
}
