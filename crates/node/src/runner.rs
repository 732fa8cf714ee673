//! Tokio-based production runner.
//!
//! Owns all I/O the state machine delegates: timers, storage writes, dapp
//! callbacks, signature checks and network sends. The P2P overlay stays an
//! external collaborator behind the [`Transport`] trait; it feeds inbound
//! frames and connection events through the [`NodeHandle`].
//!
//! Shutdown is ordered: stop taking input → cancel timers → stop the
//! executor loop → drop the store handle.

use crate::responder::Responder;
use crate::state::NodeStateMachine;
use crate::timers::TimerManager;
use concord_core::{Action, Dapp, DappError, Event, NodeError, StateMachine};
use concord_messages::{decode_message, encode_message, ConsensusPayload, PeerMessage};
use concord_store::{BlockStore, StoreError};
use concord_types::{Block, Hash, PeerId, Transaction};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, error, info, warn};

/// The transport overlay seam.
///
/// Implementations deliver frames best-effort; transient failures are
/// treated as benign peer drops and surface as `PeerDisconnected` events.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, peer: PeerId, bytes: Vec<u8>);
    fn broadcast(&self, bytes: Vec<u8>);
    fn broadcast_except(&self, except: Option<PeerId>, bytes: Vec<u8>);
    fn disconnect(&self, peer: PeerId);
}

/// Map an inbound peer message to its state-machine event.
///
/// Returns `None` for `Get*` requests, which the responder answers
/// directly without touching the state machine.
pub fn event_for_message(peer: PeerId, message: PeerMessage) -> Option<Event> {
    match message {
        PeerMessage::Hello { height, genesis } => Some(Event::HelloReceived {
            peer,
            height,
            genesis,
        }),
        PeerMessage::NewTransaction { transaction } => Some(Event::TransactionReceived {
            source: Some(peer),
            tx: transaction,
        }),
        PeerMessage::NewBlockHeight { height } => {
            Some(Event::BlockHeightAnnounced { peer, height })
        }
        PeerMessage::NewBlock { block } => Some(Event::BlockAnnounced { peer, block }),
        PeerMessage::NewConsensusMessage { message } => Some(match message {
            ConsensusPayload::Proposal(proposal) => Event::ProposalReceived { proposal },
            ConsensusPayload::Vote(vote) => Event::VoteReceived { vote },
        }),
        PeerMessage::ConsentedHeader { header, commit } => Some(Event::ConsentedHeaderReceived {
            peer,
            header,
            commit,
        }),
        PeerMessage::Headers { headers } => Some(Event::HeadersReceived { peer, headers }),
        PeerMessage::Bodies { bodies } => Some(Event::BodiesReceived { peer, bodies }),
        PeerMessage::GetConsentedHeader { .. }
        | PeerMessage::GetHeaders { .. }
        | PeerMessage::GetBodies { .. } => None,
    }
}

/// External control surface for a running node.
///
/// Cloneable; the overlay glue holds one to feed frames and connection
/// events, the front-end holds one to submit transactions and subscribe.
pub struct NodeHandle<T: Transport> {
    events: mpsc::Sender<Event>,
    responder: Arc<Responder>,
    store: Arc<dyn BlockStore>,
    transport: Arc<T>,
    shutdown: Arc<Notify>,
    committed: broadcast::Sender<Arc<Block>>,
    errors: broadcast::Sender<NodeError>,
}

impl<T: Transport> Clone for NodeHandle<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            responder: Arc::clone(&self.responder),
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            shutdown: Arc::clone(&self.shutdown),
            committed: self.committed.clone(),
            errors: self.errors.clone(),
        }
    }
}

impl<T: Transport> NodeHandle<T> {
    /// Read access to the committed chain.
    pub fn blockchain(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Submit a transaction from the local client.
    pub async fn submit_transaction(&self, tx: Transaction) {
        let _ = self
            .events
            .send(Event::TransactionReceived { source: None, tx })
            .await;
    }

    /// The overlay accepted a connection.
    pub async fn peer_connected(&self, peer: PeerId) {
        let _ = self.events.send(Event::PeerConnected { peer }).await;
    }

    /// The overlay lost a connection.
    pub async fn peer_disconnected(&self, peer: PeerId) {
        let _ = self.events.send(Event::PeerDisconnected { peer }).await;
    }

    /// A length-delimited frame arrived from `peer`.
    ///
    /// Requests are answered inline from the store; everything else is
    /// queued for the state machine. Malformed frames drop the peer.
    pub async fn deliver_frame(&self, peer: PeerId, bytes: &[u8]) {
        let message = match decode_message(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "Malformed frame, dropping peer");
                self.transport.disconnect(peer);
                let _ = self.events.send(Event::PeerDisconnected { peer }).await;
                return;
            }
        };

        if message.is_request() {
            match self.responder.respond(&message) {
                Ok(Some(reply)) => self.transport.send(peer, encode_message(&reply)),
                Ok(None) => {}
                Err(e) => {
                    warn!(%peer, error = %e, "Bad request, dropping peer");
                    self.transport.disconnect(peer);
                    let _ = self.events.send(Event::PeerDisconnected { peer }).await;
                }
            }
            return;
        }

        if let Some(event) = event_for_message(peer, message) {
            let _ = self.events.send(event).await;
        }
    }

    /// Committed blocks, in order.
    pub fn subscribe_committed(&self) -> broadcast::Receiver<Arc<Block>> {
        self.committed.subscribe()
    }

    /// The node's error stream.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<NodeError> {
        self.errors.subscribe()
    }

    /// Request ordered shutdown.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
        self.shutdown.notify_one();
    }
}

/// The production runner: executes actions, feeds results back as events.
pub struct NodeRunner<T: Transport> {
    node: NodeStateMachine,
    store: Arc<dyn BlockStore>,
    dapp: Box<dyn Dapp>,
    transport: Arc<T>,
    timers: TimerManager,
    events_rx: mpsc::Receiver<Event>,
    /// Internal events jump the external queue to preserve causality.
    internal: VecDeque<Event>,
    shutdown: Arc<Notify>,
    committed: broadcast::Sender<Arc<Block>>,
    errors: broadcast::Sender<NodeError>,
    started_at: Instant,
    fatal: bool,
}

impl<T: Transport> NodeRunner<T> {
    /// Wire a runner around a node. The store must be `ready`.
    pub fn new(
        node: NodeStateMachine,
        store: Arc<dyn BlockStore>,
        dapp: Box<dyn Dapp>,
        transport: Arc<T>,
    ) -> (Self, NodeHandle<T>) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (committed, _) = broadcast::channel(256);
        let (errors, _) = broadcast::channel(64);
        let shutdown = Arc::new(Notify::new());
        let responder = Arc::new(Responder::new(Arc::clone(&store)));

        let handle = NodeHandle {
            events: events_tx.clone(),
            responder,
            store: Arc::clone(&store),
            transport: Arc::clone(&transport),
            shutdown: Arc::clone(&shutdown),
            committed: committed.clone(),
            errors: errors.clone(),
        };

        let runner = Self {
            node,
            store,
            dapp,
            transport,
            timers: TimerManager::new(events_tx),
            events_rx,
            internal: VecDeque::new(),
            shutdown,
            committed,
            errors,
            started_at: Instant::now(),
            fatal: false,
        };
        (runner, handle)
    }

    /// Run until stopped or a fatal error.
    pub async fn run(mut self) {
        // Replay committed-but-unexecuted blocks through the dapp before
        // consensus starts, so the app state hash is current.
        let replay = self.collect_replay();
        let actions = self.node.replay_unexecuted(replay);
        self.process_actions(actions);
        let actions = self.node.start();
        self.process_actions(actions);
        self.drain_internal();

        info!(height = self.node.height(), "Node running");
        loop {
            if self.fatal {
                break;
            }
            let event = tokio::select! {
                _ = self.shutdown.notified() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.dispatch(event);
            self.drain_internal();
        }

        // Ordered shutdown: no new input, kill timers, stop the executor
        // loop; the store handle drops with self.
        info!("Node stopping");
        self.events_rx.close();
        self.timers.cancel_all();
        self.node.stop();
    }

    fn collect_replay(&self) -> Vec<Arc<Block>> {
        let (executed, _) = self.store.executed().unwrap_or((0, Hash::ZERO));
        let tip = self.store.height();
        let mut blocks = Vec::new();
        for height in executed + 1..=tip {
            match self.store.block_of(height) {
                Ok(block) => blocks.push(Arc::new(block)),
                Err(e) => {
                    warn!(height, error = %e, "Replay read failed");
                    break;
                }
            }
        }
        if !blocks.is_empty() {
            info!(count = blocks.len(), "Replaying unexecuted blocks");
        }
        blocks
    }

    fn drain_internal(&mut self) {
        while let Some(event) = self.internal.pop_front() {
            if self.fatal {
                return;
            }
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: Event) {
        self.node.set_time(self.started_at.elapsed());
        let actions = self.node.handle(event);
        self.process_actions(actions);
    }

    fn process_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.process_action(action);
            if self.fatal {
                return;
            }
        }
    }

    fn process_action(&mut self, action: Action) {
        match action {
            Action::Broadcast { message } => {
                self.transport.broadcast(encode_message(&message));
            }
            Action::SendTo { peer, message } => {
                self.transport.send(peer, encode_message(&message));
            }
            Action::GossipExcept { except, message } => {
                self.transport
                    .broadcast_except(except, encode_message(&message));
            }
            Action::DropPeer { peer, reason } => {
                debug!(%peer, ?reason, "Dropping peer");
                self.transport.disconnect(peer);
                self.internal.push_back(Event::PeerDisconnected { peer });
            }

            Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),
            Action::CancelTimer { id } => self.timers.cancel_timer(id),

            Action::ValidateTransaction { source, tx } => {
                let verdict = if !tx.verify_signature() {
                    concord_core::TxVerdict::BadSignature
                } else if !self.dapp.validate_transaction(&tx) {
                    concord_core::TxVerdict::AppRejected
                } else {
                    concord_core::TxVerdict::Valid
                };
                self.internal.push_back(Event::TransactionValidated {
                    source,
                    tx,
                    verdict,
                });
            }

            Action::VerifyProposalSignature {
                proposal,
                public_key,
            } => {
                let valid = proposal.verify(&public_key);
                self.internal
                    .push_back(Event::ProposalSignatureVerified { proposal, valid });
            }

            Action::VerifyVoteSignature { vote, public_key } => {
                let valid = vote.verify(&public_key);
                self.internal
                    .push_back(Event::VoteSignatureVerified { vote, valid });
            }

            Action::SelectTransactions {
                height,
                round,
                candidates,
                max,
            } => {
                let mut transactions = self.dapp.select_transactions(candidates);
                transactions.truncate(max);
                self.internal.push_back(Event::TransactionsSelected {
                    height,
                    round,
                    transactions,
                });
            }

            Action::ExecuteBlock { block } => self.execute_block(block),

            Action::PersistOwnVote {
                height,
                round,
                step,
                block_hash,
            } => {
                let result = self.store.record_own_vote(concord_store::OwnVote {
                    height,
                    round,
                    step,
                    block_hash,
                });
                if let Err(e) = result {
                    self.fatal_error(NodeError::Store {
                        reason: e.to_string(),
                    });
                }
            }

            Action::CommitBlock { block, commit } => {
                match self.store.put(&block, &commit) {
                    Ok(()) => self
                        .internal
                        .push_back(Event::BlockCommitted { block, commit }),
                    // A block the engine certified must persist; failure
                    // here is a programmer error or a dying disk.
                    Err(e) => self.fatal_error(NodeError::Store {
                        reason: format!("commit of certified block failed: {e}"),
                    }),
                }
            }

            Action::ApplySyncedBlock {
                peer,
                block,
                commit,
            } => {
                let height = block.header.height;
                match self.store.put(&block, &commit) {
                    Ok(()) => self
                        .internal
                        .push_back(Event::BlockCommitted { block, commit }),
                    Err(StoreError::Database(reason)) => {
                        self.fatal_error(NodeError::Store { reason })
                    }
                    Err(e) => {
                        debug!(%peer, height, error = %e, "Synced block rejected");
                        self.internal
                            .push_back(Event::SyncApplyFailed { peer, height });
                    }
                }
            }

            Action::EmitCommittedBlock { block } => {
                let _ = self.committed.send(block);
            }

            Action::EmitError { error } => {
                if error.is_fatal() {
                    self.fatal_error(error);
                } else {
                    debug!(%error, "Non-fatal error");
                    let _ = self.errors.send(error);
                }
            }
        }
    }

    fn execute_block(&mut self, block: Arc<Block>) {
        let height = block.header.height;
        let mut tx_hashes = Vec::with_capacity(block.body.transactions.len());
        for tx in block.body.transactions.iter() {
            tx_hashes.push(tx.hash());
            match self.dapp.execute_transaction(tx) {
                Ok(()) => {}
                // Byzantine proposers may include junk; a rejection is a
                // valid outcome and execution continues.
                Err(DappError::Rejected(reason)) => {
                    debug!(height, tx = %tx.hash(), reason, "Transaction rejected by dapp");
                }
                Err(DappError::Fault(reason)) => {
                    self.fatal_error(NodeError::ExecutorFault { reason });
                    return;
                }
            }
        }

        let app_state_hash = self.dapp.app_state_hash();
        if let Err(e) = self.store.set_executed(height, app_state_hash) {
            self.fatal_error(NodeError::Store {
                reason: e.to_string(),
            });
            return;
        }
        self.internal.push_back(Event::BlockExecuted {
            height,
            app_state_hash,
            tx_hashes,
        });
    }

    fn fatal_error(&mut self, error: NodeError) {
        error!(%error, "Fatal error, stopping node");
        let _ = self.errors.send(error);
        self.fatal = true;
    }
}
