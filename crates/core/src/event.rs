//! Event types for the deterministic state machines.

use crate::TimeoutStep;
use concord_types::{Block, BlockBody, BlockHeader, Commit, Hash, PeerId, Proposal, Transaction,
    Vote};
use std::sync::Arc;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first). Internal events are
/// consequences of prior processing and must land before new inputs to
/// preserve causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    Internal = 0,
    Timer = 1,
    Network = 2,
    Client = 3,
}

/// Verdict of delegated transaction admission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxVerdict {
    /// Signature verifies and the application accepts it.
    Valid,
    /// Signature does not verify.
    BadSignature,
    /// Signature verifies but `validate_transaction` returned false.
    AppRejected,
}

/// All possible events a node can receive.
///
/// Events are **passive data** — they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ── Timers ────────────────────────────────────────────────────────────
    /// A consensus step timeout expired. Stale (height, round) pairs are
    /// ignored by the engine.
    ConsensusTimeout {
        height: u64,
        round: u32,
        step: TimeoutStep,
    },

    /// Periodic synchronizer tick.
    SyncTimer,

    /// Handshake deadline for a peer that has not sent `Hello`.
    HandshakeTimer { peer: PeerId },

    // ── Peer lifecycle (from the transport overlay) ───────────────────────
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },

    // ── Network messages ──────────────────────────────────────────────────
    /// Peer's handshake: its tip height and genesis hash.
    HelloReceived {
        peer: PeerId,
        height: u64,
        genesis: Hash,
    },

    /// A transaction arrived — from a peer, or from the local client when
    /// `source` is `None`.
    TransactionReceived {
        source: Option<PeerId>,
        tx: Transaction,
    },

    /// Peer announced a new committed tip height.
    BlockHeightAnnounced { peer: PeerId, height: u64 },

    /// Peer pushed a freshly committed block.
    BlockAnnounced { peer: PeerId, block: Box<Block> },

    /// Consensus proposal from a peer (or loopback from ourselves).
    ProposalReceived { proposal: Box<Proposal> },

    /// Consensus vote from a peer (or loopback from ourselves).
    VoteReceived { vote: Vote },

    /// Response to `GetHeaders`.
    HeadersReceived {
        peer: PeerId,
        headers: Vec<BlockHeader>,
    },

    /// Response to `GetBodies`.
    BodiesReceived {
        peer: PeerId,
        bodies: Vec<BlockBody>,
    },

    /// Response to `GetConsentedHeader`.
    ConsentedHeaderReceived {
        peer: PeerId,
        header: Box<BlockHeader>,
        commit: Commit,
    },

    // ── Delegated-work callbacks ──────────────────────────────────────────
    /// Admission checks for a transaction completed.
    ///
    /// Callback from `Action::ValidateTransaction`.
    TransactionValidated {
        source: Option<PeerId>,
        tx: Transaction,
        verdict: TxVerdict,
    },

    /// Proposal signature verification completed.
    ///
    /// Callback from `Action::VerifyProposalSignature`.
    ProposalSignatureVerified {
        proposal: Box<Proposal>,
        valid: bool,
    },

    /// Vote signature verification completed.
    ///
    /// Callback from `Action::VerifyVoteSignature`.
    VoteSignatureVerified { vote: Vote, valid: bool },

    /// The dapp ordered the proposer's candidate transactions.
    ///
    /// Callback from `Action::SelectTransactions`.
    TransactionsSelected {
        height: u64,
        round: u32,
        transactions: Vec<Transaction>,
    },

    /// A block passed `put` and is now the stored tip.
    ///
    /// Callback from `Action::CommitBlock` / `Action::ApplySyncedBlock`.
    /// Carries the certificate that proved the block; it becomes the
    /// `last_commit` of the next block's body.
    BlockCommitted { block: Arc<Block>, commit: Commit },

    /// A synced block failed store validation.
    ///
    /// Callback from `Action::ApplySyncedBlock`; the commit path never
    /// produces this (an invalid block there is a programmer error).
    SyncApplyFailed { peer: PeerId, height: u64 },

    /// The dapp finished executing a committed block.
    ///
    /// Callback from `Action::ExecuteBlock`. This is the pool-eviction
    /// signal and the engine's gate for starting the next height.
    BlockExecuted {
        height: u64,
        app_state_hash: Hash,
        tx_hashes: Vec<Hash>,
    },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::TransactionValidated { .. }
            | Event::ProposalSignatureVerified { .. }
            | Event::VoteSignatureVerified { .. }
            | Event::TransactionsSelected { .. }
            | Event::BlockCommitted { .. }
            | Event::SyncApplyFailed { .. }
            | Event::BlockExecuted { .. } => EventPriority::Internal,

            Event::ConsensusTimeout { .. } | Event::SyncTimer | Event::HandshakeTimer { .. } => {
                EventPriority::Timer
            }

            Event::PeerConnected { .. }
            | Event::PeerDisconnected { .. }
            | Event::HelloReceived { .. }
            | Event::BlockHeightAnnounced { .. }
            | Event::BlockAnnounced { .. }
            | Event::ProposalReceived { .. }
            | Event::VoteReceived { .. }
            | Event::HeadersReceived { .. }
            | Event::BodiesReceived { .. }
            | Event::ConsentedHeaderReceived { .. } => EventPriority::Network,

            Event::TransactionReceived { source, .. } => match source {
                Some(_) => EventPriority::Network,
                None => EventPriority::Client,
            },
        }
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ConsensusTimeout { .. } => "ConsensusTimeout",
            Event::SyncTimer => "SyncTimer",
            Event::HandshakeTimer { .. } => "HandshakeTimer",
            Event::PeerConnected { .. } => "PeerConnected",
            Event::PeerDisconnected { .. } => "PeerDisconnected",
            Event::HelloReceived { .. } => "HelloReceived",
            Event::TransactionReceived { .. } => "TransactionReceived",
            Event::BlockHeightAnnounced { .. } => "BlockHeightAnnounced",
            Event::BlockAnnounced { .. } => "BlockAnnounced",
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::VoteReceived { .. } => "VoteReceived",
            Event::HeadersReceived { .. } => "HeadersReceived",
            Event::BodiesReceived { .. } => "BodiesReceived",
            Event::ConsentedHeaderReceived { .. } => "ConsentedHeaderReceived",
            Event::TransactionValidated { .. } => "TransactionValidated",
            Event::ProposalSignatureVerified { .. } => "ProposalSignatureVerified",
            Event::VoteSignatureVerified { .. } => "VoteSignatureVerified",
            Event::TransactionsSelected { .. } => "TransactionsSelected",
            Event::BlockCommitted { .. } => "BlockCommitted",
            Event::SyncApplyFailed { .. } => "SyncApplyFailed",
            Event::BlockExecuted { .. } => "BlockExecuted",
        }
    }
}
