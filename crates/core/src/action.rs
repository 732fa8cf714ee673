//! Action types for the deterministic state machines.

use crate::{NodeError, TimerId};
use concord_messages::PeerMessage;
use concord_types::{Block, Commit, Hash, PeerId, Proposal, PublicKey, Transaction, Vote, VoteType};
use std::sync::Arc;
use std::time::Duration;

/// Why a peer is being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Genesis hash mismatch in the handshake.
    ForeignChain,
    /// Handshake did not complete in time.
    HandshakeTimeout,
    /// Sent malformed or invalid data.
    InvalidData,
    /// Did not answer a sync request in time.
    Timeout,
}

/// Actions the state machine wants performed.
///
/// Actions are **commands** — they describe something to do. The runner
/// executes them and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ── Network ───────────────────────────────────────────────────────────
    /// Send to every handshaked peer.
    Broadcast { message: PeerMessage },

    /// Send to one peer.
    SendTo { peer: PeerId, message: PeerMessage },

    /// Send to every handshaked peer except `except` (gossip back-pressure:
    /// never echo a message to its source).
    GossipExcept {
        except: Option<PeerId>,
        message: PeerMessage,
    },

    /// Ask the overlay to disconnect a peer.
    DropPeer { peer: PeerId, reason: DropReason },

    // ── Timers ────────────────────────────────────────────────────────────
    /// Set a timer to fire after a duration. Replaces any armed timer with
    /// the same id.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ── Delegated work (async in production, inline in simulation) ────────
    /// Check a transaction's signature and ask the dapp to validate it.
    /// Returns `Event::TransactionValidated`.
    ValidateTransaction {
        source: Option<PeerId>,
        tx: Transaction,
    },

    /// Verify a proposal signature against the proposer's key.
    /// Returns `Event::ProposalSignatureVerified`.
    VerifyProposalSignature {
        proposal: Box<Proposal>,
        public_key: PublicKey,
    },

    /// Verify a vote signature against the voter's key.
    /// Returns `Event::VoteSignatureVerified`.
    VerifyVoteSignature { vote: Vote, public_key: PublicKey },

    /// Ask the dapp to order the proposer's candidate transactions.
    /// Returns `Event::TransactionsSelected`.
    SelectTransactions {
        height: u64,
        round: u32,
        candidates: Vec<Transaction>,
        max: usize,
    },

    /// Execute a committed block through the dapp, in order.
    /// Returns `Event::BlockExecuted`; a dapp fault is fatal.
    ExecuteBlock { block: Arc<Block> },

    // ── Storage ───────────────────────────────────────────────────────────
    /// Persist our own vote before it is broadcast, so a restarted node
    /// cannot equivocate.
    PersistOwnVote {
        height: u64,
        round: u32,
        step: VoteType,
        block_hash: Option<Hash>,
    },

    /// Persist a block the engine committed, together with its certificate.
    /// Returns `Event::BlockCommitted`; failure here is fatal.
    CommitBlock { block: Arc<Block>, commit: Commit },

    /// Persist a block fetched by the synchronizer. The commit proves the
    /// block itself (taken from the next body or a `ConsentedHeader`).
    /// Returns `Event::BlockCommitted`, or `Event::SyncApplyFailed` and the
    /// peer is dropped.
    ApplySyncedBlock {
        peer: PeerId,
        block: Arc<Block>,
        commit: Commit,
    },

    // ── External notifications ────────────────────────────────────────────
    /// Emit a committed block for external observers.
    EmitCommittedBlock { block: Arc<Block> },

    /// Surface an error on the node's error stream. Fatal errors trigger
    /// ordered shutdown.
    EmitError { error: NodeError },
}

impl Action {
    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendTo { .. } => "SendTo",
            Action::GossipExcept { .. } => "GossipExcept",
            Action::DropPeer { .. } => "DropPeer",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::ValidateTransaction { .. } => "ValidateTransaction",
            Action::VerifyProposalSignature { .. } => "VerifyProposalSignature",
            Action::VerifyVoteSignature { .. } => "VerifyVoteSignature",
            Action::SelectTransactions { .. } => "SelectTransactions",
            Action::ExecuteBlock { .. } => "ExecuteBlock",
            Action::PersistOwnVote { .. } => "PersistOwnVote",
            Action::CommitBlock { .. } => "CommitBlock",
            Action::ApplySyncedBlock { .. } => "ApplySyncedBlock",
            Action::EmitCommittedBlock { .. } => "EmitCommittedBlock",
            Action::EmitError { .. } => "EmitError",
        }
    }

    /// Check if this action is delegated work (returns a callback event).
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::ValidateTransaction { .. }
                | Action::VerifyProposalSignature { .. }
                | Action::VerifyVoteSignature { .. }
                | Action::SelectTransactions { .. }
                | Action::ExecuteBlock { .. }
        )
    }

    /// Check if this is a storage write action.
    pub fn is_storage_write(&self) -> bool {
        matches!(
            self,
            Action::PersistOwnVote { .. }
                | Action::CommitBlock { .. }
                | Action::ApplySyncedBlock { .. }
        )
    }
}
