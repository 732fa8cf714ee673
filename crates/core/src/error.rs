//! Node-level error kinds and their fatality policy.

use concord_types::PeerId;
use thiserror::Error;

/// Errors surfaced on the node's error stream.
///
/// Non-fatal errors never halt consensus; fatal errors trigger ordered
/// shutdown.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("Bad signature from {peer:?}")]
    BadSignature { peer: Option<PeerId> },

    #[error("Transaction rejected by application")]
    AppRejected,

    #[error("Invalid proposal: {reason}")]
    InvalidProposal { reason: String },

    #[error("Invalid vote: {reason}")]
    InvalidVote { reason: String },

    #[error("Peer {peer} is on a foreign chain")]
    ForeignChain { peer: PeerId },

    #[error("Peer {peer} handshake timed out")]
    HandshakeTimeout { peer: PeerId },

    #[error("Invalid block at height {height}: {reason}")]
    InvalidBlock { height: u64, reason: String },

    #[error("Stored genesis does not match configuration")]
    GenesisMismatch,

    #[error("Block {0} not found")]
    NotFound(u64),

    #[error("Executor fault: {reason}")]
    ExecutorFault { reason: String },

    #[error("Store failure: {reason}")]
    Store { reason: String },
}

impl NodeError {
    /// Fatal errors stop the node; everything else is logged and dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::GenesisMismatch
                | NodeError::ExecutorFault { .. }
                | NodeError::Store { .. }
        )
    }
}
