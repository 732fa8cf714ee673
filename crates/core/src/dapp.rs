//! The application seam.

use concord_types::{Hash, Transaction};
use thiserror::Error;

/// Errors a dapp callback can produce.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DappError {
    /// The transaction was validly rejected by application rules. It stays
    /// in its block (Byzantine proposers may include junk); execution of
    /// the block continues.
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// I/O or programmer error inside the dapp. Fatal: the node stops.
    #[error("Dapp fault: {0}")]
    Fault(String),
}

/// The deterministic application the chain replicates.
///
/// Invoked only by runners, never by state machines, so consensus stays
/// pure. Execution order is exactly block order; two correct nodes feeding
/// the same blocks to the same dapp must report the same state hash.
pub trait Dapp: Send {
    /// Apply one committed transaction to application state.
    fn execute_transaction(&mut self, tx: &Transaction) -> Result<(), DappError>;

    /// Admission check for pool entry; also used to re-validate pool
    /// contents after each executed block.
    fn validate_transaction(&self, tx: &Transaction) -> bool;

    /// Deterministically order (and optionally filter) the proposer's
    /// candidate transactions.
    fn select_transactions(&self, candidates: Vec<Transaction>) -> Vec<Transaction>;

    /// Current application state hash; folded into the next block header.
    fn app_state_hash(&self) -> Hash;
}
