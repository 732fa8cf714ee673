//! Append-only blockchain store.
//!
//! A height-keyed block log plus a small set of metadata: genesis hash,
//! the commit certificate for the tip, the executed frontier, and the
//! node's own votes (crash-safe equivocation prevention).
//!
//! `put` re-validates every block invariant against the stored parent and
//! verifies the accompanying commit certificate, so a store can only ever
//! contain a finalized, linked chain.
//!
//! Two backends: [`MemoryStore`] for simulation and tests, [`RocksDbStore`]
//! for production.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksDbConfig, RocksDbStore};

use concord_types::{Block, BlockBody, BlockError, BlockHeader, Commit, CommitError, Hash,
    VoteType};
use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Read at a height beyond the tip (or before genesis install).
    #[error("Block {0} not found")]
    NotFound(u64),

    /// `put` of a block that fails chain validation.
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockError),

    /// `put` with a commit that does not prove the block.
    #[error("Invalid commit: {0}")]
    InvalidCommit(#[from] CommitError),

    /// Block height does not extend the tip.
    #[error("Height {got} does not extend tip {tip}")]
    NotNextHeight { tip: u64, got: u64 },

    /// Reopened store holds a different genesis.
    #[error("Stored genesis {stored} does not match configured genesis {configured}")]
    GenesisMismatch { stored: Hash, configured: Hash },

    /// Store used before `ready` installed genesis.
    #[error("Store has no genesis installed")]
    NotReady,

    /// Backend failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored bytes failed to decode.
    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

/// A vote this node signed, persisted before broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnVote {
    pub height: u64,
    pub round: u32,
    pub step: VoteType,
    pub block_hash: Option<Hash>,
}

/// The append-only block log.
///
/// Reads are shared; writes come solely from the executor path (consensus
/// commit) and the synchronizer (catch-up), which the coordinator mutually
/// excludes.
pub trait BlockStore: Send + Sync {
    /// Install genesis on first open; verify it on reopen.
    ///
    /// Fails with `GenesisMismatch` when the store already holds a chain
    /// rooted in a different genesis block.
    fn ready(&self, genesis: &Block) -> Result<(), StoreError>;

    /// Highest committed height. Genesis counts as height 0.
    fn height(&self) -> u64;

    /// Hash of the installed genesis block.
    fn genesis_hash(&self) -> Result<Hash, StoreError>;

    fn block_of(&self, height: u64) -> Result<Block, StoreError>;
    fn header_of(&self, height: u64) -> Result<BlockHeader, StoreError>;
    fn body_of(&self, height: u64) -> Result<BlockBody, StoreError>;

    /// Append the next block with the certificate proving it.
    ///
    /// Requires `block.height == height() + 1`, full chain validation
    /// against the stored parent, and `commit` proving this block under its
    /// own `next_validator_set`.
    fn put(&self, block: &Block, commit: &Commit) -> Result<(), StoreError>;

    /// The commit certificate for the tip block.
    fn last_commit(&self) -> Result<Commit, StoreError>;

    /// The commit for an arbitrary committed height: the tip uses the
    /// last-commit cache, earlier heights read the next body.
    fn commit_of(&self, height: u64) -> Result<Commit, StoreError> {
        if height == self.height() {
            return self.last_commit();
        }
        Ok(self.body_of(height + 1)?.last_commit)
    }

    /// Executed frontier: height and app state hash after executing it.
    fn executed(&self) -> Result<(u64, Hash), StoreError>;

    /// Advance the executed frontier.
    fn set_executed(&self, height: u64, app_state_hash: Hash) -> Result<(), StoreError>;

    /// Persist one of our own votes.
    fn record_own_vote(&self, vote: OwnVote) -> Result<(), StoreError>;

    /// Own votes at heights above `height`, for crash recovery.
    fn own_votes_above(&self, height: u64) -> Result<Vec<OwnVote>, StoreError>;
}


/// Shared `put` validation used by both backends.
fn validate_put(
    tip: u64,
    parent: &Block,
    block: &Block,
    commit: &Commit,
) -> Result<(), StoreError> {
    if block.header.height != tip + 1 {
        return Err(StoreError::NotNextHeight {
            tip,
            got: block.header.height,
        });
    }
    block.verify_against_parent(parent)?;
    commit.verify(
        block.hash(),
        block.header.height,
        &block.body.next_validator_set,
    )?;
    Ok(())
}
