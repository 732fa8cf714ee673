//! Genesis configuration and deterministic genesis block construction.

use crate::{Block, BlockBody, BlockHeader, Commit, Hash, TransactionList, ValidatorEntry,
    ValidatorSet};

/// Everything needed to construct the height-0 block.
///
/// Two nodes with the same config derive byte-identical genesis blocks, so
/// the genesis hash doubles as the chain identifier in the handshake.
#[derive(Debug, Clone)]
pub struct GenesisConfig {
    /// Initial validator set, in consensus order.
    pub validators: Vec<ValidatorEntry>,
    /// Genesis timestamp, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Initial application state hash.
    pub app_state_hash: Hash,
}

impl GenesisConfig {
    /// Deterministically construct the genesis block.
    ///
    /// Height 0, zero parent hash, empty transaction list, empty commit;
    /// the initial validator set votes on block 1.
    pub fn genesis_block(&self) -> Block {
        let transactions = TransactionList::default();
        let last_commit = Commit::empty();
        let next_validator_set = ValidatorSet::new(self.validators.clone());

        let header = BlockHeader {
            height: 0,
            timestamp: self.timestamp,
            last_block_hash: Hash::ZERO,
            transaction_root: transactions.root(),
            last_commit_root: last_commit.hash(),
            next_validator_set_root: next_validator_set.hash(),
            app_state_hash: self.app_state_hash,
        };

        Block {
            header,
            body: BlockBody {
                transactions,
                last_commit,
                next_validator_set,
            },
        }
    }
}
