//! Block, header and body.

use crate::codec::{read_u64, write_u64, CodecError, Decode, Encode};
use crate::vote::CommitError;
use crate::{Commit, Hash, TransactionList, ValidatorSet};

/// Block header.
///
/// The hash is computed over the canonical encoding with exactly this field
/// order: height, timestamp, last_block_hash, transaction_root,
/// last_commit_root, next_validator_set_root, app_state_hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Position in the chain; genesis is 0.
    pub height: u64,
    /// Proposer wall clock, milliseconds since the Unix epoch. Never less
    /// than the parent's.
    pub timestamp: u64,
    /// Hash of the parent header; zero for genesis.
    pub last_block_hash: Hash,
    /// Root of the body's transaction list.
    pub transaction_root: Hash,
    /// Root of the body's commit certificate for the parent.
    pub last_commit_root: Hash,
    /// Root of the validator set that votes on this block.
    pub next_validator_set_root: Hash,
    /// Application state hash after executing the parent block.
    pub app_state_hash: Hash,
}

impl BlockHeader {
    /// Header hash over canonical bytes.
    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode())
    }
}

impl Encode for BlockHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_u64(out, self.height);
        write_u64(out, self.timestamp);
        self.last_block_hash.encode_into(out);
        self.transaction_root.encode_into(out);
        self.last_commit_root.encode_into(out);
        self.next_validator_set_root.encode_into(out);
        self.app_state_hash.encode_into(out);
    }
}

impl Decode for BlockHeader {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            height: read_u64(input)?,
            timestamp: read_u64(input)?,
            last_block_hash: Hash::decode_from(input)?,
            transaction_root: Hash::decode_from(input)?,
            last_commit_root: Hash::decode_from(input)?,
            next_validator_set_root: Hash::decode_from(input)?,
            app_state_hash: Hash::decode_from(input)?,
        })
    }
}

/// Block body: the data the header's roots commit to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBody {
    pub transactions: TransactionList,
    /// Commit certificate for the parent block. Empty for height 1 (genesis
    /// is not voted on).
    pub last_commit: Commit,
    /// Validator set that votes on this block. Copied from the parent until
    /// the application opts into epoch changes.
    pub next_validator_set: ValidatorSet,
}

impl Encode for BlockBody {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.transactions.encode_into(out);
        self.last_commit.encode_into(out);
        self.next_validator_set.encode_into(out);
    }
}

impl Decode for BlockBody {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            transactions: TransactionList::decode_from(input)?,
            last_commit: Commit::decode_from(input)?,
            next_validator_set: ValidatorSet::decode_from(input)?,
        })
    }
}

/// Reasons a block fails validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("Transaction root does not match body")]
    TransactionRootMismatch,

    #[error("Last-commit root does not match body")]
    CommitRootMismatch,

    #[error("Validator-set root does not match body")]
    ValidatorSetRootMismatch,

    #[error("Height {got} does not follow parent height {parent}")]
    HeightMismatch { parent: u64, got: u64 },

    #[error("Timestamp {got} is before parent timestamp {parent}")]
    TimestampRegression { parent: u64, got: u64 },

    #[error("Last-block hash does not match parent")]
    ParentHashMismatch,

    #[error("Commit certificate invalid: {0}")]
    BadCommit(#[from] CommitError),
}

/// A full block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    /// Block hash; by convention the header hash.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Check the header's roots against the body.
    pub fn verify_internal(&self) -> Result<(), BlockError> {
        if self.header.transaction_root != self.body.transactions.root() {
            return Err(BlockError::TransactionRootMismatch);
        }
        if self.header.last_commit_root != self.body.last_commit.hash() {
            return Err(BlockError::CommitRootMismatch);
        }
        if self.header.next_validator_set_root != self.body.next_validator_set.hash() {
            return Err(BlockError::ValidatorSetRootMismatch);
        }
        Ok(())
    }

    /// Full validation against the committed parent.
    ///
    /// Checks internal roots, linkage (height, timestamp, parent hash) and
    /// that `last_commit` proves `> 2/3` precommit power for the parent
    /// under the parent's `next_validator_set` — the set that voted on it.
    pub fn verify_against_parent(&self, parent: &Block) -> Result<(), BlockError> {
        self.verify_internal()?;

        if self.header.height != parent.header.height + 1 {
            return Err(BlockError::HeightMismatch {
                parent: parent.header.height,
                got: self.header.height,
            });
        }
        if self.header.timestamp < parent.header.timestamp {
            return Err(BlockError::TimestampRegression {
                parent: parent.header.timestamp,
                got: self.header.timestamp,
            });
        }
        if self.header.last_block_hash != parent.hash() {
            return Err(BlockError::ParentHashMismatch);
        }

        self.body.last_commit.verify(
            parent.hash(),
            parent.header.height,
            &parent.body.next_validator_set,
        )?;
        Ok(())
    }
}

impl Encode for Block {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.header.encode_into(out);
        self.body.encode_into(out);
    }
}

impl Decode for Block {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            header: BlockHeader::decode_from(input)?,
            body: BlockBody::decode_from(input)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GenesisConfig, KeyPair, ValidatorEntry};

    fn genesis() -> (Block, Vec<KeyPair>) {
        let keys: Vec<KeyPair> = (0..4).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect();
        let config = GenesisConfig {
            validators: keys
                .iter()
                .map(|k| ValidatorEntry {
                    public_key: k.public_key(),
                    voting_power: 1,
                })
                .collect(),
            timestamp: 1_000,
            app_state_hash: Hash::of(b"genesis-app"),
        };
        (config.genesis_block(), keys)
    }

    fn child_of(parent: &Block, keys: &[KeyPair]) -> Block {
        let transactions = TransactionList::default();
        let last_commit = if parent.header.height == 0 {
            Commit::empty()
        } else {
            let hash = parent.hash();
            let votes = keys
                .iter()
                .enumerate()
                .map(|(i, k)| {
                    let message = crate::vote_message(
                        parent.header.height,
                        0,
                        crate::VoteType::Precommit,
                        Some(hash),
                    );
                    crate::CommitVote {
                        validator_index: i as u32,
                        block_hash: hash,
                        signature: k.sign(&message),
                    }
                })
                .collect();
            Commit { round: 0, votes }
        };
        let next_validator_set = parent.body.next_validator_set.clone();
        let header = BlockHeader {
            height: parent.header.height + 1,
            timestamp: parent.header.timestamp + 1,
            last_block_hash: parent.hash(),
            transaction_root: transactions.root(),
            last_commit_root: last_commit.hash(),
            next_validator_set_root: next_validator_set.hash(),
            app_state_hash: Hash::of(b"app"),
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

    #[test]
    fn header_hash_round_trips() {
        let (g, _) = genesis();
        let decoded = BlockHeader::decode(&g.header.encode()).unwrap();
        assert_eq!(decoded.hash(), g.header.hash());
    }

    #[test]
    fn block_round_trips() {
        let (g, keys) = genesis();
        let block = child_of(&g, &keys);
        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn child_of_genesis_validates() {
        let (g, keys) = genesis();
        let block = child_of(&g, &keys);
        assert_eq!(block.verify_against_parent(&g), Ok(()));
    }

    #[test]
    fn grandchild_needs_real_commit() {
        let (g, keys) = genesis();
        let b1 = child_of(&g, &keys);
        let b2 = child_of(&b1, &keys);
        assert_eq!(b2.verify_against_parent(&b1), Ok(()));

        // Strip the commit: must fail for a non-genesis parent.
        let mut broken = b2.clone();
        broken.body.last_commit = Commit::empty();
        broken.header.last_commit_root = broken.body.last_commit.hash();
        assert!(matches!(
            broken.verify_against_parent(&b1),
            Err(BlockError::BadCommit(CommitError::EmptyCommit))
        ));
    }

    #[test]
    fn wrong_parent_hash_rejected() {
        let (g, keys) = genesis();
        let mut block = child_of(&g, &keys);
        block.header.last_block_hash = Hash::of(b"not-the-parent");
        assert_eq!(
            block.verify_against_parent(&g),
            Err(BlockError::ParentHashMismatch)
        );
    }

    #[test]
    fn root_mismatch_rejected() {
        let (g, keys) = genesis();
        let mut block = child_of(&g, &keys);
        block.header.transaction_root = Hash::of(b"bogus");
        assert_eq!(
            block.verify_against_parent(&g),
            Err(BlockError::TransactionRootMismatch)
        );
    }

    #[test]
    fn timestamp_regression_rejected() {
        let (g, keys) = genesis();
        let mut block = child_of(&g, &keys);
        block.header.timestamp = g.header.timestamp - 1;
        assert!(matches!(
            block.verify_against_parent(&g),
            Err(BlockError::TimestampRegression { .. })
        ));
    }
}
