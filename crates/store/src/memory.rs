//! In-memory store for simulation and tests.

use crate::{validate_put, BlockStore, OwnVote, StoreError};
use concord_types::{Block, BlockBody, BlockHeader, Commit, Hash, VoteType};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<u64, Block>,
    genesis_hash: Option<Hash>,
    last_commit: Commit,
    executed: (u64, Hash),
    /// (height, round, step) → block hash voted for.
    own_votes: BTreeMap<(u64, u32, u8), Option<Hash>>,
}

/// BTreeMap-backed store. Each simulated node owns an independent instance.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn step_key(step: VoteType) -> u8 {
    step as u8
}

impl BlockStore for MemoryStore {
    fn ready(&self, genesis: &Block) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        match inner.genesis_hash {
            Some(stored) if stored != genesis.hash() => Err(StoreError::GenesisMismatch {
                stored,
                configured: genesis.hash(),
            }),
            Some(_) => Ok(()),
            None => {
                inner.genesis_hash = Some(genesis.hash());
                inner.blocks.insert(0, genesis.clone());
                inner.executed = (0, genesis.header.app_state_hash);
                Ok(())
            }
        }
    }

    fn height(&self) -> u64 {
        self.inner
            .read()
            .blocks
            .last_key_value()
            .map(|(h, _)| *h)
            .unwrap_or(0)
    }

    fn genesis_hash(&self) -> Result<Hash, StoreError> {
        self.inner.read().genesis_hash.ok_or(StoreError::NotReady)
    }

    fn block_of(&self, height: u64) -> Result<Block, StoreError> {
        self.inner
            .read()
            .blocks
            .get(&height)
            .cloned()
            .ok_or(StoreError::NotFound(height))
    }

    fn header_of(&self, height: u64) -> Result<BlockHeader, StoreError> {
        Ok(self.block_of(height)?.header)
    }

    fn body_of(&self, height: u64) -> Result<BlockBody, StoreError> {
        Ok(self.block_of(height)?.body)
    }

    fn put(&self, block: &Block, commit: &Commit) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.genesis_hash.is_none() {
            return Err(StoreError::NotReady);
        }
        let tip = *inner.blocks.last_key_value().map(|(h, _)| h).unwrap_or(&0);
        let parent = inner
            .blocks
            .get(&tip)
            .ok_or(StoreError::NotFound(tip))?
            .clone();
        validate_put(tip, &parent, block, commit)?;
        inner.blocks.insert(block.header.height, block.clone());
        inner.last_commit = commit.clone();
        Ok(())
    }

    fn last_commit(&self) -> Result<Commit, StoreError> {
        Ok(self.inner.read().last_commit.clone())
    }

    fn executed(&self) -> Result<(u64, Hash), StoreError> {
        let inner = self.inner.read();
        if inner.genesis_hash.is_none() {
            return Err(StoreError::NotReady);
        }
        Ok(inner.executed)
    }

    fn set_executed(&self, height: u64, app_state_hash: Hash) -> Result<(), StoreError> {
        self.inner.write().executed = (height, app_state_hash);
        Ok(())
    }

    fn record_own_vote(&self, vote: OwnVote) -> Result<(), StoreError> {
        self.inner
            .write()
            .own_votes
            .insert((vote.height, vote.round, step_key(vote.step)), vote.block_hash);
        Ok(())
    }

    fn own_votes_above(&self, height: u64) -> Result<Vec<OwnVote>, StoreError> {
        Ok(self
            .inner
            .read()
            .own_votes
            .iter()
            .filter(|((h, _, _), _)| *h > height)
            .map(|((h, r, s), hash)| OwnVote {
                height: *h,
                round: *r,
                step: if *s == 0 {
                    VoteType::Prevote
                } else {
                    VoteType::Precommit
                },
                block_hash: *hash,
            })
            .collect())
    }
}
