//! Vote accounting for one `(height, round, type)`.

use concord_types::{Hash, ValidatorSet, Vote};
use std::collections::HashMap;

/// Outcome of adding a vote to a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddVote {
    /// First vote from this validator.
    Added,
    /// Byte-identical to a vote already held.
    Duplicate,
    /// A second, conflicting vote from the same validator. The earlier vote
    /// keeps its power; both are retained for the equivocation log.
    Equivocation { existing: Vote },
}

/// Signed votes for a single `(height, round, type)`, with power totals
/// per value.
#[derive(Debug, Default)]
pub struct VoteSet {
    /// First vote per validator index.
    votes: HashMap<u32, Vote>,
    /// Accumulated power per voted value (`None` is nil).
    power_by_value: HashMap<Option<Hash>, u64>,
    /// Accumulated power over all distinct voters.
    total_power: u64,
}

impl VoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn get(&self, validator_index: u32) -> Option<&Vote> {
        self.votes.get(&validator_index)
    }

    /// Add a signature-verified vote weighted by `power`.
    pub fn add(&mut self, vote: Vote, power: u64) -> AddVote {
        match self.votes.get(&vote.validator_index) {
            Some(existing) if existing.block_hash == vote.block_hash => AddVote::Duplicate,
            Some(existing) => AddVote::Equivocation {
                existing: existing.clone(),
            },
            None => {
                *self.power_by_value.entry(vote.block_hash).or_insert(0) += power;
                self.total_power += power;
                self.votes.insert(vote.validator_index, vote);
                AddVote::Added
            }
        }
    }

    /// Power accumulated for one value.
    pub fn power_for(&self, value: &Option<Hash>) -> u64 {
        self.power_by_value.get(value).copied().unwrap_or(0)
    }

    /// Power accumulated across all values.
    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// The value holding `> 2/3` of the set's total power, if any.
    pub fn quorum_value(&self, validators: &ValidatorSet) -> Option<Option<Hash>> {
        self.power_by_value
            .iter()
            .find(|(_, power)| validators.has_quorum(**power))
            .map(|(value, _)| *value)
    }

    /// True once `> 2/3` of total power has voted, for any mix of values.
    pub fn two_thirds_any(&self, validators: &ValidatorSet) -> bool {
        validators.has_quorum(self.total_power)
    }

    /// All votes for one value, for commit certificate assembly.
    pub fn votes_for(&self, value: &Option<Hash>) -> Vec<&Vote> {
        let mut votes: Vec<&Vote> = self
            .votes
            .values()
            .filter(|v| &v.block_hash == value)
            .collect();
        votes.sort_by_key(|v| v.validator_index);
        votes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{KeyPair, ValidatorEntry, VoteType};

    fn keys(n: usize) -> Vec<KeyPair> {
        (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
            .collect()
    }

    fn validators(keys: &[KeyPair]) -> ValidatorSet {
        ValidatorSet::new(
            keys.iter()
                .map(|k| ValidatorEntry {
                    public_key: k.public_key(),
                    voting_power: 1,
                })
                .collect(),
        )
    }

    fn vote(key: &KeyPair, index: u32, value: Option<Hash>) -> Vote {
        Vote::sign(VoteType::Prevote, 1, 0, value, index, key)
    }

    #[test]
    fn quorum_needs_two_thirds_for_one_value() {
        let keys = keys(4);
        let vset = validators(&keys);
        let mut set = VoteSet::new();
        let block = Some(Hash::of(b"b"));

        set.add(vote(&keys[0], 0, block), 1);
        set.add(vote(&keys[1], 1, block), 1);
        assert_eq!(set.quorum_value(&vset), None);

        // Mixed votes reach 2/3-any without a value quorum.
        set.add(vote(&keys[2], 2, None), 1);
        assert!(set.two_thirds_any(&vset));
        assert_eq!(set.quorum_value(&vset), None);

        set.add(vote(&keys[3], 3, block), 1);
        assert_eq!(set.quorum_value(&vset), Some(block));
    }

    #[test]
    fn duplicates_do_not_double_count() {
        let keys = keys(4);
        let mut set = VoteSet::new();
        let v = vote(&keys[0], 0, Some(Hash::of(b"b")));
        assert_eq!(set.add(v.clone(), 1), AddVote::Added);
        assert_eq!(set.add(v, 1), AddVote::Duplicate);
        assert_eq!(set.total_power(), 1);
    }

    #[test]
    fn equivocation_keeps_first_vote_power() {
        let keys = keys(4);
        let mut set = VoteSet::new();
        let first = vote(&keys[0], 0, Some(Hash::of(b"a")));
        let second = vote(&keys[0], 0, Some(Hash::of(b"b")));

        set.add(first.clone(), 1);
        match set.add(second, 1) {
            AddVote::Equivocation { existing } => assert_eq!(existing, first),
            other => panic!("Expected equivocation, got {other:?}"),
        }
        assert_eq!(set.total_power(), 1);
        assert_eq!(set.power_for(&Some(Hash::of(b"a"))), 1);
        assert_eq!(set.power_for(&Some(Hash::of(b"b"))), 0);
    }

    #[test]
    fn votes_for_orders_by_index() {
        let keys = keys(3);
        let mut set = VoteSet::new();
        let block = Some(Hash::of(b"b"));
        set.add(vote(&keys[2], 2, block), 1);
        set.add(vote(&keys[0], 0, block), 1);
        set.add(vote(&keys[1], 1, None), 1);

        let indices: Vec<u32> = set.votes_for(&block).iter().map(|v| v.validator_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }
}
