//! Validator set with weighted voting power.

use crate::codec::{read_seq_len, read_u64, write_u32, write_u64, CodecError, Decode, Encode};
use crate::{Address, Hash, PublicKey};

/// One validator: identity plus voting weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorEntry {
    pub public_key: PublicKey,
    pub voting_power: u64,
}

impl ValidatorEntry {
    pub fn address(&self) -> Address {
        self.public_key.address()
    }
}

impl Encode for ValidatorEntry {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.public_key.encode_into(out);
        write_u64(out, self.voting_power);
    }
}

impl Decode for ValidatorEntry {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            public_key: PublicKey::decode_from(input)?,
            voting_power: read_u64(input)?,
        })
    }
}

/// An ordered set of validators.
///
/// Order is consensus-relevant: votes reference validators by index, and the
/// set's root hash covers the order. Total power is cached at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    entries: Vec<ValidatorEntry>,
    total_power: u64,
}

impl ValidatorSet {
    pub fn new(entries: Vec<ValidatorEntry>) -> Self {
        let total_power = entries.iter().map(|e| e.voting_power).sum();
        Self {
            entries,
            total_power,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ValidatorEntry] {
        &self.entries
    }

    pub fn get(&self, index: u32) -> Option<&ValidatorEntry> {
        self.entries.get(index as usize)
    }

    /// Index of the validator holding `key`, if a member.
    pub fn index_of(&self, key: &PublicKey) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| &e.public_key == key)
            .map(|i| i as u32)
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// BFT threshold: strictly more than two-thirds of total power.
    pub fn has_quorum(&self, power: u64) -> bool {
        power * 3 > self.total_power * 2
    }

    /// Deterministic root over the canonical encoding.
    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode())
    }

    /// Proposer for `(height, round)`: round-robin weighted by voting power.
    ///
    /// Walks cumulative power at offset `(height + round) mod total`, so a
    /// validator with twice the power proposes twice as often, and every
    /// round at a height moves to a different offset.
    pub fn proposer_index(&self, height: u64, round: u32) -> u32 {
        debug_assert!(self.total_power > 0, "validator set must have power");
        let mut offset = (height.wrapping_add(round as u64)) % self.total_power;
        for (i, entry) in self.entries.iter().enumerate() {
            if offset < entry.voting_power {
                return i as u32;
            }
            offset -= entry.voting_power;
        }
        // Unreachable while total_power is the sum of entry powers.
        0
    }
}

impl Encode for ValidatorSet {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_u32(out, self.entries.len() as u32);
        for entry in &self.entries {
            entry.encode_into(out);
        }
    }
}

impl Decode for ValidatorSet {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        let len = read_seq_len(input)?;
        let mut entries = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            entries.push(ValidatorEntry::decode_from(input)?);
        }
        Ok(Self::new(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn set(powers: &[u64]) -> ValidatorSet {
        let entries = powers
            .iter()
            .enumerate()
            .map(|(i, &p)| ValidatorEntry {
                public_key: KeyPair::from_seed(&[i as u8 + 1; 32]).public_key(),
                voting_power: p,
            })
            .collect();
        ValidatorSet::new(entries)
    }

    #[test]
    fn quorum_is_strict_two_thirds() {
        let s = set(&[1, 1, 1, 1]);
        assert!(!s.has_quorum(2));
        // 2/3 of 4 is 2.67; three units clear it.
        assert!(s.has_quorum(3));
    }

    #[test]
    fn quorum_with_weighted_power() {
        let s = set(&[10, 1, 1, 1]);
        assert!(s.has_quorum(10)); // 30 > 26
        assert!(!s.has_quorum(3));
    }

    #[test]
    fn proposer_rotates_with_round() {
        let s = set(&[1, 1, 1, 1]);
        let h = 5;
        let first = s.proposer_index(h, 0);
        let second = s.proposer_index(h, 1);
        assert_ne!(first, second);
        assert_eq!(s.proposer_index(h, 4), first);
    }

    #[test]
    fn proposer_weighting_favors_power() {
        let s = set(&[3, 1]);
        let mut counts = [0u32; 2];
        for height in 0..100 {
            counts[s.proposer_index(height, 0) as usize] += 1;
        }
        assert_eq!(counts[0], 75);
        assert_eq!(counts[1], 25);
    }

    #[test]
    fn hash_covers_order() {
        let a = set(&[1, 2]);
        let mut entries = a.entries().to_vec();
        entries.reverse();
        let b = ValidatorSet::new(entries);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn round_trip() {
        let s = set(&[5, 7, 9]);
        let decoded = ValidatorSet::decode(&s.encode()).unwrap();
        assert_eq!(decoded, s);
        assert_eq!(decoded.total_power(), 21);
    }
}
