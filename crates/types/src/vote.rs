//! Votes, proposals and commit certificates.
//!
//! Signatures never cover containers: a vote signature is over the
//! domain-separated canonical vote message, a proposal signature over the
//! proposal message. This lets a commit certificate carry only
//! `(validator_index, block_hash, signature)` per vote and still be
//! verifiable from the header it certifies.

use crate::codec::{
    read_option, read_seq_len, read_u32, read_u64, read_u8, write_option, write_u32, write_u64,
    write_u8, CodecError, Decode, Encode,
};
use crate::{Block, Hash, KeyPair, ValidatorSet};
use crate::{PublicKey, Signature};

/// Domain tag for vote signatures.
pub const DOMAIN_VOTE: &[u8] = b"concord/vote/v1";

/// Domain tag for proposal signatures.
pub const DOMAIN_PROPOSAL: &[u8] = b"concord/proposal/v1";

/// The two vote kinds of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VoteType {
    Prevote = 0,
    Precommit = 1,
}

impl VoteType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(VoteType::Prevote),
            1 => Some(VoteType::Precommit),
            _ => None,
        }
    }
}

/// The canonical byte message a vote signature covers.
///
/// Includes domain separation so a vote can never double as any other
/// signed structure: domain tag, height, round, vote type, then the block
/// hash (presence byte distinguishes nil).
pub fn vote_message(
    height: u64,
    round: u32,
    vote_type: VoteType,
    block_hash: Option<Hash>,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_VOTE.len() + 46);
    message.extend_from_slice(DOMAIN_VOTE);
    write_u64(&mut message, height);
    write_u32(&mut message, round);
    write_u8(&mut message, vote_type as u8);
    write_option(&mut message, &block_hash, |out, h: &Hash| {
        h.encode_into(out)
    });
    message
}

/// The canonical byte message a proposal signature covers.
pub fn proposal_message(
    height: u64,
    round: u32,
    block_hash: Hash,
    locked_round: Option<u32>,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_PROPOSAL.len() + 50);
    message.extend_from_slice(DOMAIN_PROPOSAL);
    write_u64(&mut message, height);
    write_u32(&mut message, round);
    block_hash.encode_into(&mut message);
    write_option(&mut message, &locked_round, |out, r| write_u32(out, *r));
    message
}

/// A prevote or precommit for a block (or nil) at `(height, round)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    /// `None` is the nil vote.
    pub block_hash: Option<Hash>,
    /// Index into the validator set for this height.
    pub validator_index: u32,
    pub signature: Signature,
}

impl Vote {
    /// Create and sign a vote.
    pub fn sign(
        vote_type: VoteType,
        height: u64,
        round: u32,
        block_hash: Option<Hash>,
        validator_index: u32,
        key: &KeyPair,
    ) -> Self {
        let signature = key.sign(&vote_message(height, round, vote_type, block_hash));
        Self {
            vote_type,
            height,
            round,
            block_hash,
            validator_index,
            signature,
        }
    }

    /// Verify the signature against the voter's public key.
    pub fn verify(&self, key: &PublicKey) -> bool {
        let message = vote_message(self.height, self.round, self.vote_type, self.block_hash);
        key.verify(&message, &self.signature)
    }
}

impl Encode for Vote {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_u8(out, self.vote_type as u8);
        write_u64(out, self.height);
        write_u32(out, self.round);
        write_option(out, &self.block_hash, |o, h: &Hash| h.encode_into(o));
        write_u32(out, self.validator_index);
        self.signature.encode_into(out);
    }
}

impl Decode for Vote {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        let tag = read_u8(input)?;
        let vote_type = VoteType::from_u8(tag).ok_or(CodecError::InvalidTag {
            what: "VoteType",
            tag,
        })?;
        Ok(Self {
            vote_type,
            height: read_u64(input)?,
            round: read_u32(input)?,
            block_hash: read_option(input, Hash::decode_from)?,
            validator_index: read_u32(input)?,
            signature: Signature::decode_from(input)?,
        })
    }
}

/// A block proposal for `(height, round)`.
///
/// A proposer that is locked must re-propose its locked block and set
/// `locked_round` to the round it locked in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub block: Block,
    pub locked_round: Option<u32>,
    pub validator_index: u32,
    pub signature: Signature,
}

impl Proposal {
    /// Create and sign a proposal.
    pub fn sign(
        height: u64,
        round: u32,
        block: Block,
        locked_round: Option<u32>,
        validator_index: u32,
        key: &KeyPair,
    ) -> Self {
        let signature = key.sign(&proposal_message(
            height,
            round,
            block.header.hash(),
            locked_round,
        ));
        Self {
            height,
            round,
            block,
            locked_round,
            validator_index,
            signature,
        }
    }

    /// Verify the signature against the proposer's public key.
    pub fn verify(&self, key: &PublicKey) -> bool {
        let message = proposal_message(
            self.height,
            self.round,
            self.block.header.hash(),
            self.locked_round,
        );
        key.verify(&message, &self.signature)
    }
}

impl Encode for Proposal {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_u64(out, self.height);
        write_u32(out, self.round);
        self.block.encode_into(out);
        write_option(out, &self.locked_round, |o, r| write_u32(o, *r));
        write_u32(out, self.validator_index);
        self.signature.encode_into(out);
    }
}

impl Decode for Proposal {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            height: read_u64(input)?,
            round: read_u32(input)?,
            block: Block::decode_from(input)?,
            locked_round: read_option(input, |i| read_u32(i))?,
            validator_index: read_u32(input)?,
            signature: Signature::decode_from(input)?,
        })
    }
}

/// One precommit inside a commit certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitVote {
    pub validator_index: u32,
    pub block_hash: Hash,
    pub signature: Signature,
}

impl Encode for CommitVote {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_u32(out, self.validator_index);
        self.block_hash.encode_into(out);
        self.signature.encode_into(out);
    }
}

impl Decode for CommitVote {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            validator_index: read_u32(input)?,
            block_hash: Hash::decode_from(input)?,
            signature: Signature::decode_from(input)?,
        })
    }
}

/// Proof that a block received `> 2/3` precommit power in some round.
///
/// Carried in the next block's body as `last_commit`. The empty commit is
/// the certificate for genesis, which is not voted on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Commit {
    pub round: u32,
    pub votes: Vec<CommitVote>,
}

/// Reasons a commit certificate fails verification.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommitError {
    #[error("Commit is empty but parent is not genesis")]
    EmptyCommit,

    #[error("Commit vote references unknown validator index {0}")]
    UnknownValidator(u32),

    #[error("Duplicate commit vote from validator index {0}")]
    DuplicateValidator(u32),

    #[error("Commit vote is for the wrong block")]
    WrongBlock,

    #[error("Commit vote has an invalid signature (validator index {0})")]
    BadSignature(u32),

    #[error("Commit has {got} voting power of {total}; quorum not reached")]
    NoQuorum { got: u64, total: u64 },
}

impl Commit {
    /// The genesis certificate: no round, no votes.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Deterministic root over the canonical encoding.
    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode())
    }

    /// Verify this commit proves `> 2/3` precommit power for the block at
    /// `(block_hash, height)` under `validators` — the set that voted on it.
    ///
    /// The empty commit is accepted only for a genesis parent (`height` 0).
    pub fn verify(
        &self,
        block_hash: Hash,
        height: u64,
        validators: &ValidatorSet,
    ) -> Result<(), CommitError> {
        if self.votes.is_empty() {
            if height == 0 {
                return Ok(());
            }
            return Err(CommitError::EmptyCommit);
        }

        let mut seen = std::collections::HashSet::new();
        let mut power = 0u64;
        for vote in &self.votes {
            let entry = validators
                .get(vote.validator_index)
                .ok_or(CommitError::UnknownValidator(vote.validator_index))?;
            if !seen.insert(vote.validator_index) {
                return Err(CommitError::DuplicateValidator(vote.validator_index));
            }
            if vote.block_hash != block_hash {
                return Err(CommitError::WrongBlock);
            }
            let message = vote_message(height, self.round, VoteType::Precommit, Some(block_hash));
            if !entry.public_key.verify(&message, &vote.signature) {
                return Err(CommitError::BadSignature(vote.validator_index));
            }
            power += entry.voting_power;
        }

        if !validators.has_quorum(power) {
            return Err(CommitError::NoQuorum {
                got: power,
                total: validators.total_power(),
            });
        }
        Ok(())
    }
}

impl Encode for Commit {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_u32(out, self.round);
        write_u32(out, self.votes.len() as u32);
        for vote in &self.votes {
            vote.encode_into(out);
        }
    }
}

impl Decode for Commit {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        let round = read_u32(input)?;
        let len = read_seq_len(input)?;
        let mut votes = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            votes.push(CommitVote::decode_from(input)?);
        }
        Ok(Self { round, votes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ValidatorEntry, ValidatorSet};

    fn keys(n: usize) -> Vec<KeyPair> {
        (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
            .collect()
    }

    fn vset(keys: &[KeyPair]) -> ValidatorSet {
        ValidatorSet::new(
            keys.iter()
                .map(|k| ValidatorEntry {
                    public_key: k.public_key(),
                    voting_power: 1,
                })
                .collect(),
        )
    }

    fn commit_for(block_hash: Hash, height: u64, round: u32, keys: &[KeyPair]) -> Commit {
        let votes = keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let message = vote_message(height, round, VoteType::Precommit, Some(block_hash));
                CommitVote {
                    validator_index: i as u32,
                    block_hash,
                    signature: k.sign(&message),
                }
            })
            .collect();
        Commit { round, votes }
    }

    #[test]
    fn vote_round_trip_and_signature() {
        let key = KeyPair::from_seed(&[3u8; 32]);
        let vote = Vote::sign(VoteType::Prevote, 4, 1, Some(Hash::of(b"b")), 2, &key);
        let decoded = Vote::decode(&vote.encode()).unwrap();
        assert_eq!(decoded, vote);
        assert!(decoded.verify(&key.public_key()));
    }

    #[test]
    fn nil_vote_signs_differently() {
        let key = KeyPair::from_seed(&[3u8; 32]);
        let nil = Vote::sign(VoteType::Prevote, 4, 1, None, 2, &key);
        let block = Vote::sign(VoteType::Prevote, 4, 1, Some(Hash::ZERO), 2, &key);
        assert_ne!(nil.signature, block.signature);
    }

    #[test]
    fn commit_verifies_with_full_quorum() {
        let keys = keys(4);
        let set = vset(&keys);
        let hash = Hash::of(b"block");
        let commit = commit_for(hash, 3, 0, &keys);
        assert_eq!(commit.verify(hash, 3, &set), Ok(()));
    }

    #[test]
    fn commit_rejects_subquorum() {
        let keys = keys(4);
        let set = vset(&keys);
        let hash = Hash::of(b"block");
        let commit = commit_for(hash, 3, 0, &keys[..2]);
        assert!(matches!(
            commit.verify(hash, 3, &set),
            Err(CommitError::NoQuorum { got: 2, .. })
        ));
    }

    #[test]
    fn commit_rejects_duplicate_votes() {
        let keys = keys(4);
        let set = vset(&keys);
        let hash = Hash::of(b"block");
        let mut commit = commit_for(hash, 3, 0, &keys);
        commit.votes.push(commit.votes[0].clone());
        assert_eq!(
            commit.verify(hash, 3, &set),
            Err(CommitError::DuplicateValidator(0))
        );
    }

    #[test]
    fn empty_commit_only_for_genesis_parent() {
        let keys = keys(4);
        let set = vset(&keys);
        let commit = Commit::empty();
        assert_eq!(commit.verify(Hash::ZERO, 0, &set), Ok(()));
        assert_eq!(
            commit.verify(Hash::ZERO, 5, &set),
            Err(CommitError::EmptyCommit)
        );
    }
}
