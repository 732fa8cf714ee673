//! Core types for Concord consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, cryptographic keys and signatures
//! - **Consensus types**: Block, BlockHeader, Vote, Proposal, Commit
//! - **Canonical codec**: fixed-field-order, big-endian serialization that
//!   every hash and signature is computed over
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. Changing a
//! field order or an encoding here is a hard fork.

mod block;
pub mod codec;
mod crypto;
mod genesis;
mod hash;
mod transaction;
mod validator;
mod vote;

pub use block::{Block, BlockBody, BlockError, BlockHeader};
pub use codec::{CodecError, Decode, Encode};
pub use crypto::{Address, KeyPair, PublicKey, Signature};
pub use genesis::GenesisConfig;
pub use hash::{Hash, HexError};
pub use transaction::{Transaction, TransactionData, TransactionList};
pub use validator::{ValidatorEntry, ValidatorSet};
pub use vote::{
    proposal_message, vote_message, Commit, CommitError, CommitVote, Proposal, Vote, VoteType,
    DOMAIN_PROPOSAL, DOMAIN_VOTE,
};

/// Identifier for a connected peer, assigned by the transport overlay.
///
/// Opaque to consensus; the overlay guarantees uniqueness for the lifetime
/// of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}
