//! BFT consensus engine.
//!
//! A Tendermint-style state machine, one `(height, round)` at a time:
//!
//! ```text
//! NewHeight → Propose → Prevote → Precommit → Commit → NewHeight
//! ```
//!
//! # Protocol
//!
//! - The proposer of `(height, round)` is chosen by round-robin weighted by
//!   voting power. It packs pool transactions (ordered by the dapp) into a
//!   block and broadcasts a signed `Proposal`.
//! - Validators prevote the proposal's hash if it is valid and compatible
//!   with their lock, nil otherwise. `> 2/3` prevote power for one block
//!   locks it and precommits it; `> 2/3` precommit power commits it.
//! - A validator releases its lock only when a *newer* round shows `> 2/3`
//!   prevotes for a different value.
//! - Timeouts grow geometrically with the round, so eventual synchrony
//!   guarantees some round reaches quorum.
//!
//! # Architecture
//!
//! The engine is synchronous and performs no I/O. Signature checks are
//! delegated to the runner (`VerifyVoteSignature` / callbacks), own votes
//! are persisted before broadcast, and commits travel through the store
//! before the engine advances (`CommitBlock` → `BlockCommitted`). The
//! engine begins a height only once the synchronizer is idle and the
//! executor has caught up to the parent — that keeps proposals' app state
//! hashes well-defined.

mod state;
mod vote_set;

pub use state::{EngineState, RecoveredVotes, Step};
pub use vote_set::{AddVote, VoteSet};
