//! Transaction pool.
//!
//! An ordered, deduplicating set keyed by transaction hash. Admission is
//! delegated to the runner (`Action::ValidateTransaction` checks the
//! signature and asks the dapp), so the pool itself stays synchronous and
//! deterministic. Admitted transactions gossip to every peer except their
//! source.

mod state;

pub use state::PoolState;
