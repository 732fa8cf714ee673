//! Block executor.
//!
//! Drives the deterministic advance of application state across committed
//! blocks. The executor state machine owns the *execution frontier* — the
//! height up to which the dapp has observed every committed transaction —
//! and dispatches exactly one `Action::ExecuteBlock` at a time, in strict
//! height order. The runner performs the dapp calls and reports back with
//! `Event::BlockExecuted`, which doubles as the pool-eviction signal and
//! the consensus engine's gate for the next height.

mod state;

pub use state::ExecutorState;
