//! Deterministic simulation of a Concord network.
//!
//! Runs N complete nodes single-threaded on a virtual clock: a global
//! event queue ordered by `(time, priority, sequence)`, a latency/loss
//! network model seeded from a ChaCha RNG, per-node in-memory stores and
//! dapps, and inline execution of all delegated work. Given the same seed,
//! a simulation produces identical results every run — which is what makes
//! consensus scenarios (crashes, partitions, equivocation) testable at
//! all.

mod dapp;
mod event_queue;
mod network;
mod runner;

pub use dapp::HashChainDapp;
pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{NodeIndex, SimulationRunner};
