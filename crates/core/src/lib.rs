//! Core abstractions for the Concord node.
//!
//! This crate provides the vocabulary shared by every subsystem:
//!
//! - [`Event`]: All possible inputs to the state machines
//! - [`Action`]: All possible outputs from the state machines
//! - [`StateMachine`]: The trait the composed node implements
//! - [`Dapp`]: The application seam, invoked only by runners
//! - Configuration records and the node-level error kinds
//!
//! # Architecture
//!
//! The node is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! State machines are synchronous, deterministic, and perform no I/O. All
//! I/O is handled by a runner (simulation or production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Converts action results back into events

mod action;
mod config;
mod dapp;
mod error;
mod event;

pub use action::{Action, DropReason};
pub use config::{ConsensusConfig, NodeConfig, PoolConfig, SyncConfig};
pub use dapp::{Dapp, DappError};
pub use error::NodeError;
pub use event::{Event, EventPriority, TxVerdict};

use std::time::Duration;

/// Which consensus timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutStep {
    /// Pacing delay before the proposer of round 0 builds a block.
    NewHeight,
    /// Waiting for a proposal.
    Propose,
    /// Waiting for prevote quorum to converge on one value.
    Prevote,
    /// Waiting for precommit quorum.
    Precommit,
}

/// Timer identification.
///
/// Setting a timer with an id that is already armed replaces it; stale
/// consensus timeouts are additionally ignored by the engine when the
/// (height, round) no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// A consensus step timeout at a specific (height, round).
    Consensus {
        height: u64,
        round: u32,
        step: TimeoutStep,
    },
    /// Periodic synchronizer tick (retries, timeout detection).
    Sync,
    /// Handshake deadline for a newly connected peer.
    Handshake { peer: concord_types::PeerId },
}

impl TimerId {
    /// The event delivered when this timer fires.
    pub fn to_event(self) -> Event {
        match self {
            TimerId::Consensus {
                height,
                round,
                step,
            } => Event::ConsensusTimeout {
                height,
                round,
                step,
            },
            TimerId::Sync => Event::SyncTimer,
            TimerId::Handshake { peer } => Event::HandshakeTimer { peer },
        }
    }
}

/// The composed node state machine, as seen by runners.
pub trait StateMachine {
    /// Update the machine's notion of now. Called by the runner before each
    /// `handle`; state machines never read a real clock.
    fn set_time(&mut self, now: Duration);

    /// Process one event and return the actions to perform.
    fn handle(&mut self, event: Event) -> Vec<Action>;
}
