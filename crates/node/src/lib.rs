//! Node coordinator and production runner.
//!
//! [`NodeStateMachine`] composes the consensus engine, transaction pool,
//! executor and synchronizer into one state machine and wires the peer
//! protocol to them: it owns the handshake, the remote-node set, and the
//! fan-out of committed blocks. Like every subsystem it is synchronous;
//! the runners own all I/O.
//!
//! [`NodeRunner`] is the tokio runner: bounded event queue, abortable
//! timer tasks, a [`Transport`] seam for the P2P overlay, and ordered
//! shutdown. The deterministic counterpart lives in `concord-simulation`.

mod remotes;
mod responder;
mod runner;
mod state;
mod timers;

pub use remotes::{RemoteNode, RemoteNodeSet};
pub use responder::{Responder, ResponderError};
pub use runner::{event_for_message, NodeHandle, NodeRunner, Transport};
pub use state::NodeStateMachine;
pub use timers::TimerManager;
