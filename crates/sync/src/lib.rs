//! Synchronizer: catch-up of lagging nodes from peers.
//!
//! Tracks the tip height every peer reports and, whenever a peer is ahead,
//! fetches the gap in batches: `GetHeaders(from, count)`, linkage-validate
//! the chain, `GetBodies(heights)`, then apply each pair through the store.
//! A block's finality proof is the `last_commit` of the *next* body; the
//! final block of a batch is proven by a `GetConsentedHeader` round trip.
//!
//! All network I/O happens in the runner; this state machine only decides
//! what to request, from whom, and what to do with the answers. Peers that
//! time out or answer with invalid data are dropped and the batch retried
//! with the next eligible peer, round-robin.

mod state;

pub use state::SyncState;
