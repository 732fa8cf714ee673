//! Peer protocol messages and wire codec.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][tag: u8][payload: canonical encoding]
//! ```
//!
//! The transport overlay adds length framing; this crate owns everything
//! inside a frame. Payloads use the canonical codec from `concord-types`
//! (big-endian, fixed field order), so the same bytes that travel the wire
//! are the bytes hashes and signatures are computed over.

mod codec;
mod message;

pub use codec::{decode_message, encode_message, WireError, WIRE_VERSION};
pub use message::{ConsensusPayload, PeerMessage};
