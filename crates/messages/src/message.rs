//! The peer message set.

use concord_types::{Block, BlockBody, BlockHeader, Commit, Hash, Proposal, Transaction, Vote};

/// A consensus-engine message: proposal or vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusPayload {
    Proposal(Box<Proposal>),
    Vote(Vote),
}

/// Everything one node can say to another.
///
/// `Get*` requests are served directly from the store by the responder;
/// all other messages are demultiplexed into state-machine events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Handshake: local tip height and genesis hash.
    Hello { height: u64, genesis: Hash },

    /// Gossip of a pool transaction.
    NewTransaction { transaction: Transaction },

    /// Announcement of a newly committed tip height.
    NewBlockHeight { height: u64 },

    /// Push of a newly committed block.
    NewBlock { block: Box<Block> },

    /// Consensus message (proposal, prevote, precommit).
    NewConsensusMessage { message: ConsensusPayload },

    /// Request a header together with the commit proving it.
    GetConsentedHeader { height: u64 },
    ConsentedHeader {
        header: Box<BlockHeader>,
        commit: Commit,
    },

    /// Request up to `count` headers starting at `from`.
    GetHeaders { from: u64, count: u64 },
    Headers { headers: Vec<BlockHeader> },

    /// Request bodies for specific heights.
    GetBodies { heights: Vec<u64> },
    Bodies { bodies: Vec<BlockBody> },
}

impl PeerMessage {
    /// Message name for logs and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "Hello",
            PeerMessage::NewTransaction { .. } => "NewTransaction",
            PeerMessage::NewBlockHeight { .. } => "NewBlockHeight",
            PeerMessage::NewBlock { .. } => "NewBlock",
            PeerMessage::NewConsensusMessage { .. } => "NewConsensusMessage",
            PeerMessage::GetConsentedHeader { .. } => "GetConsentedHeader",
            PeerMessage::ConsentedHeader { .. } => "ConsentedHeader",
            PeerMessage::GetHeaders { .. } => "GetHeaders",
            PeerMessage::Headers { .. } => "Headers",
            PeerMessage::GetBodies { .. } => "GetBodies",
            PeerMessage::Bodies { .. } => "Bodies",
        }
    }

    /// True for request messages the responder answers from the store.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            PeerMessage::GetConsentedHeader { .. }
                | PeerMessage::GetHeaders { .. }
                | PeerMessage::GetBodies { .. }
        )
    }
}
