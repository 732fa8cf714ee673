//! Message encoding and decoding for network transport.
//!
//! Each frame is `[version][tag][payload]`. The tag identifies the message
//! variant; payloads reuse the canonical codec so wire bytes and hashed
//! bytes never diverge.

use crate::message::{ConsensusPayload, PeerMessage};
use concord_types::codec::{
    read_seq_len, read_u64, read_u8, write_u32, write_u64, write_u8, Decode, Encode,
};
use concord_types::{Block, BlockBody, BlockHeader, Commit, CodecError, Hash, Proposal,
    Transaction, Vote};
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("Payload decode error: {0}")]
    Payload(#[from] CodecError),
}

// Message tags. Wire-stable; append only.
const TAG_HELLO: u8 = 0;
const TAG_NEW_TRANSACTION: u8 = 1;
const TAG_NEW_BLOCK_HEIGHT: u8 = 2;
const TAG_NEW_BLOCK: u8 = 3;
const TAG_PROPOSAL: u8 = 4;
const TAG_VOTE: u8 = 5;
const TAG_GET_CONSENTED_HEADER: u8 = 6;
const TAG_CONSENTED_HEADER: u8 = 7;
const TAG_GET_HEADERS: u8 = 8;
const TAG_HEADERS: u8 = 9;
const TAG_GET_BODIES: u8 = 10;
const TAG_BODIES: u8 = 11;

/// Encode a message to wire format.
pub fn encode_message(message: &PeerMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_u8(&mut out, WIRE_VERSION);
    match message {
        PeerMessage::Hello { height, genesis } => {
            write_u8(&mut out, TAG_HELLO);
            write_u64(&mut out, *height);
            genesis.encode_into(&mut out);
        }
        PeerMessage::NewTransaction { transaction } => {
            write_u8(&mut out, TAG_NEW_TRANSACTION);
            transaction.encode_into(&mut out);
        }
        PeerMessage::NewBlockHeight { height } => {
            write_u8(&mut out, TAG_NEW_BLOCK_HEIGHT);
            write_u64(&mut out, *height);
        }
        PeerMessage::NewBlock { block } => {
            write_u8(&mut out, TAG_NEW_BLOCK);
            block.encode_into(&mut out);
        }
        PeerMessage::NewConsensusMessage { message } => match message {
            ConsensusPayload::Proposal(proposal) => {
                write_u8(&mut out, TAG_PROPOSAL);
                proposal.encode_into(&mut out);
            }
            ConsensusPayload::Vote(vote) => {
                write_u8(&mut out, TAG_VOTE);
                vote.encode_into(&mut out);
            }
        },
        PeerMessage::GetConsentedHeader { height } => {
            write_u8(&mut out, TAG_GET_CONSENTED_HEADER);
            write_u64(&mut out, *height);
        }
        PeerMessage::ConsentedHeader { header, commit } => {
            write_u8(&mut out, TAG_CONSENTED_HEADER);
            header.encode_into(&mut out);
            commit.encode_into(&mut out);
        }
        PeerMessage::GetHeaders { from, count } => {
            write_u8(&mut out, TAG_GET_HEADERS);
            write_u64(&mut out, *from);
            write_u64(&mut out, *count);
        }
        PeerMessage::Headers { headers } => {
            write_u8(&mut out, TAG_HEADERS);
            write_u32(&mut out, headers.len() as u32);
            for header in headers {
                header.encode_into(&mut out);
            }
        }
        PeerMessage::GetBodies { heights } => {
            write_u8(&mut out, TAG_GET_BODIES);
            write_u32(&mut out, heights.len() as u32);
            for height in heights {
                write_u64(&mut out, *height);
            }
        }
        PeerMessage::Bodies { bodies } => {
            write_u8(&mut out, TAG_BODIES);
            write_u32(&mut out, bodies.len() as u32);
            for body in bodies {
                body.encode_into(&mut out);
            }
        }
    }
    out
}

/// Decode a message from wire format.
pub fn decode_message(data: &[u8]) -> Result<PeerMessage, WireError> {
    if data.len() < 2 {
        return Err(WireError::MessageTooShort);
    }
    let version = data[0];
    if version != WIRE_VERSION {
        return Err(WireError::UnknownVersion(version));
    }

    let mut input = &data[1..];
    let tag = read_u8(&mut input)?;
    let message = match tag {
        TAG_HELLO => PeerMessage::Hello {
            height: read_u64(&mut input)?,
            genesis: Hash::decode_from(&mut input)?,
        },
        TAG_NEW_TRANSACTION => PeerMessage::NewTransaction {
            transaction: Transaction::decode_from(&mut input)?,
        },
        TAG_NEW_BLOCK_HEIGHT => PeerMessage::NewBlockHeight {
            height: read_u64(&mut input)?,
        },
        TAG_NEW_BLOCK => PeerMessage::NewBlock {
            block: Box::new(Block::decode_from(&mut input)?),
        },
        TAG_PROPOSAL => PeerMessage::NewConsensusMessage {
            message: ConsensusPayload::Proposal(Box::new(Proposal::decode_from(&mut input)?)),
        },
        TAG_VOTE => PeerMessage::NewConsensusMessage {
            message: ConsensusPayload::Vote(Vote::decode_from(&mut input)?),
        },
        TAG_GET_CONSENTED_HEADER => PeerMessage::GetConsentedHeader {
            height: read_u64(&mut input)?,
        },
        TAG_CONSENTED_HEADER => PeerMessage::ConsentedHeader {
            header: Box::new(BlockHeader::decode_from(&mut input)?),
            commit: Commit::decode_from(&mut input)?,
        },
        TAG_GET_HEADERS => PeerMessage::GetHeaders {
            from: read_u64(&mut input)?,
            count: read_u64(&mut input)?,
        },
        TAG_HEADERS => {
            let len = read_seq_len(&mut input)?;
            let mut headers = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                headers.push(BlockHeader::decode_from(&mut input)?);
            }
            PeerMessage::Headers { headers }
        }
        TAG_GET_BODIES => {
            let len = read_seq_len(&mut input)?;
            let mut heights = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                heights.push(read_u64(&mut input)?);
            }
            PeerMessage::GetBodies { heights }
        }
        TAG_BODIES => {
            let len = read_seq_len(&mut input)?;
            let mut bodies = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                bodies.push(BlockBody::decode_from(&mut input)?);
            }
            PeerMessage::Bodies { bodies }
        }
        other => return Err(WireError::UnknownTag(other)),
    };

    if !input.is_empty() {
        return Err(WireError::Payload(CodecError::TrailingBytes));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{GenesisConfig, KeyPair, TransactionData, ValidatorEntry, VoteType};

    fn keypair(seed: u8) -> KeyPair {
        KeyPair::from_seed(&[seed; 32])
    }

    fn genesis_block() -> Block {
        GenesisConfig {
            validators: vec![ValidatorEntry {
                public_key: keypair(1).public_key(),
                voting_power: 1,
            }],
            timestamp: 0,
            app_state_hash: Hash::of(b"app"),
        }
        .genesis_block()
    }

    #[test]
    fn hello_round_trip() {
        let message = PeerMessage::Hello {
            height: 9,
            genesis: Hash::of(b"g"),
        };
        let bytes = encode_message(&message);
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn transaction_round_trip() {
        let key = keypair(2);
        let tx = Transaction::sign(
            TransactionData {
                nonce: 1,
                payload: b"hi".to_vec(),
                signer: key.public_key(),
            },
            &key,
        );
        let message = PeerMessage::NewTransaction { transaction: tx };
        assert_eq!(decode_message(&encode_message(&message)).unwrap(), message);
    }

    #[test]
    fn block_and_vote_round_trip() {
        let block = genesis_block();
        let message = PeerMessage::NewBlock {
            block: Box::new(block.clone()),
        };
        assert_eq!(decode_message(&encode_message(&message)).unwrap(), message);

        let vote = Vote::sign(VoteType::Precommit, 3, 1, Some(block.hash()), 0, &keypair(1));
        let message = PeerMessage::NewConsensusMessage {
            message: ConsensusPayload::Vote(vote),
        };
        assert_eq!(decode_message(&encode_message(&message)).unwrap(), message);
    }

    #[test]
    fn headers_and_bodies_round_trip() {
        let block = genesis_block();
        let message = PeerMessage::Headers {
            headers: vec![block.header.clone()],
        };
        assert_eq!(decode_message(&encode_message(&message)).unwrap(), message);

        let message = PeerMessage::Bodies {
            bodies: vec![block.body],
        };
        assert_eq!(decode_message(&encode_message(&message)).unwrap(), message);

        let message = PeerMessage::GetBodies {
            heights: vec![1, 2, 3],
        };
        assert_eq!(decode_message(&encode_message(&message)).unwrap(), message);
    }

    #[test]
    fn unknown_version_rejected() {
        let bytes = vec![99, TAG_HELLO, 0, 0];
        assert_eq!(decode_message(&bytes), Err(WireError::UnknownVersion(99)));
    }

    #[test]
    fn unknown_tag_rejected() {
        let bytes = vec![WIRE_VERSION, 200];
        assert_eq!(decode_message(&bytes), Err(WireError::UnknownTag(200)));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_message(&PeerMessage::NewBlockHeight { height: 1 });
        bytes.push(0);
        assert_eq!(
            decode_message(&bytes),
            Err(WireError::Payload(CodecError::TrailingBytes))
        );
    }
}
