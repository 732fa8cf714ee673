//! Responder: serves header/body/commit queries from the store.
//!
//! Stateless; invoked by the runner for `Get*` requests so the state
//! machine never touches storage. Requests beyond the tip answer empty;
//! malformed requests drop the peer.

use concord_messages::PeerMessage;
use concord_store::BlockStore;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Most headers or bodies served for one request.
const MAX_BATCH: u64 = 1024;

/// A request the responder refuses to serve; the peer is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponderError {
    #[error("Malformed request: {0}")]
    BadRequest(&'static str),
}

/// Serves peer queries by direct store reads.
pub struct Responder {
    store: Arc<dyn BlockStore>,
}

impl Responder {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }

    /// Answer a request message, `None` when there is nothing to say.
    pub fn respond(
        &self,
        request: &PeerMessage,
    ) -> Result<Option<PeerMessage>, ResponderError> {
        match request {
            PeerMessage::GetConsentedHeader { height } => {
                let Ok(header) = self.store.header_of(*height) else {
                    trace!(height, "Consented header beyond tip");
                    return Ok(None);
                };
                let Ok(commit) = self.store.commit_of(*height) else {
                    return Ok(None);
                };
                Ok(Some(PeerMessage::ConsentedHeader {
                    header: Box::new(header),
                    commit,
                }))
            }

            PeerMessage::GetHeaders { from, count } => {
                if *count == 0 || *count > MAX_BATCH {
                    return Err(ResponderError::BadRequest("header count out of range"));
                }
                let mut headers = Vec::new();
                for height in *from..from.saturating_add(*count) {
                    match self.store.header_of(height) {
                        Ok(header) => headers.push(header),
                        Err(_) => break,
                    }
                }
                Ok(Some(PeerMessage::Headers { headers }))
            }

            PeerMessage::GetBodies { heights } => {
                if heights.is_empty() || heights.len() as u64 > MAX_BATCH {
                    return Err(ResponderError::BadRequest("body count out of range"));
                }
                let mut bodies = Vec::new();
                for height in heights {
                    match self.store.body_of(*height) {
                        Ok(body) => bodies.push(body),
                        Err(_) => break,
                    }
                }
                Ok(Some(PeerMessage::Bodies { bodies }))
            }

            _ => Ok(None),
        }
    }
}
