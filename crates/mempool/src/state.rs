//! Mempool state.

use concord_core::{Action, DropReason, NodeError, PoolConfig, TxVerdict};
use concord_messages::PeerMessage;
use concord_types::{Hash, PeerId, Transaction};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, instrument, trace, warn};

/// Invalid submissions tolerated from one peer before it is dropped.
const MAX_PEER_STRIKES: u32 = 3;

#[derive(Debug)]
struct PoolEntry {
    tx: Transaction,
    /// Peer that delivered the transaction; `None` for local submissions.
    source: Option<PeerId>,
}

/// Mempool state machine.
///
/// Uses `HashMap` plus an admission-order queue; access is serialized by
/// the coordinator so no interior locking is needed.
pub struct PoolState {
    config: PoolConfig,

    /// Admitted transactions by hash.
    entries: HashMap<Hash, PoolEntry>,

    /// Admission order for FIFO candidate selection and overload eviction.
    order: VecDeque<Hash>,

    /// Hashes with an admission check in flight.
    pending_validation: HashSet<Hash>,

    /// Pool entries attributed to each peer (per-peer pending cap).
    per_peer: HashMap<PeerId, usize>,

    /// Invalid-submission strikes per peer.
    strikes: HashMap<PeerId, u32>,
}

impl PoolState {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
            pending_validation: HashSet::new(),
            per_peer: HashMap::new(),
            strikes: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Proposer candidates in admission order, capped at `max`. The dapp's
    /// `select_transactions` gets the final say via delegation.
    pub fn candidates(&self, max: usize) -> Vec<Transaction> {
        self.order
            .iter()
            .filter_map(|hash| self.entries.get(hash))
            .take(max)
            .map(|entry| entry.tx.clone())
            .collect()
    }

    /// A transaction arrived from a peer or the local client.
    #[instrument(skip(self, tx), fields(tx = %tx.hash()))]
    pub fn on_transaction_received(
        &mut self,
        source: Option<PeerId>,
        tx: Transaction,
    ) -> Vec<Action> {
        let hash = tx.hash();

        // Dedup against known and in-flight hashes: silent drop.
        if self.entries.contains_key(&hash) || self.pending_validation.contains(&hash) {
            trace!(tx = %hash, "Duplicate transaction ignored");
            return vec![];
        }

        if let Some(peer) = source {
            let pending = self.per_peer.get(&peer).copied().unwrap_or(0);
            if pending >= self.config.max_per_peer_pending {
                debug!(%peer, pending, "Per-peer pending cap reached, dropping transaction");
                return vec![];
            }
        }

        self.pending_validation.insert(hash);
        vec![Action::ValidateTransaction { source, tx }]
    }

    /// Admission (or re-validation) verdict arrived from the runner.
    pub fn on_transaction_validated(
        &mut self,
        source: Option<PeerId>,
        tx: Transaction,
        verdict: TxVerdict,
    ) -> Vec<Action> {
        let hash = tx.hash();

        // A verdict for a transaction already in the pool is a
        // re-validation after a committed block changed app state.
        if self.entries.contains_key(&hash) {
            if verdict != TxVerdict::Valid {
                debug!(tx = %hash, ?verdict, "Evicting transaction no longer valid");
                self.remove(&hash);
            }
            return vec![];
        }

        if !self.pending_validation.remove(&hash) {
            // Verdict for something already evicted or committed.
            return vec![];
        }

        match verdict {
            TxVerdict::Valid => self.admit(source, tx),
            TxVerdict::BadSignature => self.reject(
                source,
                NodeError::BadSignature { peer: source },
            ),
            TxVerdict::AppRejected => self.reject(source, NodeError::AppRejected),
        }
    }

    /// A block was executed: evict its transactions and re-validate the
    /// survivors against the new app state.
    pub fn on_block_executed(&mut self, tx_hashes: &[Hash]) -> Vec<Action> {
        for hash in tx_hashes {
            if self.remove(hash) {
                trace!(tx = %hash, "Evicted committed transaction");
            }
        }

        self.order
            .iter()
            .filter_map(|hash| self.entries.get(hash))
            .map(|entry| Action::ValidateTransaction {
                source: entry.source,
                tx: entry.tx.clone(),
            })
            .collect()
    }

    /// Forget per-peer accounting for a disconnected peer.
    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        self.per_peer.remove(&peer);
        self.strikes.remove(&peer);
    }

    fn admit(&mut self, source: Option<PeerId>, tx: Transaction) -> Vec<Action> {
        let hash = tx.hash();

        // Overload: evict the oldest admitted entry first.
        while self.entries.len() >= self.config.max_pool_size {
            let Some(oldest) = self.order.front().copied() else {
                break;
            };
            warn!(evicted = %oldest, "Pool full, evicting oldest transaction");
            self.remove(&oldest);
        }

        if let Some(peer) = source {
            *self.per_peer.entry(peer).or_insert(0) += 1;
        }
        self.entries.insert(hash, PoolEntry { tx: tx.clone(), source });
        self.order.push_back(hash);
        debug!(tx = %hash, pool_size = self.entries.len(), "Transaction admitted");

        vec![Action::GossipExcept {
            except: source,
            message: PeerMessage::NewTransaction { transaction: tx },
        }]
    }

    fn reject(&mut self, source: Option<PeerId>, error: NodeError) -> Vec<Action> {
        let mut actions = vec![Action::EmitError { error }];
        if let Some(peer) = source {
            let strikes = self.strikes.entry(peer).or_insert(0);
            *strikes += 1;
            if *strikes >= MAX_PEER_STRIKES {
                warn!(%peer, strikes = *strikes, "Too many invalid transactions, dropping peer");
                actions.push(Action::DropPeer {
                    peer,
                    reason: DropReason::InvalidData,
                });
            }
        }
        actions
    }

    fn remove(&mut self, hash: &Hash) -> bool {
        match self.entries.remove(hash) {
            Some(entry) => {
                if let Some(peer) = entry.source {
                    if let Some(count) = self.per_peer.get_mut(&peer) {
                        *count = count.saturating_sub(1);
                    }
                }
                self.order.retain(|h| h != hash);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{KeyPair, TransactionData};

    fn tx(nonce: u64) -> Transaction {
        let key = KeyPair::from_seed(&[42; 32]);
        Transaction::sign(
            TransactionData {
                nonce,
                payload: vec![1, 2, 3],
                signer: key.public_key(),
            },
            &key,
        )
    }

    fn pool() -> PoolState {
        PoolState::new(PoolConfig::default())
    }

    fn admit(pool: &mut PoolState, source: Option<PeerId>, t: Transaction) {
        let actions = pool.on_transaction_received(source, t.clone());
        assert!(matches!(actions[0], Action::ValidateTransaction { .. }));
        pool.on_transaction_validated(source, t, TxVerdict::Valid);
    }

    #[test]
    fn admission_gossips_except_source() {
        let mut pool = pool();
        let t = tx(1);
        let source = Some(PeerId(7));
        pool.on_transaction_received(source, t.clone());
        let actions = pool.on_transaction_validated(source, t.clone(), TxVerdict::Valid);

        assert!(pool.contains(&t.hash()));
        match &actions[0] {
            Action::GossipExcept { except, message } => {
                assert_eq!(*except, Some(PeerId(7)));
                assert!(matches!(message, PeerMessage::NewTransaction { .. }));
            }
            other => panic!("Expected gossip, got {other:?}"),
        }
    }

    #[test]
    fn duplicates_are_silently_dropped() {
        let mut pool = pool();
        let t = tx(1);
        admit(&mut pool, None, t.clone());
        assert!(pool.on_transaction_received(None, t.clone()).is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn bad_signature_strikes_lead_to_peer_drop() {
        let mut pool = pool();
        let peer = Some(PeerId(3));
        let mut dropped = false;
        for nonce in 0..3 {
            let t = tx(nonce);
            pool.on_transaction_received(peer, t.clone());
            let actions = pool.on_transaction_validated(peer, t, TxVerdict::BadSignature);
            assert!(matches!(
                actions[0],
                Action::EmitError {
                    error: NodeError::BadSignature { .. }
                }
            ));
            dropped = actions
                .iter()
                .any(|a| matches!(a, Action::DropPeer { peer: PeerId(3), .. }));
        }
        assert!(dropped, "Third strike should drop the peer");
    }

    #[test]
    fn executed_block_evicts_and_revalidates() {
        let mut pool = pool();
        let committed = tx(1);
        let survivor = tx(2);
        admit(&mut pool, None, committed.clone());
        admit(&mut pool, None, survivor.clone());

        let actions = pool.on_block_executed(&[committed.hash()]);
        assert!(!pool.contains(&committed.hash()));
        assert!(pool.contains(&survivor.hash()));
        // One re-validation for the survivor.
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            Action::ValidateTransaction { tx, .. } if tx.hash() == survivor.hash()
        ));

        // The re-validation verdict can now evict it without strikes.
        let evictions = pool.on_transaction_validated(None, survivor.clone(), TxVerdict::AppRejected);
        assert!(evictions.is_empty());
        assert!(!pool.contains(&survivor.hash()));
    }

    #[test]
    fn overload_evicts_fifo() {
        let mut pool = PoolState::new(PoolConfig {
            max_pool_size: 2,
            ..PoolConfig::default()
        });
        let a = tx(1);
        let b = tx(2);
        let c = tx(3);
        admit(&mut pool, None, a.clone());
        admit(&mut pool, None, b.clone());
        admit(&mut pool, None, c.clone());

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&a.hash()), "Oldest entry should be evicted");
        assert!(pool.contains(&b.hash()));
        assert!(pool.contains(&c.hash()));
    }

    #[test]
    fn per_peer_cap_limits_inflight() {
        let mut pool = PoolState::new(PoolConfig {
            max_per_peer_pending: 1,
            ..PoolConfig::default()
        });
        let peer = Some(PeerId(1));
        admit(&mut pool, peer, tx(1));
        // Second transaction from the same peer is refused outright.
        assert!(pool.on_transaction_received(peer, tx(2)).is_empty());
        // Another peer is unaffected.
        assert!(!pool
            .on_transaction_received(Some(PeerId(2)), tx(3))
            .is_empty());
    }

    #[test]
    fn candidates_preserve_admission_order() {
        let mut pool = pool();
        let a = tx(1);
        let b = tx(2);
        admit(&mut pool, None, a.clone());
        admit(&mut pool, None, b.clone());
        let candidates = pool.candidates(10);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].hash(), a.hash());
        assert_eq!(candidates[1].hash(), b.hash());
    }
}
