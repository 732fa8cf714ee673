//! Deterministic test application.

use concord_core::{Dapp, DappError};
use concord_types::{Hash, Transaction};

/// A dapp whose state is a hash chain over every executed transaction.
///
/// Two nodes that execute the same transactions in the same order report
/// the same state hash, so agreement on app state is directly observable.
pub struct HashChainDapp {
    state: Hash,
    executed: Vec<Hash>,
}

impl HashChainDapp {
    pub fn new(genesis_state: Hash) -> Self {
        Self {
            state: genesis_state,
            executed: Vec::new(),
        }
    }

    /// Every transaction hash executed, in order.
    pub fn executed(&self) -> &[Hash] {
        &self.executed
    }

    /// How many times `hash` was executed.
    pub fn execution_count(&self, hash: &Hash) -> usize {
        self.executed.iter().filter(|h| *h == hash).count()
    }
}

impl Dapp for HashChainDapp {
    fn execute_transaction(&mut self, tx: &Transaction) -> Result<(), DappError> {
        let hash = tx.hash();
        // Empty payloads are the dapp's rejection rule; they still count
        // as executed (they were committed).
        self.executed.push(hash);
        if tx.data.payload.is_empty() {
            return Err(DappError::Rejected("empty payload".into()));
        }
        let mut bytes = self.state.as_bytes().to_vec();
        bytes.extend_from_slice(hash.as_bytes());
        self.state = Hash::of(&bytes);
        Ok(())
    }

    fn validate_transaction(&self, tx: &Transaction) -> bool {
        !tx.data.payload.is_empty()
    }

    fn select_transactions(&self, candidates: Vec<Transaction>) -> Vec<Transaction> {
        // Admission order is already deterministic; keep it.
        candidates
    }

    fn app_state_hash(&self) -> Hash {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{KeyPair, TransactionData};

    fn tx(payload: &[u8]) -> Transaction {
        let key = KeyPair::from_seed(&[5; 32]);
        Transaction::sign(
            TransactionData {
                nonce: 1,
                payload: payload.to_vec(),
                signer: key.public_key(),
            },
            &key,
        )
    }

    #[test]
    fn same_transactions_same_state() {
        let mut a = HashChainDapp::new(Hash::of(b"g"));
        let mut b = HashChainDapp::new(Hash::of(b"g"));
        let t = tx(b"x");
        a.execute_transaction(&t).unwrap();
        b.execute_transaction(&t).unwrap();
        assert_eq!(a.app_state_hash(), b.app_state_hash());
        assert_ne!(a.app_state_hash(), Hash::of(b"g"));
    }

    #[test]
    fn rejection_leaves_state_untouched() {
        let mut dapp = HashChainDapp::new(Hash::of(b"g"));
        let before = dapp.app_state_hash();
        assert!(dapp.execute_transaction(&tx(b"")).is_err());
        assert_eq!(dapp.app_state_hash(), before);
        assert_eq!(dapp.executed().len(), 1);
    }
}
