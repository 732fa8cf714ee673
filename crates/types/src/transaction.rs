//! Transaction types for consensus.

use crate::codec::{
    read_bytes, read_seq_len, read_u64, write_bytes, write_u32, write_u64, CodecError, Decode,
    Encode,
};
use crate::hash::Hasher;
use crate::{Hash, KeyPair, PublicKey, Signature};

/// The signed portion of a transaction.
///
/// The signature covers the canonical encoding of this struct; `signer` is
/// part of the signed bytes so a signature cannot be replayed under another
/// key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionData {
    /// Sender-chosen sequence number; interpretation belongs to the dapp.
    pub nonce: u64,
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// Public key of the signer.
    pub signer: PublicKey,
}

impl Encode for TransactionData {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_u64(out, self.nonce);
        write_bytes(out, &self.payload);
        self.signer.encode_into(out);
    }
}

impl Decode for TransactionData {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            nonce: read_u64(input)?,
            payload: read_bytes(input)?,
            signer: PublicKey::decode_from(input)?,
        })
    }
}

/// A signed transaction.
///
/// Identity is the hash of the canonical encoding (data + signature),
/// computed once at construction.
#[derive(Clone)]
pub struct Transaction {
    pub data: TransactionData,
    pub signature: Signature,
    /// Cached content hash.
    hash: Hash,
}

// Compare by hash; the hash covers every field.
impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Transaction {}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("hash", &self.hash)
            .field("nonce", &self.data.nonce)
            .field("payload_len", &self.data.payload.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Assemble a transaction from its parts, computing the content hash.
    pub fn new(data: TransactionData, signature: Signature) -> Self {
        let mut bytes = data.encode();
        signature.encode_into(&mut bytes);
        let hash = Hash::of(&bytes);
        Self {
            data,
            signature,
            hash,
        }
    }

    /// Sign `data` with `key` and assemble the transaction.
    pub fn sign(data: TransactionData, key: &KeyPair) -> Self {
        let signature = key.sign(&data.encode());
        Self::new(data, signature)
    }

    /// Content hash (transaction identity).
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Check the signature against the embedded signer key.
    pub fn verify_signature(&self) -> bool {
        self.data
            .signer
            .verify(&self.data.encode(), &self.signature)
    }
}

impl Encode for Transaction {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.data.encode_into(out);
        self.signature.encode_into(out);
    }
}

impl Decode for Transaction {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        let data = TransactionData::decode_from(input)?;
        let signature = Signature::decode_from(input)?;
        Ok(Self::new(data, signature))
    }
}

/// An ordered list of transactions with a deterministic root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionList(pub Vec<Transaction>);

impl TransactionList {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self(transactions)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Transaction> {
        self.0.iter()
    }

    /// Hashes of all transactions, in order.
    pub fn hashes(&self) -> Vec<Hash> {
        self.0.iter().map(Transaction::hash).collect()
    }

    /// Root hash over the ordered transaction hashes.
    ///
    /// The empty list hashes the empty byte string, so an empty block has a
    /// well-defined, stable transaction root.
    pub fn root(&self) -> Hash {
        let mut hasher = Hasher::new();
        for tx in &self.0 {
            hasher.update(tx.hash().as_bytes());
        }
        hasher.finalize()
    }
}

impl Encode for TransactionList {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_u32(out, self.0.len() as u32);
        for tx in &self.0 {
            tx.encode_into(out);
        }
    }
}

impl Decode for TransactionList {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        let len = read_seq_len(input)?;
        let mut txs = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            txs.push(Transaction::decode_from(input)?);
        }
        Ok(Self(txs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(nonce: u64, payload: &[u8]) -> Transaction {
        let key = KeyPair::from_seed(&[nonce as u8; 32]);
        Transaction::sign(
            TransactionData {
                nonce,
                payload: payload.to_vec(),
                signer: key.public_key(),
            },
            &key,
        )
    }

    #[test]
    fn round_trip_preserves_hash() {
        let t = tx(1, b"payload");
        let decoded = Transaction::decode(&t.encode()).unwrap();
        assert_eq!(decoded, t);
        assert_eq!(decoded.hash(), t.hash());
        assert!(decoded.verify_signature());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let t = tx(1, b"payload");
        let mut data = t.data.clone();
        data.payload = b"other".to_vec();
        let forged = Transaction::new(data, t.signature);
        assert!(!forged.verify_signature());
    }

    #[test]
    fn empty_list_root_is_hash_of_empty() {
        assert_eq!(TransactionList::default().root(), Hash::of(b""));
    }

    #[test]
    fn list_root_depends_on_order() {
        let a = tx(1, b"a");
        let b = tx(2, b"b");
        let ab = TransactionList::new(vec![a.clone(), b.clone()]);
        let ba = TransactionList::new(vec![b, a]);
        assert_ne!(ab.root(), ba.root());
    }
}
