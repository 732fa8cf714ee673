//! Cryptographic primitives: Ed25519 keys and signatures.
//!
//! These wrap `ed25519-dalek` behind fixed-width byte representations so the
//! canonical codec can treat them as opaque fields. Verification never
//! panics: a key that fails to parse simply fails verification.

use crate::hash::Hash;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verify a signature over `message`.
    ///
    /// Returns false for malformed keys or signatures rather than erroring;
    /// callers treat any failure as `BadSignature`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig).is_ok()
    }

    /// Derive the short address for this key.
    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}..)", &hex::encode(self.0)[..8])
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// The all-zero signature, used as a placeholder in tests.
    pub fn zero() -> Self {
        Self([0u8; 64])
    }

    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..)", &hex::encode(&self.0[..4]))
    }
}

/// A validator address: the truncated hash of its public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Hash::of(key.as_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.as_bytes()[..20]);
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({}..)", &hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Ed25519 signing key with its cached public half.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    public: PublicKey,
}

impl KeyPair {
    /// Derive a keypair deterministically from a 32-byte seed.
    ///
    /// Used by tests and the simulation runner to get reproducible
    /// validator identities.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn address(&self) -> Address {
        self.public.address()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let key = KeyPair::from_seed(&[7u8; 32]);
        let sig = key.sign(b"hello");
        assert!(key.public_key().verify(b"hello", &sig));
        assert!(!key.public_key().verify(b"other", &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let a = KeyPair::from_seed(&[1u8; 32]);
        let b = KeyPair::from_seed(&[2u8; 32]);
        let sig = a.sign(b"msg");
        assert!(!b.public_key().verify(b"msg", &sig));
    }

    #[test]
    fn seeded_keys_are_deterministic() {
        let a = KeyPair::from_seed(&[9u8; 32]);
        let b = KeyPair::from_seed(&[9u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.address(), b.address());
    }
}
