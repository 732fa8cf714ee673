//! Fixed-width content hash.

use thiserror::Error;

/// Error parsing a hash from hex.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    #[error("Wrong length: expected 32 bytes, got {0}")]
    WrongLength(usize),
}

/// A 32-byte BLAKE3 digest over canonical bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The all-zero hash. Used as the parent hash of genesis.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Wrap an existing 32-byte digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let bytes = hex::decode(s).map_err(|e| HexError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(HexError::WrongLength(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for logs; full digest is rarely useful in traces.
        write!(f, "{}..", &self.to_hex()[..8])
    }
}

/// Incremental hasher over canonical bytes.
pub(crate) struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> Hash {
        Hash(*self.0.finalize().as_bytes())
    }
}
