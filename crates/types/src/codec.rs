//! Canonical serialization.
//!
//! Field order is CONSENSUS-RELEVANT; changing it is a hard fork. The rules:
//!
//! - integers are big-endian, fixed width
//! - hashes, keys and signatures are raw fixed-width bytes
//! - variable-length sequences carry a `u32` element count
//! - `Option<T>` is a presence byte (0/1) followed by the value
//! - no trailing padding; decoders reject leftover bytes
//!
//! Hashes and signatures are always computed over these bytes.

use thiserror::Error;

/// Errors from canonical decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Trailing bytes after decode")]
    TrailingBytes,

    #[error("Invalid enum tag {tag} for {what}")]
    InvalidTag { what: &'static str, tag: u8 },

    #[error("Length {len} exceeds limit {limit}")]
    LengthOverflow { len: u64, limit: u64 },
}

/// Sequences longer than this are rejected outright. Generous bound; real
/// payloads are limited by pool and block size configuration long before.
pub const MAX_SEQ_LEN: u32 = 1 << 20;

/// A type with a canonical byte encoding.
pub trait Encode {
    fn encode_into(&self, out: &mut Vec<u8>);

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

/// A type decodable from its canonical encoding.
pub trait Decode: Sized {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError>;

    /// Decode a complete buffer, rejecting trailing bytes.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut input = bytes;
        let value = Self::decode_from(&mut input)?;
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(value)
    }
}

pub fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < n {
        return Err(CodecError::UnexpectedEof);
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

pub fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn read_u8(input: &mut &[u8]) -> Result<u8, CodecError> {
    Ok(take(input, 1)?[0])
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn read_u32(input: &mut &[u8]) -> Result<u32, CodecError> {
    let b = take(input, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn read_u64(input: &mut &[u8]) -> Result<u64, CodecError> {
    let b = take(input, 8)?;
    Ok(u64::from_be_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

pub fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

pub fn read_bytes(input: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = read_u32(input)?;
    if len > MAX_SEQ_LEN {
        return Err(CodecError::LengthOverflow {
            len: len as u64,
            limit: MAX_SEQ_LEN as u64,
        });
    }
    Ok(take(input, len as usize)?.to_vec())
}

pub fn read_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], CodecError> {
    let b = take(input, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    Ok(out)
}

/// Read a `u32` sequence count, bounded by `MAX_SEQ_LEN`.
pub fn read_seq_len(input: &mut &[u8]) -> Result<usize, CodecError> {
    let len = read_u32(input)?;
    if len > MAX_SEQ_LEN {
        return Err(CodecError::LengthOverflow {
            len: len as u64,
            limit: MAX_SEQ_LEN as u64,
        });
    }
    Ok(len as usize)
}

pub fn write_option<T, F: Fn(&mut Vec<u8>, &T)>(out: &mut Vec<u8>, v: &Option<T>, f: F) {
    match v {
        None => write_u8(out, 0),
        Some(inner) => {
            write_u8(out, 1);
            f(out, inner);
        }
    }
}

pub fn read_option<T, F: Fn(&mut &[u8]) -> Result<T, CodecError>>(
    input: &mut &[u8],
    f: F,
) -> Result<Option<T>, CodecError> {
    match read_u8(input)? {
        0 => Ok(None),
        1 => Ok(Some(f(input)?)),
        tag => Err(CodecError::InvalidTag {
            what: "Option",
            tag,
        }),
    }
}

// Canonical impls for the primitive building blocks.

impl Encode for crate::Hash {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl Decode for crate::Hash {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(crate::Hash::from_bytes(read_array::<32>(input)?))
    }
}

impl Encode for crate::PublicKey {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl Decode for crate::PublicKey {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(crate::PublicKey::from_bytes(read_array::<32>(input)?))
    }
}

impl Encode for crate::Signature {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl Decode for crate::Signature {
    fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(crate::Signature::from_bytes(read_array::<64>(input)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hash;

    #[test]
    fn u64_is_big_endian() {
        let mut out = Vec::new();
        write_u64(&mut out, 0x0102030405060708);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = Hash::ZERO.encode();
        bytes.push(0);
        assert_eq!(Hash::decode(&bytes), Err(CodecError::TrailingBytes));
    }

    #[test]
    fn short_input_rejected() {
        assert_eq!(Hash::decode(&[0u8; 16]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn option_round_trip() {
        let mut out = Vec::new();
        write_option(&mut out, &Some(Hash::of(b"a")), |o, h: &Hash| {
            h.encode_into(o)
        });
        write_option::<Hash, _>(&mut out, &None, |o, h| h.encode_into(o));

        let mut input = out.as_slice();
        let some = read_option(&mut input, Hash::decode_from).unwrap();
        let none = read_option(&mut input, Hash::decode_from).unwrap();
        assert_eq!(some, Some(Hash::of(b"a")));
        assert_eq!(none, None);
        assert!(input.is_empty());
    }
}
