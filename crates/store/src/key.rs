//! Typed keys with order-preserving encodings.
//!
//! The tree orders keys by their raw bytes. These encodings make byte order
//! agree with the natural order of the type:
//! - `u64`: 8-byte big-endian
//! - `i64`: 8-byte big-endian with the sign bit flipped
//! - `str` / `String`: UTF-8 bytes
//! - `[u8]` / `Vec<u8>`: the bytes themselves
//!
//! Mixing key types in one store is allowed; they simply interleave by byte
//! order.

use byteorder::{BigEndian, ByteOrder};

/// A value usable as a store key.
pub trait Key {
    /// Appends the encoded key to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Returns the encoded key.
    fn to_key_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// A key type that can be rebuilt from its encoding, as when reading keys
/// back from a scan.
pub trait DecodeKey: Key + Sized {
    /// Decodes a key, returning `None` if the bytes are not a valid encoding.
    fn decode(buf: &[u8]) -> Option<Self>;
}

impl Key for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut bytes = [0u8; 8];
        BigEndian::write_u64(&mut bytes, *self);
        buf.extend_from_slice(&bytes);
    }
}

impl DecodeKey for u64 {
    fn decode(buf: &[u8]) -> Option<Self> {
        (buf.len() == 8).then(|| BigEndian::read_u64(buf))
    }
}

impl Key for i64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        // Flip sign bit for lexicographic ordering:
        // i64::MIN -> 0x0000000000000000
        // -1       -> 0x7FFFFFFFFFFFFFFF
        // 0        -> 0x8000000000000000
        // i64::MAX -> 0xFFFFFFFFFFFFFFFF
        let transformed = (*self as u64) ^ (1u64 << 63);
        transformed.encode(buf);
    }
}

impl DecodeKey for i64 {
    fn decode(buf: &[u8]) -> Option<Self> {
        u64::decode(buf).map(|transformed| (transformed ^ (1u64 << 63)) as i64)
    }
}

impl Key for str {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_bytes());
    }
}

impl Key for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_str().encode(buf);
    }
}

impl DecodeKey for String {
    fn decode(buf: &[u8]) -> Option<Self> {
        std::str::from_utf8(buf).ok().map(str::to_string)
    }
}

impl Key for [u8] {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }
}

impl<const N: usize> Key for [u8; N] {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }
}

impl Key for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }
}

impl DecodeKey for Vec<u8> {
    fn decode(buf: &[u8]) -> Option<Self> {
        Some(buf.to_vec())
    }
}

impl<K: Key + ?Sized> Key for &K {
    fn encode(&self, buf: &mut Vec<u8>) {
        (**self).encode(buf);
    }
}
