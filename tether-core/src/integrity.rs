//! Integrity: incremental MD5 over transferred bytes, hex digests, case-insensitive compare.

use std::fmt;

use md5::{Digest, Md5};

/// Incremental content-hash accumulator. Feed chunks in stream order, then finalize once.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Md5,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes folded in so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

/// 16-byte MD5 digest.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex, the wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compare against a hex digest supplied by the server, ignoring case and surrounding whitespace.
    pub fn matches_hex(&self, expected: &str) -> bool {
        self.to_hex().eq_ignore_ascii_case(expected.trim())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One-shot hash of a complete buffer.
pub fn hash_bytes(payload: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            hash_bytes(b"123456").to_hex(),
            "e10adc3949ba59abbe56e057f20f883e"
        );
        assert_eq!(hash_bytes(b"").to_hex(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn incremental_equals_one_shot() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut h = ContentHasher::new();
        for chunk in payload.chunks(777) {
            h.update(chunk);
        }
        assert_eq!(h.bytes(), payload.len() as u64);
        assert_eq!(h.finalize(), hash_bytes(&payload));
    }

    #[test]
    fn compare_ignores_case() {
        let h = hash_bytes(b"123456");
        assert!(h.matches_hex("E10ADC3949BA59ABBE56E057F20F883E"));
        assert!(h.matches_hex(" e10adc3949ba59abbe56e057f20f883e\n"));
        assert!(!h.matches_hex("deadbeefdeadbeefdeadbeefdeadbeef"));
    }
}
