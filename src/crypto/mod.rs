//! Key stream contract, offset obfuscation and version hashing.
//!
//! # Key stream
//! The archive key is an arbitrarily long, deterministic byte sequence derived
//! from a 4-byte IV and a user key.  Its generator lives outside this crate;
//! everything here consumes it through the [`KeyStream`] trait, indexed by
//! absolute byte position.  [`WzKey`] is the cheap, cloneable handle passed
//! around the tree.
//!
//! # Offsets
//! Directory entries store pointers transformed by the position of the field
//! itself and the per-file `hash`.  [`decrypt_offset`] and [`encrypt_offset`]
//! are exact inverses for a fixed `(hash, header_start)` pair.  A writer and a
//! reader that disagree on either value produce an archive that parses without
//! error and decodes to garbage; nothing in the format can detect it.

use std::fmt;
use std::sync::Arc;

/// Subtracted from every offset mask.  Fixed by the archive format.
pub const OFFSET_CONSTANT: u32 = 0x581C_3F6D;

/// Starting value of the rolling mask for single-byte strings.
pub const ASCII_MASK_SEED: u8 = 0xAA;

/// Starting value of the rolling mask for UTF-16 strings.
pub const UNICODE_MASK_SEED: u16 = 0xAAAA;

// ── KeyStream ────────────────────────────────────────────────────────────────

/// A deterministic byte sequence addressable by index.
///
/// Implementations must return the same byte for the same index forever and
/// must be safe to query from several threads at once.
pub trait KeyStream: Send + Sync {
    /// Byte at position `index` of the stream.
    fn byte_at(&self, index: usize) -> u8;

    /// Bytes that uniquely identify the generator (typically IV plus user
    /// key).  Two streams with equal identities are treated as the same key.
    fn identity(&self) -> Vec<u8>;
}

/// Key stream for archives written with an all-zero IV: every byte is zero,
/// so the secondary layer degenerates to the rolling masks alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroKeyStream;

impl KeyStream for ZeroKeyStream {
    fn byte_at(&self, _index: usize) -> u8 { 0 }
    fn identity(&self) -> Vec<u8> { vec![0, 0, 0, 0] }
}

// ── WzKey ────────────────────────────────────────────────────────────────────

/// Shared handle to a [`KeyStream`].
#[derive(Clone)]
pub struct WzKey {
    stream: Arc<dyn KeyStream>,
}

impl WzKey {
    pub fn new<K: KeyStream + 'static>(stream: K) -> Self {
        Self { stream: Arc::new(stream) }
    }

    pub fn from_arc(stream: Arc<dyn KeyStream>) -> Self {
        Self { stream }
    }

    /// The all-zero key.
    pub fn zero() -> Self {
        Self::new(ZeroKeyStream)
    }

    #[inline]
    pub fn byte(&self, index: usize) -> u8 {
        self.stream.byte_at(index)
    }

    /// Key word applied to the `index`-th UTF-16 character: two consecutive
    /// stream bytes, the higher-indexed one in the high half.
    #[inline]
    pub fn word(&self, index: usize) -> u16 {
        let lo = self.byte(index * 2) as u16;
        let hi = self.byte(index * 2 + 1) as u16;
        (hi << 8) | lo
    }

    /// XOR `buf[i]` with key byte `i` for every byte of `buf`.
    pub fn xor_in_place(&self, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= self.byte(i);
        }
    }

    pub fn identity(&self) -> Vec<u8> {
        self.stream.identity()
    }
}

impl PartialEq for WzKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.stream, &other.stream) || self.identity() == other.identity()
    }
}

impl Eq for WzKey {}

impl Default for WzKey {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for WzKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WzKey")
            .field("identity", &self.identity())
            .finish()
    }
}

// ── Offset obfuscation ───────────────────────────────────────────────────────

/// Mask applied to the offset field located at absolute stream `position`.
#[inline]
pub fn offset_mask(position: u32, header_start: u32, hash: u32) -> u32 {
    let t = (position.wrapping_sub(header_start) ^ 0xFFFF_FFFF)
        .wrapping_mul(hash)
        .wrapping_sub(OFFSET_CONSTANT);
    t.rotate_left(t & 0x1F)
}

/// Recover the real pointer from the `raw` field read at `position`.
#[inline]
pub fn decrypt_offset(position: u32, header_start: u32, hash: u32, raw: u32) -> u32 {
    (offset_mask(position, header_start, hash) ^ raw)
        .wrapping_add(header_start.wrapping_mul(2))
}

/// Produce the field to store at `position` so that [`decrypt_offset`]
/// yields `value`.
#[inline]
pub fn encrypt_offset(position: u32, header_start: u32, hash: u32, value: u32) -> u32 {
    offset_mask(position, header_start, hash)
        ^ value.wrapping_sub(header_start.wrapping_mul(2))
}

// ── Version hash ─────────────────────────────────────────────────────────────

/// Per-file hash and the one-byte "encrypted version" stored after the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionHash {
    pub version:           u16,
    pub hash:              u32,
    pub encrypted_version: u16,
}

/// Derive the offset hash from a client version number.
///
/// The hash folds over the decimal digits of `version`; the encrypted version
/// is `0xFF` XORed with the four hash bytes.
pub fn version_hash(version: u16) -> VersionHash {
    let hash = version
        .to_string()
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(32).wrapping_add(b as u32).wrapping_add(1));
    let [a, b, c, d] = hash.to_be_bytes();
    let encrypted_version = (0xFF ^ a ^ b ^ c ^ d) as u16;
    VersionHash { version, hash, encrypted_version }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::SeededKeyStream;

    #[test]
    fn offset_roundtrip_fixed_points() {
        let (hs, hash) = (60u32, version_hash(83).hash);
        for pos in [62u32, 100, 4096, 0x7FFF_FFFF] {
            for value in [0u32, 60, 123_456, u32::MAX] {
                let field = encrypt_offset(pos, hs, hash, value);
                assert_eq!(decrypt_offset(pos, hs, hash, field), value);
            }
        }
    }

    #[test]
    fn offset_depends_on_position() {
        let hash = version_hash(95).hash;
        assert_ne!(
            encrypt_offset(100, 60, hash, 5000),
            encrypt_offset(104, 60, hash, 5000),
        );
    }

    #[test]
    fn version_hash_known_values() {
        // "83" → ((0*32 + '8' + 1) * 32) + '3' + 1 = 57*32 + 52
        let vh = version_hash(83);
        assert_eq!(vh.hash, 57 * 32 + 52);
        assert_eq!(vh.encrypted_version, (0xFF ^ (vh.hash & 0xFF) ^ (vh.hash >> 8)) as u16);
    }

    #[test]
    fn key_equality_by_identity() {
        let a = WzKey::new(SeededKeyStream(7));
        let b = WzKey::new(SeededKeyStream(7));
        let c = WzKey::new(SeededKeyStream(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(WzKey::zero(), WzKey::default());
    }

    #[test]
    fn key_word_is_little_endian_pair() {
        let key = WzKey::new(SeededKeyStream(3));
        let w = key.word(5);
        assert_eq!(w & 0xFF, key.byte(10) as u16);
        assert_eq!(w >> 8, key.byte(11) as u16);
    }
}
