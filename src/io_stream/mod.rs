//! Binary decoder/encoder and the shared backing stream.
//!
//! # Decoder / encoder
//! [`WzReader`] and [`WzWriter`] are symmetric codecs for compressed
//! integers, masked strings (optionally in secondary mode), tagged string
//! blocks with back-references, and obfuscated offsets.  Both carry the
//! `(header_start, hash)` pair of the archive they belong to; see
//! [`crate::crypto`] for why a mismatch cannot be detected.
//!
//! # Shared stream
//! Images and canvases load lazily from the file they were opened from.  All
//! of them share one [`SharedStream`], whose cursor is the only mutable state.
//! Every lazy load goes through [`SharedStream::read_at`], which holds the
//! stream's lock for the whole save/seek/read/restore sequence.  Streams of
//! different files never share a lock.

pub mod reader;
pub mod writer;

use parking_lot::Mutex;
use std::io::{self, Read, Seek};
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::WzKey;

pub use reader::WzReader;
pub use writer::{StringKey, WzWriter};

// ── String block tags ────────────────────────────────────────────────────────

/// Property-name string written inline.
pub const TAG_INLINE: u8 = 0x00;
/// Property-name string stored as a back-reference.
pub const TAG_OFFSET: u8 = 0x01;
/// Directory entry name stored as a back-reference.
pub const TAG_OBJECT_OFFSET: u8 = 0x02;
/// Extended type name / image header written inline.
pub const TAG_INLINE_EXTENDED: u8 = 0x73;
/// Extended type name / image header stored as a back-reference.
pub const TAG_OFFSET_EXTENDED: u8 = 0x1B;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid string block tag 0x{tag:02x} at position {position}")]
    InvalidStringBlock { tag: u8, position: u64 },
    #[error("Malformed length {length} at position {position}")]
    BadLength { length: i64, position: u64 },
    #[error("Unknown property tag 0x{tag:02x} for '{name}'")]
    UnknownPropertyTag { tag: u8, name: String },
    #[error("Unknown directory entry tag {tag} at position {position}")]
    UnknownEntryTag { tag: u8, position: u64 },
    #[error("Unexpected image header '{0}'")]
    BadImageHeader(String),
    #[error("Unknown extended property type '{0}' outside a sized block")]
    UnsizedExtended(String),
    #[error("Offset {offset} is outside the archive (length {len})")]
    OffsetOutOfBounds { offset: u64, len: u64 },
}

// ── Shared stream ────────────────────────────────────────────────────────────

/// Object-safe `Read + Seek` for boxing heterogeneous sources.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

pub type BoxedReader = WzReader<Box<dyn ReadSeek>>;

/// A decoder shared by every lazily-loaded node of one archive file.
#[derive(Clone)]
pub struct SharedStream {
    inner: Arc<Mutex<BoxedReader>>,
}

impl SharedStream {
    pub fn new<R: ReadSeek + 'static>(
        source:       R,
        key:          WzKey,
        header_start: u32,
        hash:         u32,
    ) -> Self {
        let boxed: Box<dyn ReadSeek> = Box::new(source);
        Self::from_reader(WzReader::new(boxed, key, header_start, hash))
    }

    pub fn from_reader(reader: BoxedReader) -> Self {
        Self { inner: Arc::new(Mutex::new(reader)) }
    }

    /// Run `f` with the cursor at `offset`, holding the stream lock for the
    /// whole call.  The cursor is restored afterwards, even when `f` fails.
    pub fn read_at<T, E, F>(&self, offset: u64, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut BoxedReader) -> Result<T, E>,
        E: From<io::Error>,
    {
        let mut reader = self.inner.lock();
        let saved = reader.position()?;
        reader.seek_to(offset)?;
        let result = f(&mut reader);
        reader.seek_to(saved)?;
        result
    }

    /// Exclusive access without repositioning.
    pub fn with_reader<T>(&self, f: impl FnOnce(&mut BoxedReader) -> T) -> T {
        f(&mut self.inner.lock())
    }

    pub fn len(&self) -> io::Result<u64> {
        self.with_reader(|r| {
            let pos = r.position()?;
            let end = r.seek(io::SeekFrom::End(0))?;
            r.seek_to(pos)?;
            Ok(end)
        })
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        self.len().map(|l| l == 0)
    }

    /// Whether two handles refer to the same underlying file.
    pub fn same_stream(&self, other: &SharedStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStream")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::SeededKeyStream;
    use crate::crypto::version_hash;
    use std::io::Cursor;

    fn roundtrip(s: &str, secondary: bool) -> String {
        let key = WzKey::new(SeededKeyStream(0x5EED));
        let mut w = WzWriter::new(Cursor::new(Vec::new()), key.clone(), 0, 0);
        w.write_string(s, secondary).unwrap();
        let bytes = w.into_inner().into_inner();
        let mut r = WzReader::new(Cursor::new(bytes), key, 0, 0);
        r.read_string(secondary).unwrap()
    }

    #[test]
    fn string_roundtrip_boundaries() {
        let long_ascii = "x".repeat(40_000);
        let long_wide = "\u{D55C}".repeat(33_000);
        let cases = [
            "", "a", "ab", "abc", "abcd", "abcde",
            &"a".repeat(127), &"a".repeat(128), &"a".repeat(129),
            &"\u{00E9}".repeat(126), &"\u{00E9}".repeat(127), &"\u{00E9}".repeat(128),
            long_ascii.as_str(), long_wide.as_str(),
            "mixed \u{4E2D}\u{6587} text", "Property", "Shape2D#Convex2D",
        ];
        for secondary in [false, true] {
            for s in cases {
                assert_eq!(roundtrip(s, secondary), s, "len {} secondary {secondary}", s.len());
            }
        }
    }

    #[test]
    fn ascii_length_128_uses_sentinel() {
        let mut w = WzWriter::new(Cursor::new(Vec::new()), WzKey::zero(), 0, 0);
        w.write_string(&"q".repeat(128), false).unwrap();
        let bytes = w.into_inner().into_inner();
        assert_eq!(bytes[0] as i8, i8::MIN);
        assert_eq!(&bytes[1..5], &128i32.to_le_bytes());
    }

    #[test]
    fn secondary_mode_changes_ciphertext() {
        let key = WzKey::new(SeededKeyStream(11));
        let mut plain = WzWriter::new(Cursor::new(Vec::new()), key.clone(), 0, 0);
        let mut keyed = WzWriter::new(Cursor::new(Vec::new()), key, 0, 0);
        plain.write_string("origin", false).unwrap();
        keyed.write_string("origin", true).unwrap();
        assert_ne!(plain.into_inner().into_inner(), keyed.into_inner().into_inner());
    }

    #[test]
    fn zero_length_after_sentinel_is_empty() {
        let mut bytes = vec![i8::MIN as u8];
        bytes.extend_from_slice(&0i32.to_le_bytes());
        let mut r = WzReader::new(Cursor::new(bytes), WzKey::zero(), 0, 0);
        assert_eq!(r.read_string(false).unwrap(), "");
    }

    #[test]
    fn compressed_int_boundaries() {
        let values = [0, 1, -1, 127, 128, -127, -128, -129, i32::MAX, i32::MIN];
        let mut w = WzWriter::new(Cursor::new(Vec::new()), WzKey::zero(), 0, 0);
        for v in values {
            w.write_compressed_int(v).unwrap();
            w.write_compressed_long(v as i64 * 3).unwrap();
        }
        let mut r = WzReader::new(Cursor::new(w.into_inner().into_inner()), WzKey::zero(), 0, 0);
        for v in values {
            assert_eq!(r.read_compressed_int().unwrap(), v);
            assert_eq!(r.read_compressed_long().unwrap(), v as i64 * 3);
        }
    }

    #[test]
    fn interned_strings_back_reference() {
        let mut w = WzWriter::new(Cursor::new(Vec::new()), WzKey::zero(), 0, 0);
        w.write_string_value("origin", TAG_INLINE, TAG_OFFSET, false).unwrap();
        let second = w.position().unwrap();
        w.write_string_value("origin", TAG_INLINE, TAG_OFFSET, false).unwrap();
        w.write_string_value("abcd", TAG_INLINE, TAG_OFFSET, false).unwrap();
        w.write_string_value("abcd", TAG_INLINE, TAG_OFFSET, false).unwrap();
        let bytes = w.into_inner().into_inner();
        assert_eq!(bytes[second as usize], TAG_OFFSET);
        // inline "origin" (8) + back-reference (5) + two inline "abcd" (6 each)
        assert_eq!(bytes.len(), 25);

        let mut r = WzReader::new(Cursor::new(bytes), WzKey::zero(), 0, 0);
        for expected in ["origin", "origin", "abcd", "abcd"] {
            assert_eq!(r.read_string_block(0, false).unwrap(), expected);
        }
    }

    #[test]
    fn object_values_are_keyed_by_kind() {
        let mut w = WzWriter::new(Cursor::new(vec![0u8; 10]), WzKey::zero(), 10, 0);
        w.seek_to(10).unwrap();
        assert!(!w.write_object_value("Effect", 3, false).unwrap());
        assert!(!w.write_object_value("Effect", 4, false).unwrap());
        assert!(w.write_object_value("Effect", 3, false).unwrap());
        assert_eq!(w.interned(), 2);
    }

    #[test]
    fn invalid_string_block_tag() {
        let mut r = WzReader::new(Cursor::new(vec![0x42u8, 0, 0]), WzKey::zero(), 0, 0);
        assert!(matches!(
            r.read_string_block(0, false),
            Err(DecodeError::InvalidStringBlock { tag: 0x42, position: 0 })
        ));
    }

    #[test]
    fn offset_field_roundtrip_through_streams() {
        let vh = version_hash(176);
        let mut w = WzWriter::new(Cursor::new(vec![0u8; 64]), WzKey::zero(), 60, vh.hash);
        w.seek_to(62).unwrap();
        w.write_offset(0xDEAD_BEEF).unwrap();
        w.write_offset(61).unwrap();
        let mut r = WzReader::new(Cursor::new(w.into_inner().into_inner()), WzKey::zero(), 60, vh.hash);
        r.seek_to(62).unwrap();
        assert_eq!(r.read_offset().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_offset().unwrap(), 61);
    }

    #[test]
    #[should_panic(expected = "cannot roll stream position")]
    fn rollback_below_origin_panics() {
        let mut r = WzReader::new(Cursor::new(vec![1u8, 2, 3]), WzKey::zero(), 0, 0);
        r.skip(1).unwrap();
        let _ = r.rollback(2);
    }

    #[test]
    fn truncated_string_lengths_fail_cleanly() {
        // ASCII sentinel declaring i32::MAX bytes, then one byte of data.
        let mut bytes = vec![0x80];
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.push(0x41);
        let mut r = WzReader::new(Cursor::new(bytes), WzKey::zero(), 0, 0);
        assert!(matches!(
            r.read_string(false),
            Err(DecodeError::BadLength { length, position: 5 }) if length == i32::MAX as i64
        ));

        // UTF-16 with 3 units declared but only 2 bytes left.
        let mut r = WzReader::new(Cursor::new(vec![3u8, 0xAA, 0xAA]), WzKey::zero(), 0, 0);
        assert!(matches!(r.read_string(false), Err(DecodeError::BadLength { length: 6, .. })));
    }

    #[test]
    fn read_bytes_past_end_fails_before_allocating() {
        let mut r = WzReader::new(Cursor::new(vec![1u8, 2, 3]), WzKey::zero(), 0, 0);
        let err = r.read_bytes(usize::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(r.read_bytes(3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn read_at_restores_cursor() {
        let stream = SharedStream::new(Cursor::new((0u8..32).collect::<Vec<_>>()), WzKey::zero(), 0, 0);
        stream.with_reader(|r| r.seek_to(5)).unwrap();
        let bytes: Vec<u8> = stream
            .read_at::<_, io::Error, _>(20, |r| r.read_bytes(3))
            .unwrap();
        assert_eq!(bytes, vec![20, 21, 22]);
        assert_eq!(stream.with_reader(|r| r.position()).unwrap(), 5);
        assert_eq!(stream.len().unwrap(), 32);
    }
}
