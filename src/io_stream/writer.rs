use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Seek, SeekFrom, Write};

use crate::crypto::{encrypt_offset, WzKey, ASCII_MASK_SEED, UNICODE_MASK_SEED};
use super::TAG_OBJECT_OFFSET;

/// Strings at most this many UTF-16 units long are always written inline.
pub const MIN_INTERNED_LEN: usize = 4;

/// Interning cache key.  Tagged object values never share a slot with plain
/// strings or with each other across kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StringKey {
    Plain(String),
    Object(u8, String),
}

/// Binary encoder; mirror of [`super::reader::WzReader`].
pub struct WzWriter<W> {
    inner:            W,
    pub key:          WzKey,
    pub header_start: u32,
    pub hash:         u32,
    string_cache:     HashMap<StringKey, u32>,
}

impl<W: Write + Seek> WzWriter<W> {
    pub fn new(inner: W, key: WzKey, header_start: u32, hash: u32) -> Self {
        Self { inner, key, header_start, hash, string_cache: HashMap::new() }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn position(&mut self) -> io::Result<u64> {
        self.inner.stream_position()
    }

    pub fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(pos)).map(|_| ())
    }

    /// Number of distinct interned strings.
    pub fn interned(&self) -> usize {
        self.string_cache.len()
    }

    // ── Compressed integers ─────────────────────────────────────────────────

    pub fn write_compressed_int(&mut self, value: i32) -> io::Result<()> {
        if value > i8::MAX as i32 || value <= i8::MIN as i32 {
            self.inner.write_i8(i8::MIN)?;
            self.inner.write_i32::<LittleEndian>(value)
        } else {
            self.inner.write_i8(value as i8)
        }
    }

    pub fn write_compressed_long(&mut self, value: i64) -> io::Result<()> {
        if value > i8::MAX as i64 || value <= i8::MIN as i64 {
            self.inner.write_i8(i8::MIN)?;
            self.inner.write_i64::<LittleEndian>(value)
        } else {
            self.inner.write_i8(value as i8)
        }
    }

    // ── Strings ─────────────────────────────────────────────────────────────

    /// Encode a masked string; inverse of `WzReader::read_string`.
    pub fn write_string(&mut self, value: &str, secondary: bool) -> io::Result<()> {
        if value.is_empty() {
            return self.inner.write_u8(0);
        }

        if value.chars().any(|c| c as u32 > 0x7F) {
            let units: Vec<u16> = value.encode_utf16().collect();
            if units.len() >= i8::MAX as usize {
                self.inner.write_i8(i8::MAX)?;
                self.inner.write_i32::<LittleEndian>(units.len() as i32)?;
            } else {
                self.inner.write_i8(units.len() as i8)?;
            }
            let mut mask = UNICODE_MASK_SEED;
            for (i, &unit) in units.iter().enumerate() {
                let mut c = unit;
                if secondary {
                    c ^= self.key.word(i);
                }
                self.inner.write_u16::<LittleEndian>(c ^ mask)?;
                mask = mask.wrapping_add(1);
            }
        } else {
            let bytes = value.as_bytes();
            // A length of exactly 128 would collide with the i8::MIN sentinel.
            if bytes.len() > i8::MAX as usize {
                self.inner.write_i8(i8::MIN)?;
                self.inner.write_i32::<LittleEndian>(bytes.len() as i32)?;
            } else {
                self.inner.write_i8(-(bytes.len() as i8))?;
            }
            let mut mask = ASCII_MASK_SEED;
            let mut out = Vec::with_capacity(bytes.len());
            for (i, &b) in bytes.iter().enumerate() {
                let mut c = b;
                if secondary {
                    c ^= self.key.byte(i);
                }
                out.push(c ^ mask);
                mask = mask.wrapping_add(1);
            }
            self.inner.write_all(&out)?;
        }
        Ok(())
    }

    /// Write a tagged string, back-referencing an earlier copy when possible.
    ///
    /// Positions are recorded relative to the start of this writer's stream,
    /// which is the base the reader later adds the delta to.
    pub fn write_string_value(
        &mut self,
        value:      &str,
        inline_tag: u8,
        offset_tag: u8,
        secondary:  bool,
    ) -> io::Result<()> {
        let key = StringKey::Plain(value.to_owned());
        if value.encode_utf16().count() > MIN_INTERNED_LEN {
            if let Some(&pos) = self.string_cache.get(&key) {
                self.inner.write_u8(offset_tag)?;
                return self.inner.write_u32::<LittleEndian>(pos);
            }
        }
        self.inner.write_u8(inline_tag)?;
        let pos = self.position()? as u32;
        self.write_string(value, secondary)?;
        self.string_cache.entry(key).or_insert(pos);
        Ok(())
    }

    /// Write a directory entry's kind byte and name.  Returns `true` when a
    /// back-reference was written instead of the name.
    ///
    /// The recorded position points at the kind byte and is relative to
    /// `header_start`, matching the reader's `header_start + delta` lookup.
    pub fn write_object_value(&mut self, value: &str, kind: u8, secondary: bool) -> io::Result<bool> {
        let key = StringKey::Object(kind, value.to_owned());
        if value.encode_utf16().count() > MIN_INTERNED_LEN {
            if let Some(&pos) = self.string_cache.get(&key) {
                self.inner.write_u8(TAG_OBJECT_OFFSET)?;
                self.inner.write_u32::<LittleEndian>(pos)?;
                return Ok(true);
            }
        }
        let pos = (self.position()? as u32).wrapping_sub(self.header_start);
        self.inner.write_u8(kind)?;
        self.write_string(value, secondary)?;
        self.string_cache.entry(key).or_insert(pos);
        Ok(false)
    }

    pub fn write_null_terminated_string(&mut self, value: &str) -> io::Result<()> {
        self.inner.write_all(value.as_bytes())?;
        self.inner.write_u8(0)
    }

    // ── Offsets ─────────────────────────────────────────────────────────────

    /// Encode `value` as an obfuscated pointer at the current position.
    pub fn write_offset(&mut self, value: u32) -> io::Result<()> {
        let pos = self.position()? as u32;
        let field = encrypt_offset(pos, self.header_start, self.hash, value);
        self.inner.write_u32::<LittleEndian>(field)
    }

    /// Overwrite the 4-byte offset field at `field_pos` and restore the cursor.
    pub fn patch_offset(&mut self, field_pos: u64, value: u32) -> io::Result<()> {
        let saved = self.position()?;
        self.seek_to(field_pos)?;
        self.write_offset(value)?;
        self.seek_to(saved)
    }

    /// Overwrite a little-endian `i32` at `pos` and restore the cursor.
    pub fn patch_i32(&mut self, pos: u64, value: i32) -> io::Result<()> {
        let saved = self.position()?;
        self.seek_to(pos)?;
        self.inner.write_i32::<LittleEndian>(value)?;
        self.seek_to(saved)
    }
}

impl<W: Write> Write for WzWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for WzWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}
