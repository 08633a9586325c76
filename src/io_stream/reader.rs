use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read, Seek, SeekFrom};

use crate::crypto::{decrypt_offset, WzKey, ASCII_MASK_SEED, UNICODE_MASK_SEED};
use super::{DecodeError, TAG_INLINE, TAG_INLINE_EXTENDED, TAG_OFFSET, TAG_OFFSET_EXTENDED};

/// Binary decoder over a seekable source.
///
/// `header_start` and `hash` are fixed when the archive is opened; they feed
/// [`WzReader::read_offset`].  The key feeds secondary-mode strings.
pub struct WzReader<R> {
    inner:            R,
    pub key:          WzKey,
    pub header_start: u32,
    pub hash:         u32,
}

impl<R: Read + Seek> WzReader<R> {
    pub fn new(inner: R, key: WzKey, header_start: u32, hash: u32) -> Self {
        Self { inner, key, header_start, hash }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn position(&mut self) -> io::Result<u64> {
        self.inner.stream_position()
    }

    pub fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(pos)).map(|_| ())
    }

    pub fn skip(&mut self, n: i64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Current(n)).map(|_| ())
    }

    /// Move the cursor back by `by` bytes.
    ///
    /// # Panics
    /// If that would move before the start of the stream.  Callers only roll
    /// back over bytes they have just read, so this is a logic error.
    pub fn rollback(&mut self, by: u64) -> io::Result<()> {
        let pos = self.position()?;
        assert!(pos >= by, "cannot roll stream position {pos} back by {by}");
        self.seek_to(pos - by)
    }

    /// Bytes remaining between the cursor and the end of the stream.
    pub fn available(&mut self) -> io::Result<u64> {
        let pos = self.position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.seek_to(pos)?;
        Ok(end.saturating_sub(pos))
    }

    /// Fail with `BadLength` unless at least `len` bytes remain.
    pub fn ensure_available(&mut self, len: u64) -> Result<(), DecodeError> {
        if len > self.available()? {
            return Err(DecodeError::BadLength {
                length:   i64::try_from(len).unwrap_or(i64::MAX),
                position: self.position()?,
            });
        }
        Ok(())
    }

    /// Read exactly `len` bytes.  A length past the end of the stream fails
    /// before the buffer is allocated.
    pub fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        if len as u64 > self.available()? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{len} bytes requested past the end of the stream"),
            ));
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    // ── Compressed integers ─────────────────────────────────────────────────

    pub fn read_compressed_int(&mut self) -> io::Result<i32> {
        let b = self.inner.read_i8()?;
        if b == i8::MIN {
            return self.inner.read_i32::<LittleEndian>();
        }
        Ok(b as i32)
    }

    pub fn read_compressed_long(&mut self) -> io::Result<i64> {
        let b = self.inner.read_i8()?;
        if b == i8::MIN {
            return self.inner.read_i64::<LittleEndian>();
        }
        Ok(b as i64)
    }

    // ── Strings ─────────────────────────────────────────────────────────────

    /// Decode a masked string.  `secondary` additionally XORs every character
    /// with the key stream, indexed by character position.
    pub fn read_string(&mut self, secondary: bool) -> Result<String, DecodeError> {
        let small = self.inner.read_i8()?;
        if small == 0 {
            return Ok(String::new());
        }

        if small > 0 {
            let len = if small == i8::MAX {
                self.inner.read_i32::<LittleEndian>()?
            } else {
                small as i32
            };
            if len <= 0 {
                return Ok(String::new());
            }
            self.ensure_available(len as u64 * 2)?;
            let mut units = Vec::with_capacity(len as usize);
            let mut mask = UNICODE_MASK_SEED;
            for i in 0..len as usize {
                let mut c = self.inner.read_u16::<LittleEndian>()? ^ mask;
                if secondary {
                    c ^= self.key.word(i);
                }
                units.push(c);
                mask = mask.wrapping_add(1);
            }
            Ok(String::from_utf16_lossy(&units))
        } else {
            let len = if small == i8::MIN {
                self.inner.read_i32::<LittleEndian>()?
            } else {
                -(small as i32)
            };
            if len <= 0 {
                return Ok(String::new());
            }
            self.ensure_available(len as u64)?;
            let mut out = String::with_capacity(len as usize);
            let mut mask = ASCII_MASK_SEED;
            for i in 0..len as usize {
                let mut c = self.inner.read_u8()? ^ mask;
                if secondary {
                    c ^= self.key.byte(i);
                }
                out.push(c as char);
                mask = mask.wrapping_add(1);
            }
            Ok(out)
        }
    }

    /// Decode the string at `offset` and put the cursor back where it was.
    pub fn read_string_at(
        &mut self,
        offset:    u64,
        skip_byte: bool,
        secondary: bool,
    ) -> Result<String, DecodeError> {
        let saved = self.position()?;
        self.seek_to(offset)?;
        if skip_byte {
            self.inner.read_u8()?;
        }
        let s = self.read_string(secondary);
        self.seek_to(saved)?;
        s
    }

    /// Decode a tagged string: inline, or a back-reference relative to `base`.
    pub fn read_string_block(&mut self, base: u64, secondary: bool) -> Result<String, DecodeError> {
        let tag = self.inner.read_u8()?;
        match tag {
            TAG_INLINE | TAG_INLINE_EXTENDED => self.read_string(secondary),
            TAG_OFFSET | TAG_OFFSET_EXTENDED => {
                let delta = self.inner.read_i32::<LittleEndian>()?;
                let target = (base as i64 + delta as i64).max(0) as u64;
                self.read_string_at(target, false, secondary)
            }
            _ => Err(DecodeError::InvalidStringBlock {
                tag,
                position: self.position()?.saturating_sub(1),
            }),
        }
    }

    /// Plain NUL-terminated single-byte string, no masking.
    pub fn read_null_terminated_string(&mut self) -> io::Result<String> {
        let mut out = String::new();
        loop {
            let b = self.inner.read_u8()?;
            if b == 0 {
                return Ok(out);
            }
            out.push(b as char);
        }
    }

    // ── Offsets ─────────────────────────────────────────────────────────────

    /// Decode an obfuscated pointer stored at the current position.
    pub fn read_offset(&mut self) -> io::Result<u32> {
        let pos = self.position()? as u32;
        let raw = self.inner.read_u32::<LittleEndian>()?;
        Ok(decrypt_offset(pos, self.header_start, self.hash, raw))
    }
}

impl<R: Read> Read for WzReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for WzReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}
