use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"PKG1";
pub const DEFAULT_COPYRIGHT: &str = "Package file v1.0 Copyright 2002 Wizet, ZMS";

/// Fixed bytes before the copyright string: magic, data size, data start.
const FIXED_LEN: u32 = 16;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Data start {0} lies inside the fixed header")]
    BadDataStart(u32),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The archive header.  `data_start` is the `header_start` base used by every
/// obfuscated offset in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic:      [u8; 4],
    /// Bytes from `data_start` to the end of the file.
    pub data_size:  u64,
    pub data_start: u32,
    pub copyright:  String,
}

impl Header {
    pub fn new() -> Self {
        Self::with_copyright(DEFAULT_COPYRIGHT)
    }

    pub fn with_copyright(copyright: &str) -> Self {
        Self {
            magic:      *MAGIC,
            data_size:  0,
            data_start: FIXED_LEN + copyright.len() as u32 + 1,
            copyright:  copyright.to_owned(),
        }
    }

    /// Write the header and pad up to `data_start`.
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u64::<LittleEndian>(self.data_size)?;
        writer.write_u32::<LittleEndian>(self.data_start)?;
        writer.write_all(self.copyright.as_bytes())?;
        writer.write_u8(0)?;
        let written = FIXED_LEN as usize + self.copyright.len() + 1;
        let pad = (self.data_start as usize).saturating_sub(written);
        writer.write_all(&vec![0u8; pad])?;
        Ok(())
    }

    /// Read the header and leave the reader positioned at `data_start`.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, HeaderError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(HeaderError::InvalidMagic);
        }
        let data_size = reader.read_u64::<LittleEndian>()?;
        let data_start = reader.read_u32::<LittleEndian>()?;
        if data_start < FIXED_LEN {
            return Err(HeaderError::BadDataStart(data_start));
        }

        let mut consumed = FIXED_LEN;
        let mut raw = Vec::new();
        while consumed < data_start {
            let b = reader.read_u8()?;
            consumed += 1;
            if b == 0 {
                break;
            }
            raw.push(b);
        }
        let rest = (data_start - consumed) as u64;
        io::copy(&mut reader.by_ref().take(rest), &mut io::sink())?;

        Ok(Self {
            magic,
            data_size,
            data_start,
            copyright: String::from_utf8_lossy(&raw).into_owned(),
        })
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}
