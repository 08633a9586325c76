//! Canvas pixel formats.
//!
//! # Identity rules
//! Every canvas stores its format as a raw integer id.  The id decides the
//! packed size of the inflated payload and the [`PixelLayout`] of the
//! decoded [`Raster`].  Ids not listed in [`PixelFormat`] are preserved
//! verbatim by the tree but cannot be decoded.
//!
//! # Accelerator
//! DXT decode has a bit-exact software path ([`dxt`]); DXT encode requires a
//! [`BlockAccelerator`].  When one is supplied it replaces the software
//! decoder as well.

pub mod dxt;
pub mod raster;

use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::plugin::{BlockAccelerator, BlockFormat};
pub use raster::{PixelLayout, Raster};
use raster::stride_for;

// ── PixelFormat enum ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Argb4444,
    Argb8888,
    /// Same bytes as `Argb8888` under a second id.
    Argb8888Alt,
    Argb1555,
    Rgb565,
    /// One RGB565 colour per 16×16 tile.
    Rgb565Tiled,
    Dxt3,
    Dxt5,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 8] = [
        PixelFormat::Argb4444,
        PixelFormat::Argb8888,
        PixelFormat::Argb8888Alt,
        PixelFormat::Argb1555,
        PixelFormat::Rgb565,
        PixelFormat::Rgb565Tiled,
        PixelFormat::Dxt3,
        PixelFormat::Dxt5,
    ];

    /// The id stored on disk.
    #[inline]
    pub fn raw(self) -> i32 {
        match self {
            PixelFormat::Argb4444    => 1,
            PixelFormat::Argb8888    => 2,
            PixelFormat::Argb8888Alt => 3,
            PixelFormat::Argb1555    => 257,
            PixelFormat::Rgb565      => 513,
            PixelFormat::Rgb565Tiled => 517,
            PixelFormat::Dxt3        => 1026,
            PixelFormat::Dxt5        => 2050,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.raw() == raw)
    }

    /// Human-readable name (diagnostics and CLI).
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Argb4444    => "argb4444",
            PixelFormat::Argb8888    => "argb8888",
            PixelFormat::Argb8888Alt => "argb8888-alt",
            PixelFormat::Argb1555    => "argb1555",
            PixelFormat::Rgb565      => "rgb565",
            PixelFormat::Rgb565Tiled => "rgb565-tiled",
            PixelFormat::Dxt3        => "dxt3",
            PixelFormat::Dxt5        => "dxt5",
        }
    }

    /// Parse from a CLI string: a name or a raw id.
    pub fn from_name(s: &str) -> Option<Self> {
        let s = s.to_lowercase();
        if let Ok(raw) = s.parse::<i32>() {
            return Self::from_raw(raw);
        }
        Self::ALL.into_iter().find(|f| f.name() == s)
    }

    /// Layout of the decoded raster.
    pub fn layout(self) -> PixelLayout {
        match self {
            PixelFormat::Argb1555 => PixelLayout::Argb1555,
            PixelFormat::Rgb565 | PixelFormat::Rgb565Tiled => PixelLayout::Rgb565,
            _ => PixelLayout::Bgra8888,
        }
    }

    pub fn block_format(self) -> Option<BlockFormat> {
        match self {
            PixelFormat::Dxt3 => Some(BlockFormat::Dxt3),
            PixelFormat::Dxt5 => Some(BlockFormat::Dxt5),
            _ => None,
        }
    }

    /// Size of the inflated payload for a `width × height` canvas, or `None`
    /// when it does not fit in a `usize`.
    pub fn packed_size(self, width: u32, height: u32) -> Option<usize> {
        let px = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Argb4444 | PixelFormat::Argb1555 | PixelFormat::Rgb565 => px.checked_mul(2),
            PixelFormat::Argb8888 | PixelFormat::Argb8888Alt => px.checked_mul(4),
            PixelFormat::Rgb565Tiled => Some(px / 128),
            PixelFormat::Dxt3 | PixelFormat::Dxt5 => {
                let fmt = self.block_format()?;
                let blocks = (width as usize).div_ceil(4).checked_mul((height as usize).div_ceil(4))?;
                blocks.checked_mul(fmt.block_bytes())
            }
        }
    }
}

/// Largest packed payload or decoded raster a canvas may have, in bytes.
pub const MAX_CANVAS_BYTES: usize = i32::MAX as usize;

/// Check a canvas's declared dimensions against [`MAX_CANVAS_BYTES`] before
/// any buffer is sized from them.  Returns the packed payload size.
pub fn checked_canvas_size(format: PixelFormat, width: u32, height: u32) -> Result<usize, CodecError> {
    let oversized = || CodecError::Oversized { width, height };
    let packed = format.packed_size(width, height).ok_or_else(oversized)?;
    let raster = stride_for(width, PixelLayout::Bgra8888)
        .checked_mul(height as usize)
        .ok_or_else(oversized)?;
    if packed > MAX_CANVAS_BYTES || raster > MAX_CANVAS_BYTES {
        return Err(oversized());
    }
    Ok(packed)
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.raw())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("List block at offset {offset} claims {length} bytes past the end of the payload")]
    TruncatedBlock { offset: u64, length: i32 },
    #[error("Unknown pixel format {0}")]
    UnknownFormat(i32),
    #[error("No block accelerator available to encode {0}")]
    AcceleratorUnavailable(PixelFormat),
    #[error("Accelerator error: {0}")]
    Accelerator(String),
    #[error("Encoding to {0} is not supported")]
    UnsupportedEncode(PixelFormat),
    #[error("Canvas of {width}x{height} exceeds the decodable size")]
    Oversized { width: u32, height: u32 },
    #[error("{stored} stored bytes cannot inflate to {expected}")]
    ImplausibleSize { expected: usize, stored: usize },
    #[error("Expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── PixelCodec trait ─────────────────────────────────────────────────────────

pub trait PixelCodec: Send + Sync {
    fn format(&self) -> PixelFormat;
    /// Inflated payload → raster.
    fn decode(&self, packed: &[u8], width: u32, height: u32) -> Result<Raster, CodecError>;
    /// Raster → inflated payload.
    fn encode(&self, raster: &Raster) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct Argb4444Codec;
impl PixelCodec for Argb4444Codec {
    fn format(&self) -> PixelFormat { PixelFormat::Argb4444 }

    fn decode(&self, packed: &[u8], width: u32, height: u32) -> Result<Raster, CodecError> {
        let n = width as usize * height as usize * 2;
        let mut out = Vec::with_capacity(n.min(packed.len()) * 2);
        for &b in packed.iter().take(n) {
            let lo = b & 0x0F;
            let hi = b & 0xF0;
            out.push(lo | (lo << 4));
            out.push(hi | (hi >> 4));
        }
        Ok(Raster::from_packed(width, height, PixelLayout::Bgra8888, &out))
    }

    fn encode(&self, raster: &Raster) -> Result<Vec<u8>, CodecError> {
        let bgra = raster.convert(PixelLayout::Bgra8888).to_packed();
        Ok(bgra
            .chunks_exact(4)
            .flat_map(|p| [(p[0] >> 4) | (p[1] & 0xF0), (p[2] >> 4) | (p[3] & 0xF0)])
            .collect())
    }
}

/// Formats whose packed bytes are already the raster's rows.
pub struct DirectCodec(pub PixelFormat);
impl PixelCodec for DirectCodec {
    fn format(&self) -> PixelFormat { self.0 }

    fn decode(&self, packed: &[u8], width: u32, height: u32) -> Result<Raster, CodecError> {
        Ok(Raster::from_packed(width, height, self.0.layout(), packed))
    }

    fn encode(&self, raster: &Raster) -> Result<Vec<u8>, CodecError> {
        Ok(raster.convert(self.0.layout()).to_packed())
    }
}

pub struct TiledRgb565Codec;
impl PixelCodec for TiledRgb565Codec {
    fn format(&self) -> PixelFormat { PixelFormat::Rgb565Tiled }

    fn decode(&self, packed: &[u8], width: u32, height: u32) -> Result<Raster, CodecError> {
        let mut r = Raster::new(width, height, PixelLayout::Rgb565);
        let (tiles_x, tiles_y) = (width as usize / 16, height as usize / 16);
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let i = (ty * tiles_x + tx) * 2;
                let px = [
                    packed.get(i).copied().unwrap_or(0),
                    packed.get(i + 1).copied().unwrap_or(0),
                ];
                for y in ty * 16..ty * 16 + 16 {
                    let row = y * r.stride;
                    for x in tx * 16..tx * 16 + 16 {
                        r.data[row + x * 2..row + x * 2 + 2].copy_from_slice(&px);
                    }
                }
            }
        }
        Ok(r)
    }

    fn encode(&self, _raster: &Raster) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::UnsupportedEncode(PixelFormat::Rgb565Tiled))
    }
}

pub struct DxtCodec {
    pub format:      PixelFormat,
    pub accelerator: Option<Arc<dyn BlockAccelerator>>,
}

impl DxtCodec {
    fn block_format(&self) -> BlockFormat {
        self.format.block_format().unwrap_or(BlockFormat::Dxt5)
    }
}

impl PixelCodec for DxtCodec {
    fn format(&self) -> PixelFormat { self.format }

    fn decode(&self, packed: &[u8], width: u32, height: u32) -> Result<Raster, CodecError> {
        let fmt = self.block_format();
        match &self.accelerator {
            Some(acc) => {
                let rgba = acc.decompress(packed, width, height, fmt)?;
                Ok(Raster::from_rgba(width, height, &rgba))
            }
            None => {
                let bgra = dxt::decode_image(packed, width, height, fmt);
                Ok(Raster::from_packed(width, height, PixelLayout::Bgra8888, &bgra))
            }
        }
    }

    fn encode(&self, raster: &Raster) -> Result<Vec<u8>, CodecError> {
        let acc = self.accelerator
            .as_ref()
            .ok_or(CodecError::AcceleratorUnavailable(self.format))?;
        acc.compress(&raster.to_rgba(), raster.width, raster.height, self.block_format())
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a format to its codec.
pub fn get_codec(
    format:      PixelFormat,
    accelerator: Option<Arc<dyn BlockAccelerator>>,
) -> Box<dyn PixelCodec> {
    match format {
        PixelFormat::Argb4444 => Box::new(Argb4444Codec),
        PixelFormat::Argb8888
        | PixelFormat::Argb8888Alt
        | PixelFormat::Argb1555
        | PixelFormat::Rgb565 => Box::new(DirectCodec(format)),
        PixelFormat::Rgb565Tiled => Box::new(TiledRgb565Codec),
        PixelFormat::Dxt3 | PixelFormat::Dxt5 => Box::new(DxtCodec { format, accelerator }),
    }
}

/// Decode an inflated payload stored under raw format id `raw`.
///
/// Unknown ids are logged and yield `Ok(None)`.
pub fn decode_raster(
    raw:         i32,
    packed:      &[u8],
    width:       u32,
    height:      u32,
    accelerator: Option<Arc<dyn BlockAccelerator>>,
) -> Result<Option<Raster>, CodecError> {
    match PixelFormat::from_raw(raw) {
        Some(format) => {
            checked_canvas_size(format, width, height)?;
            get_codec(format, accelerator).decode(packed, width, height).map(Some)
        }
        None => {
            tracing::warn!(format = raw, width, height, "unknown canvas pixel format");
            Ok(None)
        }
    }
}

/// Quantize a raster to what `format` can represent, in `format`'s layout.
pub fn convert_pixel_format(raster: &Raster, format: PixelFormat) -> Raster {
    let mut out = raster.convert(format.layout());
    if format == PixelFormat::Argb4444 {
        for c in out.data.iter_mut() {
            *c = (*c >> 4) * 17;
        }
    }
    out
}
