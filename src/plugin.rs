//! Optional block-texture accelerator.
//!
//! DXT compression has no in-crate implementation.  Callers supply one
//! through [`BlockAccelerator`], either directly in Rust or by wrapping a
//! native library that exports a [`WzBlockCodecPlugin`] descriptor:
//!
//! ```c
//! const WzBlockCodecPlugin *wz_block_codec_register(void);
//! ```
//!
//! The returned pointer is static; the host never frees it.
//!
//! # Pixel order
//! Accelerators work on tightly packed RGBA bytes.  The canvas codec swaps
//! to and from its BGRA rasters around every call.
//!
//! # Stability contract
//! `WZ_BLOCK_PLUGIN_ABI_VERSION` only ever increases.  New fields are
//! appended at the end of the descriptor; existing offsets never move.
//!
//! # Thread safety
//! Both entry points must be reentrant.  The host calls them concurrently
//! from different threads on different buffers.

use crate::codec::CodecError;

pub const WZ_BLOCK_PLUGIN_ABI_VERSION: u32 = 1;

/// Return codes from plugin entry points.
pub mod rc {
    pub const OK:       i32 = 0;
    /// Output buffer too small.
    pub const OVERFLOW: i32 = -1;
    /// Input blocks are corrupt or truncated.
    pub const CORRUPT:  i32 = -2;
    pub const INTERNAL: i32 = -3;
}

/// Block compression scheme, using the flag values common to squish-style
/// libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BlockFormat {
    Dxt1 = 1,
    Dxt3 = 1 << 1,
    Dxt5 = 1 << 2,
}

impl BlockFormat {
    #[inline]
    pub fn flags(self) -> i32 {
        self as i32
    }

    /// Bytes per 4×4 block.
    #[inline]
    pub fn block_bytes(self) -> usize {
        match self {
            BlockFormat::Dxt1 => 8,
            BlockFormat::Dxt3 | BlockFormat::Dxt5 => 16,
        }
    }

    /// Compressed size of a `width × height` image, partial blocks rounded up.
    pub fn storage_size(self, width: u32, height: u32) -> usize {
        let bw = (width as usize).div_ceil(4);
        let bh = (height as usize).div_ceil(4);
        bw * bh * self.block_bytes()
    }
}

/// A DXT compressor/decompressor working on RGBA pixels.
pub trait BlockAccelerator: Send + Sync {
    /// Compress `width * height * 4` RGBA bytes into blocks.
    fn compress(&self, rgba: &[u8], width: u32, height: u32, format: BlockFormat)
        -> Result<Vec<u8>, CodecError>;

    /// Decompress blocks into `width * height * 4` RGBA bytes.
    fn decompress(&self, blocks: &[u8], width: u32, height: u32, format: BlockFormat)
        -> Result<Vec<u8>, CodecError>;
}

// ── C ABI ────────────────────────────────────────────────────────────────────

/// Frozen C ABI descriptor for a native block codec.
///
/// `#[repr(C)]`; do not reorder fields.
#[repr(C)]
pub struct WzBlockCodecPlugin {
    /// Must not exceed `WZ_BLOCK_PLUGIN_ABI_VERSION`.
    pub abi_version: u32,

    /// OR of the [`BlockFormat`] flags this library handles.
    pub supported: i32,

    /// Compress `width * height` RGBA pixels from `rgba` into `out`.
    ///
    /// # Safety
    /// `rgba` holds `width * height * 4` readable bytes and `out` holds
    /// `out_len` writable bytes.  The regions do not overlap.
    pub compress: Option<unsafe extern "C" fn(
        rgba:   *const u8, width:   i32, height: i32,
        out:    *mut   u8, out_len: u32,
        flags:  i32,
    ) -> i32>,

    /// Decompress `blocks_len` bytes of blocks into `width * height` RGBA
    /// pixels at `rgba`.
    ///
    /// # Safety
    /// `rgba` holds `width * height * 4` writable bytes and `blocks` holds
    /// `blocks_len` readable bytes.  The regions do not overlap.
    pub decompress: Option<unsafe extern "C" fn(
        rgba:   *mut   u8, width:      i32, height: i32,
        blocks: *const u8, blocks_len: u32,
        flags:  i32,
    ) -> i32>,

    /// Compressed size for the given dimensions and flags.  Pure.
    pub storage_requirements: Option<unsafe extern "C" fn(width: i32, height: i32, flags: i32) -> i32>,
}

// Safety: the ABI contract declares all entry points reentrant.
unsafe impl Send for WzBlockCodecPlugin {}
unsafe impl Sync for WzBlockCodecPlugin {}

/// Safe wrapper around a static [`WzBlockCodecPlugin`].
pub struct PluginAccelerator {
    desc: &'static WzBlockCodecPlugin,
}

impl PluginAccelerator {
    /// Wrap a descriptor after validating its ABI version.
    pub fn new(desc: &'static WzBlockCodecPlugin) -> Result<Self, CodecError> {
        if desc.abi_version > WZ_BLOCK_PLUGIN_ABI_VERSION {
            return Err(CodecError::Accelerator(format!(
                "plugin ABI version {} is newer than host ABI version {}",
                desc.abi_version, WZ_BLOCK_PLUGIN_ABI_VERSION,
            )));
        }
        Ok(Self { desc })
    }

    pub fn supports(&self, format: BlockFormat) -> bool {
        self.desc.supported & format.flags() != 0
    }

    fn check(&self, format: BlockFormat) -> Result<(), CodecError> {
        if self.supports(format) {
            Ok(())
        } else {
            Err(CodecError::Accelerator(format!("plugin does not handle {format:?}")))
        }
    }

    fn storage_size(&self, width: u32, height: u32, format: BlockFormat) -> usize {
        match self.desc.storage_requirements {
            Some(f) => {
                let n = unsafe { f(width as i32, height as i32, format.flags()) };
                if n > 0 { n as usize } else { format.storage_size(width, height) }
            }
            None => format.storage_size(width, height),
        }
    }
}

impl BlockAccelerator for PluginAccelerator {
    fn compress(&self, rgba: &[u8], width: u32, height: u32, format: BlockFormat)
        -> Result<Vec<u8>, CodecError>
    {
        self.check(format)?;
        let f = self.desc.compress
            .ok_or_else(|| CodecError::Accelerator("plugin missing compress fn".into()))?;
        let need = width as usize * height as usize * 4;
        if rgba.len() < need {
            return Err(CodecError::SizeMismatch { expected: need, actual: rgba.len() });
        }
        let mut out = vec![0u8; self.storage_size(width, height, format)];
        let rc = unsafe {
            f(rgba.as_ptr(), width as i32, height as i32,
              out.as_mut_ptr(), out.len() as u32,
              format.flags())
        };
        if rc != rc::OK {
            return Err(CodecError::Accelerator(format!("plugin compress returned error code {rc}")));
        }
        Ok(out)
    }

    fn decompress(&self, blocks: &[u8], width: u32, height: u32, format: BlockFormat)
        -> Result<Vec<u8>, CodecError>
    {
        self.check(format)?;
        let f = self.desc.decompress
            .ok_or_else(|| CodecError::Accelerator("plugin missing decompress fn".into()))?;
        let mut out = vec![0u8; width as usize * height as usize * 4];
        let rc = unsafe {
            f(out.as_mut_ptr(), width as i32, height as i32,
              blocks.as_ptr(), blocks.len() as u32,
              format.flags())
        };
        if rc != rc::OK {
            return Err(CodecError::Accelerator(format!("plugin decompress returned error code {rc}")));
        }
        Ok(out)
    }
}
