use std::borrow::Cow;
use std::sync::Arc;

use crate::block::{decode_payload, encode_payload, is_secondary};
use crate::codec::{checked_canvas_size, decode_raster, get_codec, CodecError, PixelFormat, Raster};
use crate::crypto::WzKey;
use crate::io_stream::SharedStream;
use crate::plugin::BlockAccelerator;

/// Location of a canvas payload in the backing file.
#[derive(Debug, Clone)]
pub struct PayloadSource {
    pub stream: SharedStream,
    pub offset: u64,
    pub len:    u32,
}

impl PayloadSource {
    pub fn read(&self) -> Result<Vec<u8>, CodecError> {
        let len = self.len as usize;
        self.stream.read_at(self.offset, |r| r.read_bytes(len).map_err(CodecError::from))
    }
}

/// Compressed raster property.
///
/// Holds at most one copy of each representation: the stored payload
/// (cached or reachable through a [`PayloadSource`]) and the decoded raster.
#[derive(Debug)]
pub struct CanvasNode {
    pub width:     u32,
    pub height:    u32,
    /// Raw format id as stored.
    pub format:    i32,
    /// Passed through unchanged.
    pub mag_level: i32,
    secondary:     bool,
    compressed:    Option<Vec<u8>>,
    raster:        Option<Raster>,
    source:        Option<PayloadSource>,
}

impl CanvasNode {
    /// Canvas holding an already-loaded payload.
    pub fn from_payload(width: u32, height: u32, format: i32, mag_level: i32, payload: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            mag_level,
            secondary: is_secondary(&payload),
            compressed: Some(payload),
            raster: None,
            source: None,
        }
    }

    /// Canvas whose payload stays in the file until first use.
    pub fn lazy(width: u32, height: u32, format: i32, mag_level: i32, source: PayloadSource, secondary: bool) -> Self {
        Self {
            width,
            height,
            format,
            mag_level,
            secondary,
            compressed: None,
            raster: None,
            source: Some(source),
        }
    }

    /// Canvas from inflated pixel bytes in `format`'s packed layout.
    pub fn from_packed(
        width:     u32,
        height:    u32,
        format:    PixelFormat,
        packed:    &[u8],
        key:       &WzKey,
        secondary: bool,
    ) -> Result<Self, CodecError> {
        let expected = checked_canvas_size(format, width, height)?;
        if packed.len() != expected {
            return Err(CodecError::SizeMismatch { expected, actual: packed.len() });
        }
        let payload = encode_payload(packed, key, secondary)?;
        Ok(Self::from_payload(width, height, format.raw(), 0, payload))
    }

    /// Canvas compressed from a raster.
    pub fn from_raster(
        raster:      Raster,
        format:      PixelFormat,
        key:         &WzKey,
        secondary:   bool,
        accelerator: Option<Arc<dyn BlockAccelerator>>,
    ) -> Result<Self, CodecError> {
        let mut canvas = Self {
            width:      raster.width,
            height:     raster.height,
            format:     format.raw(),
            mag_level:  0,
            secondary,
            compressed: None,
            raster:     None,
            source:     None,
        };
        canvas.set_raster(raster, key, accelerator)?;
        Ok(canvas)
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_raw(self.format)
    }

    /// Whether the stored payload is list-mode framed.
    pub fn is_secondary(&self) -> bool {
        match &self.compressed {
            Some(bytes) => is_secondary(bytes),
            None => self.secondary,
        }
    }

    pub fn has_payload(&self) -> bool {
        self.compressed.is_some() || self.source.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.compressed.is_some()
    }

    pub fn cached_raster(&self) -> Option<&Raster> {
        self.raster.as_ref()
    }

    /// The stored payload, from cache or read from the file without caching.
    pub fn compressed(&self) -> Result<Cow<'_, [u8]>, CodecError> {
        if let Some(bytes) = &self.compressed {
            return Ok(Cow::Borrowed(bytes));
        }
        match &self.source {
            Some(src) => src.read().map(Cow::Owned),
            None => Ok(Cow::Borrowed(&[])),
        }
    }

    /// Load the payload into the cache if needed.
    pub fn ensure_compressed(&mut self) -> Result<&[u8], CodecError> {
        if self.compressed.is_none() {
            let bytes = match &self.source {
                Some(src) => src.read()?,
                None => Vec::new(),
            };
            self.compressed = Some(bytes);
        }
        Ok(self.compressed.as_deref().unwrap_or(&[]))
    }

    /// Replace the stored payload.  Drops any cached raster.
    pub fn set_compressed(&mut self, payload: Vec<u8>) {
        self.secondary = is_secondary(&payload);
        self.compressed = Some(payload);
        self.raster = None;
    }

    /// Decode without touching the caches.  Unknown formats yield `None`.
    pub fn decode(&self, key: &WzKey, accelerator: Option<Arc<dyn BlockAccelerator>>)
        -> Result<Option<Raster>, CodecError>
    {
        if let Some(r) = &self.raster {
            return Ok(Some(r.clone()));
        }
        let Some(format) = self.pixel_format() else {
            tracing::warn!(format = self.format, "unknown canvas pixel format");
            return Ok(None);
        };
        let expected = checked_canvas_size(format, self.width, self.height)?;
        let payload = self.compressed()?;
        let packed = decode_payload(&payload, key, expected)?;
        decode_raster(self.format, &packed, self.width, self.height, accelerator)
    }

    /// Decode and keep the raster for later calls.
    pub fn decode_retained(&mut self, key: &WzKey, accelerator: Option<Arc<dyn BlockAccelerator>>)
        -> Result<Option<&Raster>, CodecError>
    {
        if self.raster.is_none() {
            self.raster = self.decode(key, accelerator)?;
        }
        Ok(self.raster.as_ref())
    }

    /// Re-encode from `raster` using this canvas's format and list mode.
    pub fn set_raster(
        &mut self,
        raster:      Raster,
        key:         &WzKey,
        accelerator: Option<Arc<dyn BlockAccelerator>>,
    ) -> Result<(), CodecError> {
        let format = self.pixel_format().ok_or(CodecError::UnknownFormat(self.format))?;
        let packed = get_codec(format, accelerator).encode(&raster)?;
        let secondary = self.is_secondary();
        let payload = encode_payload(&packed, key, secondary)?;
        self.width = raster.width;
        self.height = raster.height;
        self.secondary = secondary;
        self.compressed = Some(payload);
        self.raster = Some(raster);
        self.source = None;
        Ok(())
    }

    /// Switch to another pixel format, re-encoding the current pixels.
    pub fn set_format(
        &mut self,
        format:      PixelFormat,
        key:         &WzKey,
        accelerator: Option<Arc<dyn BlockAccelerator>>,
    ) -> Result<(), CodecError> {
        if self.format == format.raw() {
            return Ok(());
        }
        let raster = self
            .decode(key, accelerator.clone())?
            .ok_or(CodecError::UnknownFormat(self.format))?;
        self.format = format.raw();
        self.set_raster(crate::codec::convert_pixel_format(&raster, format), key, accelerator)
    }

    /// Drop cached data that can be reloaded from the file.
    pub fn evict(&mut self) {
        self.raster = None;
        if self.source.is_some() {
            self.compressed = None;
        }
    }

    pub(crate) fn release(&mut self) {
        self.raster = None;
        self.compressed = None;
        self.source = None;
    }

    /// Independent copy: payload materialised, raster cache dropped.
    pub(crate) fn detached_copy(&self) -> Self {
        let (compressed, source) = match &self.compressed {
            Some(b) => (Some(b.clone()), None),
            None => (None, self.source.clone()),
        };
        Self {
            width: self.width,
            height: self.height,
            format: self.format,
            mag_level: self.mag_level,
            secondary: self.secondary,
            compressed,
            raster: None,
            source,
        }
    }
}
