//! Decoded canvas pixels.
//!
//! Rows are padded to a 4-byte stride.  Packed canvas data has no padding, so
//! every copy between the two goes row by row.

use serde::{Deserialize, Serialize};

/// In-memory pixel layout of a [`Raster`].  Multi-byte pixels are
/// little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelLayout {
    /// Bytes B, G, R, A.
    Bgra8888,
    /// `u16`: alpha bit 15, red 10..15, green 5..10, blue 0..5.
    Argb1555,
    /// `u16`: red 11..16, green 5..11, blue 0..5.
    Rgb565,
}

impl PixelLayout {
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Bgra8888 => 4,
            PixelLayout::Argb1555 | PixelLayout::Rgb565 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelLayout::Bgra8888 => "bgra8888",
            PixelLayout::Argb1555 => "argb1555",
            PixelLayout::Rgb565   => "rgb565",
        }
    }
}

/// Row stride in bytes for `width` pixels of `layout`.
#[inline]
pub fn stride_for(width: u32, layout: PixelLayout) -> usize {
    let row = width as usize * layout.bytes_per_pixel();
    (row + 3) & !3
}

#[inline]
fn expand5(v: u16) -> u8 {
    let v = (v & 0x1F) as u8;
    (v << 3) | (v >> 2)
}

#[inline]
fn expand6(v: u16) -> u8 {
    let v = (v & 0x3F) as u8;
    (v << 2) | (v >> 4)
}

/// Expand an RGB565 word to `[r, g, b]`.
#[inline]
pub fn rgb565_to_rgb(v: u16) -> [u8; 3] {
    [expand5(v >> 11), expand6(v >> 5), expand5(v)]
}

#[inline]
fn rgb_to_565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width:  u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub stride: usize,
    pub data:   Vec<u8>,
}

impl Raster {
    /// A zero-filled raster.
    pub fn new(width: u32, height: u32, layout: PixelLayout) -> Self {
        let stride = stride_for(width, layout);
        Self { width, height, layout, stride, data: vec![0; stride * height as usize] }
    }

    /// Copy tightly packed rows into a strided raster.  Missing trailing
    /// bytes stay zero.
    pub fn from_packed(width: u32, height: u32, layout: PixelLayout, packed: &[u8]) -> Self {
        let mut r = Self::new(width, height, layout);
        let row = r.row_bytes();
        if row == r.stride && packed.len() >= r.data.len() {
            let n = r.data.len();
            r.data.copy_from_slice(&packed[..n]);
            return r;
        }
        for y in 0..height as usize {
            let src = y * row;
            if src >= packed.len() {
                break;
            }
            let n = row.min(packed.len() - src);
            r.data[y * r.stride..y * r.stride + n].copy_from_slice(&packed[src..src + n]);
        }
        r
    }

    /// BGRA8888 raster from RGBA bytes (`width * height * 4`).
    pub fn from_rgba(width: u32, height: u32, rgba: &[u8]) -> Self {
        let mut r = Self::from_packed(width, height, PixelLayout::Bgra8888, rgba);
        swap_red_blue(&mut r.data);
        r
    }

    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.layout.bytes_per_pixel()
    }

    /// Rows without stride padding.
    pub fn to_packed(&self) -> Vec<u8> {
        let row = self.row_bytes();
        if row == self.stride {
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(row * self.height as usize);
        for y in 0..self.height as usize {
            out.extend_from_slice(&self.data[y * self.stride..y * self.stride + row]);
        }
        out
    }

    /// Pixel at `(x, y)` as `[b, g, r, a]`.
    pub fn bgra_at(&self, x: u32, y: u32) -> [u8; 4] {
        let bpp = self.layout.bytes_per_pixel();
        let i = y as usize * self.stride + x as usize * bpp;
        match self.layout {
            PixelLayout::Bgra8888 => [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]],
            PixelLayout::Argb1555 => {
                let v = u16::from_le_bytes([self.data[i], self.data[i + 1]]);
                let a = if v & 0x8000 != 0 { 0xFF } else { 0 };
                [expand5(v), expand5(v >> 5), expand5(v >> 10), a]
            }
            PixelLayout::Rgb565 => {
                let v = u16::from_le_bytes([self.data[i], self.data[i + 1]]);
                let [r, g, b] = rgb565_to_rgb(v);
                [b, g, r, 0xFF]
            }
        }
    }

    /// Pixel at `(x, y)` as `[r, g, b, a]`.
    pub fn rgba_at(&self, x: u32, y: u32) -> [u8; 4] {
        let [b, g, r, a] = self.bgra_at(x, y);
        [r, g, b, a]
    }

    /// Tightly packed RGBA bytes, the accelerator's input order.
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut out = self.convert(PixelLayout::Bgra8888).to_packed();
        swap_red_blue(&mut out);
        out
    }

    /// Re-encode into another layout.  Narrowing drops low bits; alpha below
    /// 128 becomes transparent in ARGB1555 and is discarded by RGB565.
    pub fn convert(&self, layout: PixelLayout) -> Raster {
        if layout == self.layout {
            return self.clone();
        }
        let mut out = Raster::new(self.width, self.height, layout);
        let bpp = layout.bytes_per_pixel();
        for y in 0..self.height {
            for x in 0..self.width {
                let [b, g, r, a] = self.bgra_at(x, y);
                let i = y as usize * out.stride + x as usize * bpp;
                match layout {
                    PixelLayout::Bgra8888 => out.data[i..i + 4].copy_from_slice(&[b, g, r, a]),
                    PixelLayout::Argb1555 => {
                        let v = (if a >= 0x80 { 0x8000 } else { 0 })
                            | ((r as u16 >> 3) << 10)
                            | ((g as u16 >> 3) << 5)
                            | (b as u16 >> 3);
                        out.data[i..i + 2].copy_from_slice(&v.to_le_bytes());
                    }
                    PixelLayout::Rgb565 => {
                        out.data[i..i + 2].copy_from_slice(&rgb_to_565(r, g, b).to_le_bytes());
                    }
                }
            }
        }
        out
    }

    /// Whether every channel survives a round trip through 4 bits.
    pub fn is_argb4444_compatible(&self) -> bool {
        (0..self.height).all(|y| {
            (0..self.width).all(|x| self.bgra_at(x, y).iter().all(|c| c % 17 == 0))
        })
    }
}

/// Swap bytes 0 and 2 of every 4-byte pixel (RGBA ⇄ BGRA).
pub fn swap_red_blue(data: &mut [u8]) {
    for px in data.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
}
