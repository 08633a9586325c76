//! Software DXT3 / DXT5 block decoder.
//!
//! Output is tightly packed BGRA8888.  Blocks are laid out row-major with
//! partial blocks at the right and bottom edges; pixels outside the image are
//! decoded and dropped.

use super::raster::rgb565_to_rgb;
use crate::plugin::BlockFormat;

const BLOCK_BYTES: usize = 16;

/// 4-entry colour table, each entry `[b, g, r, a]`.
fn color_table(c0: u16, c1: u16) -> [[u8; 4]; 4] {
    let [r0, g0, b0] = rgb565_to_rgb(c0);
    let [r1, g1, b1] = rgb565_to_rgb(c1);
    let (r0, g0, b0, r1, g1, b1) =
        (r0 as u32, g0 as u32, b0 as u32, r1 as u32, g1 as u32, b1 as u32);

    let px = |r: u32, g: u32, b: u32| [b as u8, g as u8, r as u8, 0xFF];
    let (c2, c3) = if c0 > c1 {
        (
            px((2 * r0 + r1 + 1) / 3, (2 * g0 + g1 + 1) / 3, (2 * b0 + b1 + 1) / 3),
            px((r0 + 2 * r1 + 1) / 3, (g0 + 2 * g1 + 1) / 3, (b0 + 2 * b1 + 1) / 3),
        )
    } else {
        (px((r0 + r1) / 2, (g0 + g1) / 2, (b0 + b1) / 2), [0, 0, 0, 0xFF])
    };
    [px(r0, g0, b0), px(r1, g1, b1), c2, c3]
}

/// Sixteen 2-bit colour indices, row-major.
fn color_indices(bits: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (row, &b) in bits.iter().take(4).enumerate() {
        for col in 0..4 {
            out[row * 4 + col] = (b >> (col * 2)) & 0x03;
        }
    }
    out
}

/// DXT3: sixteen explicit 4-bit alphas, low nibble first.
fn dxt3_alpha(bits: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, &b) in bits.iter().take(8).enumerate() {
        let lo = b & 0x0F;
        let hi = b >> 4;
        out[i * 2] = lo | (lo << 4);
        out[i * 2 + 1] = hi | (hi << 4);
    }
    out
}

/// DXT5 8-entry alpha codebook.
fn dxt5_alpha_table(a0: u8, a1: u8) -> [u8; 8] {
    let mut t = [0u8; 8];
    t[0] = a0;
    t[1] = a1;
    let (a0, a1) = (a0 as u32, a1 as u32);
    if a0 > a1 {
        for i in 2..8u32 {
            t[i as usize] = (((8 - i) * a0 + (i - 1) * a1 + 3) / 7) as u8;
        }
    } else {
        for i in 2..6u32 {
            t[i as usize] = (((6 - i) * a0 + (i - 1) * a1 + 2) / 5) as u8;
        }
        t[6] = 0;
        t[7] = 255;
    }
    t
}

/// Sixteen 3-bit alpha indices from two 24-bit little-endian groups.
fn dxt5_alpha_indices(bits: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for half in 0..2 {
        let g = &bits[half * 3..half * 3 + 3];
        let flags = g[0] as u32 | (g[1] as u32) << 8 | (g[2] as u32) << 16;
        for j in 0..8 {
            out[half * 8 + j] = ((flags >> (3 * j)) & 0x07) as u8;
        }
    }
    out
}

/// Decode one 16-byte block into 16 BGRA pixels, row-major.
pub fn decode_block(block: &[u8; BLOCK_BYTES], format: BlockFormat) -> [[u8; 4]; 16] {
    let alpha = match format {
        BlockFormat::Dxt5 => {
            let table = dxt5_alpha_table(block[0], block[1]);
            dxt5_alpha_indices(&block[2..8]).map(|i| table[i as usize])
        }
        _ => dxt3_alpha(&block[0..8]),
    };
    let c0 = u16::from_le_bytes([block[8], block[9]]);
    let c1 = u16::from_le_bytes([block[10], block[11]]);
    let colors = color_table(c0, c1);
    let idx = color_indices(&block[12..16]);

    let mut out = [[0u8; 4]; 16];
    for i in 0..16 {
        let mut px = colors[idx[i] as usize];
        px[3] = alpha[i];
        out[i] = px;
    }
    out
}

/// Decode a DXT3 or DXT5 image into `width * height * 4` BGRA bytes.
/// Missing blocks decode as zero bytes.
pub fn decode_image(blocks: &[u8], width: u32, height: u32, format: BlockFormat) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let bw = w.div_ceil(4);
    let mut out = vec![0u8; w * h * 4];
    let mut block = [0u8; BLOCK_BYTES];

    for by in 0..h.div_ceil(4) {
        for bx in 0..bw {
            let off = (by * bw + bx) * BLOCK_BYTES;
            block.fill(0);
            if off < blocks.len() {
                let n = BLOCK_BYTES.min(blocks.len() - off);
                block[..n].copy_from_slice(&blocks[off..off + n]);
            }
            let pixels = decode_block(&block, format);
            for j in 0..4 {
                let y = by * 4 + j;
                if y >= h {
                    break;
                }
                for i in 0..4 {
                    let x = bx * 4 + i;
                    if x >= w {
                        break;
                    }
                    let o = (y * w + x) * 4;
                    out[o..o + 4].copy_from_slice(&pixels[j * 4 + i]);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_table_four_color_branch() {
        // c0 = pure red, c1 = pure blue, c0 > c1
        let t = color_table(0xF800, 0x001F);
        assert_eq!(t[0], [0, 0, 255, 255]);
        assert_eq!(t[1], [255, 0, 0, 255]);
        assert_eq!(t[2], [85, 0, 170, 255]);
        assert_eq!(t[3], [170, 0, 85, 255]);
    }

    #[test]
    fn color_table_three_color_branch() {
        let t = color_table(0x001F, 0xF800);
        assert_eq!(t[2], [127, 0, 127, 255]);
        assert_eq!(t[3], [0, 0, 0, 255]);
    }

    #[test]
    fn dxt5_alpha_tables() {
        assert_eq!(dxt5_alpha_table(255, 0), [255, 0, 219, 182, 146, 109, 73, 36]);
        assert_eq!(dxt5_alpha_table(0, 255), [0, 255, 51, 102, 153, 204, 0, 255]);
    }

    #[test]
    fn dxt3_reference_block() {
        let mut block = [0u8; 16];
        // alpha row 0: 0x0, 0xF, 0x8, 0x1
        block[0] = 0xF0;
        block[1] = 0x18;
        block[8..10].copy_from_slice(&0xF800u16.to_le_bytes());
        block[10..12].copy_from_slice(&0x001Fu16.to_le_bytes());
        // row 0 indices: 0, 1, 2, 3
        block[12] = 0b11_10_01_00;
        let px = decode_block(&block, BlockFormat::Dxt3);
        assert_eq!(px[0], [0, 0, 255, 0x00]);
        assert_eq!(px[1], [255, 0, 0, 0xFF]);
        assert_eq!(px[2], [85, 0, 170, 0x88]);
        assert_eq!(px[3], [170, 0, 85, 0x11]);
        assert_eq!(px[4], [0, 0, 255, 0x00]);
    }

    #[test]
    fn dxt5_reference_block() {
        let mut block = [0u8; 16];
        block[0] = 0;
        block[1] = 255;
        // indices for pixels 0..8: 0,1,2,3,4,5,6,7
        let flags: u32 = (0..8).fold(0, |acc, j| acc | (j << (3 * j)));
        block[2..5].copy_from_slice(&flags.to_le_bytes()[..3]);
        // colour: c0 < c1 selects the 3-colour table
        block[8..10].copy_from_slice(&0x001Fu16.to_le_bytes());
        block[10..12].copy_from_slice(&0xF800u16.to_le_bytes());
        block[12] = 0b11_10_01_00;
        let px = decode_block(&block, BlockFormat::Dxt5);
        let alphas: Vec<u8> = px[..8].iter().map(|p| p[3]).collect();
        assert_eq!(alphas, vec![0, 255, 51, 102, 153, 204, 0, 255]);
        assert_eq!(px[0][..3], [255, 0, 0]);
        assert_eq!(px[1][..3], [0, 0, 255]);
        assert_eq!(px[2][..3], [127, 0, 127]);
        assert_eq!(px[3][..3], [0, 0, 0]);
        assert_eq!(px[8][3], 0);
    }

    #[test]
    fn partial_blocks_are_clipped() {
        let mut block = [0u8; 16];
        block[8..10].copy_from_slice(&0xFFFFu16.to_le_bytes());
        block[0..8].fill(0xFF);
        let mut blocks = Vec::new();
        blocks.extend_from_slice(&block);
        blocks.extend_from_slice(&block);
        let out = decode_image(&blocks, 5, 3, BlockFormat::Dxt3);
        assert_eq!(out.len(), 5 * 3 * 4);
        assert!(out.iter().all(|&b| b == 0xFF));
    }
}
