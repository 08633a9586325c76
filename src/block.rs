//! Canvas payload framing: zlib envelope and list-mode blocks.
//!
//! A canvas payload on disk is either a plain zlib stream (2-byte header plus
//! raw deflate) or, in list mode, a sequence of `i32 length` + bytes blocks
//! whose bytes are XORed with the key stream.  The key index restarts at zero
//! for every block.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Cursor, Read, Write};

use crate::codec::CodecError;
use crate::crypto::WzKey;

/// zlib header written in front of every payload this crate produces.
pub const ZLIB_HEADER: [u8; 2] = [0x78, 0x9C];

/// Headers that mark a payload as a plain zlib stream.
pub const ZLIB_HEADERS: [[u8; 2]; 4] = [
    [0x78, 0x9C],
    [0x78, 0xDA],
    [0x78, 0x01],
    [0x78, 0x5E],
];

/// Length of the first block when a plain payload is wrapped.
const HEADER_BLOCK_LEN: usize = 2;

/// Deflate never expands one input byte into more than this many.
pub const MAX_INFLATE_RATIO: usize = 1032;

/// Outputs up to this size are zero-padded without a ratio check.
const MIN_RATIO_CHECKED: usize = 1 << 20;

/// Whether `payload` is list-mode framed rather than a plain zlib stream.
pub fn is_secondary(payload: &[u8]) -> bool {
    match payload {
        [a, b, ..] => !ZLIB_HEADERS.contains(&[*a, *b]),
        _ => false,
    }
}

// ── List blocks ──────────────────────────────────────────────────────────────

/// Visit every block of a list-mode payload.  A zero length ends the walk;
/// trailing bytes after it are ignored.
fn for_each_block<F>(payload: &[u8], mut f: F) -> Result<(), CodecError>
where
    F: FnMut(i32, &[u8]),
{
    let mut cur = Cursor::new(payload);
    let end = payload.len() as u64;
    while cur.position() < end {
        let at = cur.position();
        let len = cur.read_i32::<LittleEndian>()?;
        if len == 0 {
            break;
        }
        let start = cur.position() as usize;
        let stop = start.checked_add(len as usize).filter(|_| len > 0);
        match stop {
            Some(stop) if stop <= payload.len() => {
                f(len, &payload[start..stop]);
                cur.set_position(stop as u64);
            }
            _ => return Err(CodecError::TruncatedBlock { offset: at, length: len }),
        }
    }
    Ok(())
}

/// Strip list-mode framing, XORing each block with `key`.
pub fn unwrap_blocks(payload: &[u8], key: &WzKey) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(payload.len());
    for_each_block(payload, |_, block| {
        let start = out.len();
        out.extend_from_slice(block);
        key.xor_in_place(&mut out[start..]);
    })?;
    Ok(out)
}

/// Frame a plain zlib stream as two blocks: the 2-byte header and the body.
pub fn wrap_blocks(stream: &[u8], key: &WzKey) -> Vec<u8> {
    let split = stream.len().min(HEADER_BLOCK_LEN);
    let mut out = Vec::with_capacity(stream.len() + 8);
    for part in [&stream[..split], &stream[split..]] {
        push_block(&mut out, part, key);
    }
    out
}

fn push_block(out: &mut Vec<u8>, block: &[u8], key: &WzKey) {
    // Writing into a Vec cannot fail.
    let _ = out.write_i32::<LittleEndian>(block.len() as i32);
    let start = out.len();
    out.extend_from_slice(block);
    key.xor_in_place(&mut out[start..]);
}

// ── Conversion ───────────────────────────────────────────────────────────────

/// Result of [`convert_compressed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converted {
    pub payload:   Vec<u8>,
    pub secondary: bool,
    /// `false` when `payload` is the input returned unchanged.
    pub modified:  bool,
}

/// Move a compressed payload between plain and list-mode keys.
///
/// `dec` decrypts existing list-mode framing; `enc` is the key to end up
/// under.  `strip` removes list framing even when `enc` is given.
pub fn convert_compressed(
    payload: &[u8],
    dec:     Option<&WzKey>,
    enc:     Option<&WzKey>,
    strip:   bool,
) -> Result<Converted, CodecError> {
    let was_secondary = is_secondary(payload);
    let decrypt = if was_secondary { dec } else { None };
    let now_secondary = enc.is_some() && !strip;

    let unchanged = || Converted {
        payload:   payload.to_vec(),
        secondary: was_secondary,
        modified:  false,
    };

    if !was_secondary && !now_secondary {
        return Ok(unchanged());
    }
    if let (Some(d), Some(e)) = (decrypt, enc) {
        if now_secondary && d == e {
            return Ok(unchanged());
        }
    }
    if was_secondary && decrypt.is_none() {
        tracing::warn!("list-mode payload without a decryption key left untouched");
        return Ok(unchanged());
    }

    if !was_secondary {
        // Only reachable with now_secondary, so `enc` is present.
        let key = enc.ok_or_else(|| CodecError::Compression("missing encryption key".into()))?;
        return Ok(Converted {
            payload:   wrap_blocks(payload, key),
            secondary: true,
            modified:  true,
        });
    }

    let mut out = Vec::with_capacity(payload.len());
    for_each_block(payload, |len, block| {
        if now_secondary {
            let _ = out.write_i32::<LittleEndian>(len);
        }
        let start = out.len();
        out.extend_from_slice(block);
        let body = &mut out[start..];
        if let Some(d) = decrypt {
            d.xor_in_place(body);
        }
        if let Some(e) = enc.filter(|_| now_secondary) {
            e.xor_in_place(body);
        }
    })?;
    Ok(Converted { payload: out, secondary: now_secondary, modified: true })
}

// ── Deflate envelope ─────────────────────────────────────────────────────────

/// Inflate a plain zlib stream into exactly `expected` bytes.  Short output
/// is zero-padded; excess output is discarded.
///
/// Large outputs that `stream` could not possibly inflate to are rejected
/// before anything is allocated.
pub fn inflate(stream: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
    if stream.len() < ZLIB_HEADER.len() {
        return Err(CodecError::Decompression(format!(
            "payload of {} bytes has no zlib header", stream.len()
        )));
    }
    if expected > MIN_RATIO_CHECKED && expected / MAX_INFLATE_RATIO > stream.len() {
        return Err(CodecError::ImplausibleSize { expected, stored: stream.len() });
    }
    let mut out = Vec::with_capacity(expected);
    DeflateDecoder::new(&stream[ZLIB_HEADER.len()..])
        .take(expected as u64)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    out.resize(expected, 0);
    Ok(out)
}

/// Compress `raw` into a zlib envelope (`78 9C` + raw deflate, no trailer).
pub fn deflate(raw: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut enc = DeflateEncoder::new(ZLIB_HEADER.to_vec(), Compression::default());
    enc.write_all(raw).map_err(|e| CodecError::Compression(e.to_string()))?;
    enc.finish().map_err(|e| CodecError::Compression(e.to_string()))
}

/// Stored payload → packed pixel bytes.
pub fn decode_payload(payload: &[u8], key: &WzKey, expected: usize) -> Result<Vec<u8>, CodecError> {
    if is_secondary(payload) {
        inflate(&unwrap_blocks(payload, key)?, expected)
    } else {
        inflate(payload, expected)
    }
}

/// Packed pixel bytes → stored payload, framed when `secondary`.
pub fn encode_payload(packed: &[u8], key: &WzKey, secondary: bool) -> Result<Vec<u8>, CodecError> {
    let stream = deflate(packed)?;
    Ok(if secondary { wrap_blocks(&stream, key) } else { stream })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::SeededKeyStream;

    fn sample() -> Vec<u8> {
        (0..600u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn plain_payload_roundtrip() {
        let raw = sample();
        let payload = encode_payload(&raw, &WzKey::zero(), false).unwrap();
        assert_eq!(&payload[..2], &ZLIB_HEADER);
        assert!(!is_secondary(&payload));
        assert_eq!(decode_payload(&payload, &WzKey::zero(), raw.len()).unwrap(), raw);
    }

    #[test]
    fn list_payload_roundtrip() {
        let key = WzKey::new(SeededKeyStream(99));
        let raw = sample();
        let payload = encode_payload(&raw, &key, true).unwrap();
        assert_eq!(&payload[..4], &2i32.to_le_bytes());
        assert_eq!(decode_payload(&payload, &key, raw.len()).unwrap(), raw);
    }

    #[test]
    fn each_block_restarts_the_key_stream() {
        let key = WzKey::new(SeededKeyStream(7));
        let stream = deflate(&sample()).unwrap();
        let wrapped = wrap_blocks(&stream, &key);
        let body_len = stream.len() - 2;
        assert_eq!(&wrapped[6..10], &(body_len as i32).to_le_bytes());
        for i in 0..2 {
            assert_eq!(wrapped[4 + i], stream[i] ^ key.byte(i));
        }
        for i in 0..body_len {
            assert_eq!(wrapped[10 + i], stream[2 + i] ^ key.byte(i));
        }
        assert_eq!(unwrap_blocks(&wrapped, &key).unwrap(), stream);
    }

    #[test]
    fn short_output_is_zero_padded() {
        let payload = encode_payload(&[1, 2, 3], &WzKey::zero(), false).unwrap();
        assert_eq!(decode_payload(&payload, &WzKey::zero(), 6).unwrap(), vec![1, 2, 3, 0, 0, 0]);
    }

    #[test]
    fn implausible_output_size_is_rejected() {
        let payload = deflate(&[0u8; 4]).unwrap();
        assert!(matches!(
            inflate(&payload, 1 << 30),
            Err(CodecError::ImplausibleSize { expected, .. }) if expected == 1 << 30
        ));
        let zeros = deflate(&vec![0u8; 4 << 20]).unwrap();
        assert_eq!(inflate(&zeros, 4 << 20).unwrap().len(), 4 << 20);
    }

    #[test]
    fn zero_length_block_terminates() {
        let key = WzKey::zero();
        let mut payload = wrap_blocks(&deflate(&[5u8; 40]).unwrap(), &key);
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&[0xEE; 7]);
        assert_eq!(decode_payload(&payload, &key, 40).unwrap(), vec![5u8; 40]);
    }

    #[test]
    fn truncated_block_is_an_error() {
        let mut payload = 50i32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            unwrap_blocks(&payload, &WzKey::zero()),
            Err(CodecError::TruncatedBlock { offset: 0, length: 50 })
        ));
    }

    #[test]
    fn convert_plain_without_key_is_noop() {
        let payload = deflate(&sample()).unwrap();
        let out = convert_compressed(&payload, None, None, false).unwrap();
        assert!(!out.modified);
        assert_eq!(out.payload, payload);
    }

    #[test]
    fn convert_same_key_is_noop() {
        let key = WzKey::new(SeededKeyStream(1));
        let payload = encode_payload(&sample(), &key, true).unwrap();
        let out = convert_compressed(&payload, Some(&key), Some(&key), false).unwrap();
        assert!(!out.modified);
        assert!(out.secondary);
        assert_eq!(out.payload, payload);
    }

    #[test]
    fn convert_wrap_then_flatten_restores_bytes() {
        let key = WzKey::new(SeededKeyStream(2));
        let plain = deflate(&sample()).unwrap();

        let wrapped = convert_compressed(&plain, None, Some(&key), false).unwrap();
        assert!(wrapped.modified && wrapped.secondary);
        assert!(is_secondary(&wrapped.payload));

        let flat = convert_compressed(&wrapped.payload, Some(&key), Some(&key), true).unwrap();
        assert!(flat.modified && !flat.secondary);
        assert_eq!(flat.payload, plain);
    }

    #[test]
    fn convert_rekeys_between_keys() {
        let old = WzKey::new(SeededKeyStream(3));
        let new = WzKey::new(SeededKeyStream(4));
        let raw = sample();
        let payload = encode_payload(&raw, &old, true).unwrap();
        let out = convert_compressed(&payload, Some(&old), Some(&new), false).unwrap();
        assert!(out.modified && out.secondary);
        assert_eq!(decode_payload(&out.payload, &new, raw.len()).unwrap(), raw);
    }

    #[test]
    fn convert_secondary_without_decrypt_key_is_untouched() {
        let key = WzKey::new(SeededKeyStream(5));
        let payload = encode_payload(&sample(), &key, true).unwrap();
        let out = convert_compressed(&payload, None, Some(&key), false).unwrap();
        assert!(!out.modified);
        assert_eq!(out.payload, payload);
    }
}
