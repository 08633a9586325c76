//! Image body decoding.
//!
//! Images are parsed from an in-memory copy of their bytes into a detached
//! [`ParsedProperty`] tree, which `PropertyTree` then grafts into the arena.
//! This keeps the stream lock held only for the raw read and lets many images
//! parse at once.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::block::is_secondary;
use crate::crypto::WzKey;
use crate::io_stream::{DecodeError, SharedStream, WzReader};

use super::canvas::{CanvasNode, PayloadSource};
use super::link::LinkNode;
use super::value::NodeValue;

/// Type name of the image header and of plain sub-properties.
pub const PROPERTY_TYPE: &str = "Property";
pub const CANVAS_TYPE:   &str = "Canvas";
pub const VECTOR_TYPE:   &str = "Shape2D#Vector2D";
pub const CONVEX_TYPE:   &str = "Shape2D#Convex2D";
pub const LINK_TYPE:     &str = "UOL";

/// Property tags inside a property list.
pub mod tag {
    pub const NULL:          u8 = 0;
    pub const SHORT:         u8 = 2;
    pub const INT:           u8 = 3;
    pub const FLOAT:         u8 = 4;
    pub const DOUBLE:        u8 = 5;
    pub const STRING:        u8 = 8;
    pub const EXTENDED:      u8 = 9;
    pub const SHORT_ALT:     u8 = 11;
    pub const INT_ALT:       u8 = 19;
    pub const LONG:          u8 = 20;
    /// Marker byte in front of a non-zero float.
    pub const FLOAT_PRESENT: u8 = 0x80;
}

/// A decoded property not yet attached to a tree.
#[derive(Debug)]
pub struct ParsedProperty {
    pub name:     String,
    pub value:    NodeValue,
    pub children: Vec<ParsedProperty>,
}

impl ParsedProperty {
    fn leaf(name: String, value: NodeValue) -> Self {
        Self { name, value, children: Vec::new() }
    }
}

/// Where canvas payloads of the image being parsed can be reloaded from.
#[derive(Debug, Clone)]
pub struct LazyPayloads {
    pub stream: SharedStream,
    /// File offset of the first byte of the image blob.
    pub origin: u64,
}

struct Ctx<'a> {
    secondary: bool,
    lazy:      Option<&'a LazyPayloads>,
}

/// Parse a complete image blob.
///
/// String back-references inside an image are relative to its first byte,
/// which is offset zero of `blob`.
pub fn parse_image_blob(
    blob:      &[u8],
    key:       &WzKey,
    secondary: bool,
    lazy:      Option<&LazyPayloads>,
) -> Result<Vec<ParsedProperty>, DecodeError> {
    let mut r = WzReader::new(Cursor::new(blob), key.clone(), 0, 0);
    let ctx = Ctx { secondary, lazy };
    let header = r.read_string_block(0, secondary)?;
    if header != PROPERTY_TYPE {
        return Err(DecodeError::BadImageHeader(header));
    }
    r.read_u16::<LittleEndian>()?;
    parse_property_list(&mut r, &ctx)
}

fn parse_property_list<R: Read + Seek>(r: &mut WzReader<R>, ctx: &Ctx) -> Result<Vec<ParsedProperty>, DecodeError> {
    let pos = r.position()?;
    let count = r.read_compressed_int()?;
    if count < 0 {
        return Err(DecodeError::BadLength { length: count as i64, position: pos });
    }
    let mut out = Vec::with_capacity((count as usize).min(4096));
    for _ in 0..count {
        let name = r.read_string_block(0, ctx.secondary)?;
        let t = r.read_u8()?;
        let prop = match t {
            tag::NULL => ParsedProperty::leaf(name, NodeValue::Null),
            tag::SHORT | tag::SHORT_ALT => {
                let v = r.read_i16::<LittleEndian>()?;
                ParsedProperty::leaf(name, NodeValue::Short(v))
            }
            tag::INT | tag::INT_ALT => {
                let v = r.read_compressed_int()?;
                ParsedProperty::leaf(name, NodeValue::Int(v))
            }
            tag::LONG => {
                let v = r.read_compressed_long()?;
                ParsedProperty::leaf(name, NodeValue::Long(v))
            }
            tag::FLOAT => {
                let v = if r.read_u8()? == tag::FLOAT_PRESENT {
                    r.read_f32::<LittleEndian>()?
                } else {
                    0.0
                };
                ParsedProperty::leaf(name, NodeValue::Float(v))
            }
            tag::DOUBLE => {
                let v = r.read_f64::<LittleEndian>()?;
                ParsedProperty::leaf(name, NodeValue::Double(v))
            }
            tag::STRING => {
                let v = r.read_string_block(0, ctx.secondary)?;
                ParsedProperty::leaf(name, NodeValue::String(v))
            }
            tag::EXTENDED => {
                let len = r.read_u32::<LittleEndian>()?;
                let end = r.position()? + len as u64;
                let prop = parse_extended(r, name, Some(end), ctx)?;
                r.seek_to(end)?;
                prop
            }
            other => return Err(DecodeError::UnknownPropertyTag { tag: other, name }),
        };
        out.push(prop);
    }
    Ok(out)
}

/// Decode an extended body.  `end` is known when the body is length-prefixed;
/// convex members have none and cannot hold opaque types.
fn parse_extended<R: Read + Seek>(
    r:    &mut WzReader<R>,
    name: String,
    end:  Option<u64>,
    ctx:  &Ctx,
) -> Result<ParsedProperty, DecodeError> {
    let type_name = r.read_string_block(0, ctx.secondary)?;
    match type_name.as_str() {
        PROPERTY_TYPE => {
            r.read_u16::<LittleEndian>()?;
            let children = parse_property_list(r, ctx)?;
            Ok(ParsedProperty { name, value: NodeValue::Property, children })
        }
        CANVAS_TYPE => parse_canvas(r, name, ctx),
        VECTOR_TYPE => {
            let x = r.read_compressed_int()?;
            let y = r.read_compressed_int()?;
            Ok(ParsedProperty::leaf(name, NodeValue::Vector { x, y }))
        }
        CONVEX_TYPE => {
            let pos = r.position()?;
            let count = r.read_compressed_int()?;
            if count < 0 {
                return Err(DecodeError::BadLength { length: count as i64, position: pos });
            }
            let children = (0..count)
                .map(|i| parse_extended(r, i.to_string(), None, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ParsedProperty { name, value: NodeValue::Convex, children })
        }
        LINK_TYPE => {
            r.read_u8()?;
            let path = r.read_string_block(0, ctx.secondary)?;
            Ok(ParsedProperty::leaf(name, NodeValue::Link(LinkNode::new(path))))
        }
        _ => {
            let Some(end) = end else {
                return Err(DecodeError::UnsizedExtended(type_name));
            };
            let len = end.saturating_sub(r.position()?);
            r.ensure_available(len)?;
            let bytes = r.read_bytes(len as usize)?;
            Ok(ParsedProperty::leaf(name, NodeValue::Opaque { type_name, bytes }))
        }
    }
}

fn parse_canvas<R: Read + Seek>(r: &mut WzReader<R>, name: String, ctx: &Ctx) -> Result<ParsedProperty, DecodeError> {
    r.read_u8()?;
    let children = if r.read_u8()? == 1 {
        r.read_u16::<LittleEndian>()?;
        parse_property_list(r, ctx)?
    } else {
        Vec::new()
    };

    let width = r.read_compressed_int()?;
    let height = r.read_compressed_int()?;
    let format = r.read_compressed_int()?;
    let mag_level = r.read_compressed_int()?;
    r.skip(4)?;

    let pos = r.position()?;
    let len = r.read_i32::<LittleEndian>()? as i64 - 1;
    if len <= 0 {
        return Err(DecodeError::BadLength { length: len, position: pos });
    }
    r.read_u8()?;
    let payload_pos = r.position()?;
    r.ensure_available(len as u64)?;

    let (width, height) = (width.max(0) as u32, height.max(0) as u32);
    let canvas = match ctx.lazy {
        Some(lazy) => {
            // Only the framing header is needed to tell list mode apart.
            let head = r.read_bytes(len.min(2) as usize)?;
            r.skip(len - head.len() as i64)?;
            let source = PayloadSource {
                stream: lazy.stream.clone(),
                offset: lazy.origin + payload_pos,
                len:    len as u32,
            };
            CanvasNode::lazy(width, height, format, mag_level, source, is_secondary(&head))
        }
        None => {
            let payload = r.read_bytes(len as usize)?;
            CanvasNode::from_payload(width, height, format, mag_level, payload)
        }
    };
    Ok(ParsedProperty { name, value: NodeValue::Canvas(canvas), children })
}
