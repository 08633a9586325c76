//! Image body encoding; inverse of [`super::parse`].

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Cursor, Seek, Write};

use crate::crypto::WzKey;
use crate::io_stream::{WzWriter, TAG_INLINE, TAG_INLINE_EXTENDED, TAG_OFFSET, TAG_OFFSET_EXTENDED};

use super::parse::{tag, CANVAS_TYPE, CONVEX_TYPE, LINK_TYPE, PROPERTY_TYPE, VECTOR_TYPE};
use super::{NodeId, NodeValue, PropertyTree, TreeError};

/// Serialize the children of `image` as a standalone image blob.  String
/// back-references are relative to the blob's first byte.
pub fn write_image_blob(
    tree:      &PropertyTree,
    image:     NodeId,
    key:       &WzKey,
    secondary: bool,
) -> Result<Vec<u8>, TreeError> {
    let mut w = WzWriter::new(Cursor::new(Vec::new()), key.clone(), 0, 0);
    w.write_string_value(PROPERTY_TYPE, TAG_INLINE_EXTENDED, TAG_OFFSET_EXTENDED, secondary)?;
    w.write_u16::<LittleEndian>(0)?;
    write_property_list(tree, tree.children(image), &mut w, secondary)?;
    Ok(w.into_inner().into_inner())
}

/// Bytes to store for `image` on save.  Images that were never parsed, or
/// were parsed but left untouched, are copied from their source verbatim.
pub fn image_bytes(tree: &PropertyTree, image: NodeId) -> Result<Vec<u8>, TreeError> {
    let img = tree.image(image).ok_or(TreeError::Missing(image))?;
    if let Some(src) = &img.source {
        if !img.parsed || !img.changed {
            return Ok(src.read_blob()?);
        }
    }
    if !img.parsed {
        return Err(TreeError::NoSource(image));
    }
    write_image_blob(tree, image, &img.key, img.secondary)
}

fn write_property_list<W: Write + Seek>(
    tree:      &PropertyTree,
    ids:       &[NodeId],
    w:         &mut WzWriter<W>,
    secondary: bool,
) -> Result<(), TreeError> {
    w.write_compressed_int(ids.len() as i32)?;
    for &id in ids {
        let node = tree.node(id).ok_or(TreeError::Missing(id))?;
        w.write_string_value(&node.name, TAG_INLINE, TAG_OFFSET, secondary)?;
        write_value(tree, id, w, secondary)?;
    }
    Ok(())
}

fn write_value<W: Write + Seek>(
    tree:      &PropertyTree,
    id:        NodeId,
    w:         &mut WzWriter<W>,
    secondary: bool,
) -> Result<(), TreeError> {
    let node = tree.node(id).ok_or(TreeError::Missing(id))?;
    match &node.value {
        NodeValue::Null => w.write_u8(tag::NULL)?,
        NodeValue::Short(v) => {
            w.write_u8(tag::SHORT)?;
            w.write_i16::<LittleEndian>(*v)?;
        }
        NodeValue::Int(v) => {
            w.write_u8(tag::INT)?;
            w.write_compressed_int(*v)?;
        }
        NodeValue::Long(v) => {
            w.write_u8(tag::LONG)?;
            w.write_compressed_long(*v)?;
        }
        NodeValue::Float(v) => {
            w.write_u8(tag::FLOAT)?;
            if *v == 0.0 {
                w.write_u8(0)?;
            } else {
                w.write_u8(tag::FLOAT_PRESENT)?;
                w.write_f32::<LittleEndian>(*v)?;
            }
        }
        NodeValue::Double(v) => {
            w.write_u8(tag::DOUBLE)?;
            w.write_f64::<LittleEndian>(*v)?;
        }
        NodeValue::String(s) => {
            w.write_u8(tag::STRING)?;
            w.write_string_value(s, TAG_INLINE, TAG_OFFSET, secondary)?;
        }
        NodeValue::Directory(_) | NodeValue::Image(_) => {
            return Err(TreeError::NotSerializable(node.kind()));
        }
        _ => {
            w.write_u8(tag::EXTENDED)?;
            let len_pos = w.position()?;
            w.write_u32::<LittleEndian>(0)?;
            write_extended(tree, id, w, secondary)?;
            let end = w.position()?;
            w.patch_i32(len_pos, (end - len_pos - 4) as i32)?;
        }
    }
    Ok(())
}

fn write_type<W: Write + Seek>(w: &mut WzWriter<W>, name: &str, secondary: bool) -> Result<(), TreeError> {
    w.write_string_value(name, TAG_INLINE_EXTENDED, TAG_OFFSET_EXTENDED, secondary)?;
    Ok(())
}

fn write_extended<W: Write + Seek>(
    tree:      &PropertyTree,
    id:        NodeId,
    w:         &mut WzWriter<W>,
    secondary: bool,
) -> Result<(), TreeError> {
    let node = tree.node(id).ok_or(TreeError::Missing(id))?;
    match &node.value {
        NodeValue::Property => {
            write_type(w, PROPERTY_TYPE, secondary)?;
            w.write_u16::<LittleEndian>(0)?;
            write_property_list(tree, &node.children, w, secondary)?;
        }
        NodeValue::Canvas(canvas) => {
            write_type(w, CANVAS_TYPE, secondary)?;
            w.write_u8(0)?;
            if node.children.is_empty() {
                w.write_u8(0)?;
            } else {
                w.write_u8(1)?;
                w.write_u16::<LittleEndian>(0)?;
                write_property_list(tree, &node.children, w, secondary)?;
            }
            w.write_compressed_int(canvas.width as i32)?;
            w.write_compressed_int(canvas.height as i32)?;
            w.write_compressed_int(canvas.format)?;
            w.write_compressed_int(canvas.mag_level)?;
            w.write_i32::<LittleEndian>(0)?;
            let payload = canvas.compressed()?;
            w.write_i32::<LittleEndian>(payload.len() as i32 + 1)?;
            w.write_u8(0)?;
            w.write_all(&payload)?;
        }
        NodeValue::Vector { x, y } => {
            write_type(w, VECTOR_TYPE, secondary)?;
            w.write_compressed_int(*x)?;
            w.write_compressed_int(*y)?;
        }
        NodeValue::Convex => {
            write_type(w, CONVEX_TYPE, secondary)?;
            w.write_compressed_int(node.children.len() as i32)?;
            for &c in &node.children {
                let member = tree.node(c).ok_or(TreeError::Missing(c))?;
                let kind = member.kind();
                if !kind.is_extended() || kind == super::NodeKind::Opaque {
                    return Err(TreeError::InvalidConvexMember(member.name.clone()));
                }
                write_extended(tree, c, w, secondary)?;
            }
        }
        NodeValue::Link(link) => {
            write_type(w, LINK_TYPE, secondary)?;
            w.write_u8(0)?;
            w.write_string_value(link.path(), TAG_INLINE, TAG_OFFSET, secondary)?;
        }
        NodeValue::Opaque { type_name, bytes } => {
            write_type(w, type_name, secondary)?;
            w.write_all(bytes)?;
        }
        _ => return Err(TreeError::NotSerializable(node.kind())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PixelFormat;
    use crate::crypto::test_support::SeededKeyStream;
    use crate::io_stream::{DecodeError, SharedStream};
    use crate::tree::parse::{parse_image_blob, LazyPayloads};
    use crate::tree::{CanvasNode, DirectoryNode, ImageNode, LinkNode, NodeKind};

    fn build(key: &WzKey) -> (PropertyTree, NodeId) {
        let mut t = PropertyTree::new();
        let img = t.create("1002000.img", NodeValue::Image(ImageNode::new(key.clone())));
        let info = t.add_child(img, "info", NodeValue::Property).unwrap();
        t.add_child(info, "islot", NodeValue::String("Cp".into())).unwrap();
        t.add_child(info, "vslot", NodeValue::String("Cp".into())).unwrap();
        t.add_child(info, "reqLevel", NodeValue::Short(10)).unwrap();
        t.add_child(info, "price", NodeValue::Int(1_000_000)).unwrap();
        t.add_child(info, "expire", NodeValue::Long(-5_000_000_000)).unwrap();
        t.add_child(info, "zero", NodeValue::Float(0.0)).unwrap();
        t.add_child(info, "ratio", NodeValue::Float(1.5)).unwrap();
        t.add_child(info, "exact", NodeValue::Double(-0.25)).unwrap();
        t.add_child(info, "nothing", NodeValue::Null).unwrap();
        let packed: Vec<u8> = (0..16).collect();
        let canvas = CanvasNode::from_packed(2, 2, PixelFormat::Argb8888, &packed, key, false).unwrap();
        let icon = t.add_child(info, "iconRaw", NodeValue::Canvas(canvas)).unwrap();
        t.add_child(icon, "origin", NodeValue::Vector { x: -1, y: 31 }).unwrap();
        let convex = t.add_child(img, "foothold", NodeValue::Convex).unwrap();
        t.add_child(convex, "0", NodeValue::Vector { x: 0, y: 0 }).unwrap();
        t.add_child(convex, "1", NodeValue::Vector { x: 200, y: -200 }).unwrap();
        t.add_child(img, "icon", NodeValue::Link(LinkNode::new("info/iconRaw"))).unwrap();
        t.add_child(
            img,
            "sound",
            NodeValue::Opaque { type_name: "Sound_DX8".into(), bytes: vec![9, 8, 7, 6] },
        )
        .unwrap();
        (t, img)
    }

    fn reparse(blob: &[u8], key: &WzKey, secondary: bool) -> (PropertyTree, NodeId) {
        let props = parse_image_blob(blob, key, secondary, None).unwrap();
        let mut t = PropertyTree::new();
        let img = t.create("copy.img", NodeValue::Image(ImageNode::new(key.clone())));
        t.graft_parsed(img, props).unwrap();
        (t, img)
    }

    #[test]
    fn every_property_kind_survives_a_rewrite() {
        let key = WzKey::zero();
        let (t, img) = build(&key);
        let blob = write_image_blob(&t, img, &key, false).unwrap();
        let (u, copy) = reparse(&blob, &key, false);

        let at = |p: &str| u.get_from_path(copy, p).unwrap();
        assert_eq!(u.get_string(at("info/islot")), Some("Cp".into()));
        assert_eq!(u.kind(at("info/reqLevel")), Some(NodeKind::Short));
        assert_eq!(u.get_int(at("info/price")), Some(1_000_000));
        assert_eq!(u.get_long(at("info/expire")), Some(-5_000_000_000));
        assert_eq!(u.get_float(at("info/zero")), Some(0.0));
        assert_eq!(u.get_float(at("info/ratio")), Some(1.5));
        assert_eq!(u.get_double(at("info/exact")), Some(-0.25));
        assert_eq!(u.kind(at("info/nothing")), Some(NodeKind::Null));
        assert_eq!(u.get_vector(at("info/iconRaw/origin")), Some((-1, 31)));
        assert_eq!(u.get_vector(at("foothold/1")), Some((200, -200)));
        assert_eq!(u.children(at("foothold")).len(), 2);
        assert!(matches!(u.value(at("sound")), Some(NodeValue::Opaque { type_name, bytes })
            if type_name == "Sound_DX8" && bytes == &[9, 8, 7, 6]));

        let raster = u.decode_canvas(at("icon")).unwrap().unwrap();
        assert_eq!(raster.to_packed(), (0..16).collect::<Vec<u8>>());

        let again = write_image_blob(&u, copy, &key, false).unwrap();
        assert_eq!(again, blob);
    }

    #[test]
    fn repeated_names_are_back_referenced() {
        let key = WzKey::zero();
        let mut t = PropertyTree::new();
        let img = t.create("a.img", NodeValue::Image(ImageNode::new(key.clone())));
        for i in 0..3 {
            let p = t.add_child(img, format!("frame{i}"), NodeValue::Property).unwrap();
            t.add_child(p, "delay", NodeValue::Int(120)).unwrap();
        }
        let blob = write_image_blob(&t, img, &key, false).unwrap();
        let (u, copy) = reparse(&blob, &key, false);
        assert_eq!(u.get_int(u.get_from_path(copy, "frame2/delay").unwrap()), Some(120));

        let single = {
            let mut s = PropertyTree::new();
            let i = s.create("b.img", NodeValue::Image(ImageNode::new(key.clone())));
            let p = s.add_child(i, "frame0", NodeValue::Property).unwrap();
            s.add_child(p, "delay", NodeValue::Int(120)).unwrap();
            write_image_blob(&s, i, &key, false).unwrap()
        };
        // Later copies of "Property" and "delay" cost five bytes each.
        assert!(blob.len() < single.len() * 3);
    }

    #[test]
    fn secondary_strings_need_the_image_key() {
        let key = WzKey::new(SeededKeyStream(7));
        let (t, img) = build(&key);
        let blob = write_image_blob(&t, img, &key, true).unwrap();
        let plain = write_image_blob(&t, img, &key, false).unwrap();
        assert_ne!(blob, plain);
        let (u, copy) = reparse(&blob, &key, true);
        assert_eq!(u.get_string(u.get_from_path(copy, "info/vslot").unwrap()), Some("Cp".into()));
    }

    #[test]
    fn opaque_convex_member_is_rejected() {
        let key = WzKey::zero();
        let mut t = PropertyTree::new();
        let img = t.create("c.img", NodeValue::Image(ImageNode::new(key.clone())));
        let convex = t.add_child(img, "shape", NodeValue::Convex).unwrap();
        t.add_child(convex, "0", NodeValue::Opaque { type_name: "X".into(), bytes: vec![] }).unwrap();
        assert!(matches!(
            write_image_blob(&t, img, &key, false),
            Err(TreeError::InvalidConvexMember(_))
        ));
    }

    #[test]
    fn directories_cannot_live_in_images() {
        let key = WzKey::zero();
        let mut t = PropertyTree::new();
        let img = t.create("d.img", NodeValue::Image(ImageNode::new(key.clone())));
        t.add_child(img, "sub", NodeValue::Directory(DirectoryNode::default())).unwrap();
        assert!(matches!(
            write_image_blob(&t, img, &key, false),
            Err(TreeError::NotSerializable(NodeKind::Directory))
        ));
    }

    #[test]
    fn truncated_canvas_payload_is_a_length_error() {
        let key = WzKey::zero();
        let mut t = PropertyTree::new();
        let img = t.create("a.img", NodeValue::Image(ImageNode::new(key.clone())));
        let packed: Vec<u8> = (0..64).collect();
        let canvas = CanvasNode::from_packed(4, 4, PixelFormat::Argb8888, &packed, &key, false).unwrap();
        t.add_child(img, "0", NodeValue::Canvas(canvas)).unwrap();
        let blob = write_image_blob(&t, img, &key, false).unwrap();

        assert!(matches!(
            parse_image_blob(&blob[..blob.len() - 3], &key, false, None),
            Err(DecodeError::BadLength { .. })
        ));
    }

    #[test]
    fn lazy_canvases_stay_unloaded_until_decoded() {
        let key = WzKey::new(SeededKeyStream(0x1234));
        let mut t = PropertyTree::new();
        let img = t.create("a.img", NodeValue::Image(ImageNode::new(key.clone())));
        let packed: Vec<u8> = (0..64).collect();
        for (name, secondary) in [("plain", false), ("listed", true)] {
            let canvas = CanvasNode::from_packed(4, 4, PixelFormat::Argb8888, &packed, &key, secondary).unwrap();
            t.add_child(img, name, NodeValue::Canvas(canvas)).unwrap();
        }
        let blob = write_image_blob(&t, img, &key, false).unwrap();

        let origin = 9u64;
        let mut file = vec![0xEE; origin as usize];
        file.extend_from_slice(&blob);
        let lazy = LazyPayloads {
            stream: SharedStream::new(Cursor::new(file), key.clone(), 0, 0),
            origin,
        };
        let props = parse_image_blob(&blob, &key, false, Some(&lazy)).unwrap();
        let mut u = PropertyTree::new();
        let copy = u.create("copy.img", NodeValue::Image(ImageNode::new(key.clone())));
        u.graft_parsed(copy, props).unwrap();

        for (name, secondary) in [("plain", false), ("listed", true)] {
            let id = u.get_from_path(copy, name).unwrap();
            let canvas = u.canvas(id).unwrap();
            assert!(!canvas.is_loaded());
            assert!(canvas.has_payload());
            assert_eq!(canvas.is_secondary(), secondary);
            let raster = u.decode_canvas(id).unwrap().unwrap();
            assert_eq!(raster.to_packed(), packed);
            assert!(!u.canvas(id).unwrap().is_loaded());
        }
    }
}
