//! List-mode ("secondary") obfuscation.
//!
//! Some images are additionally obfuscated with their archive key: strings
//! use the secondary string encoding and canvas payloads are cut into
//! XORed blocks (see [`crate::block`]).  Which images are affected is decided
//! by a [`ListMembership`] predicate, normally a [`ListManifest`] loaded by the
//! caller.

use std::collections::HashSet;

use crate::crypto::WzKey;
use crate::tree::{NodeId, NodeKind, NodeValue, PropertyTree, TreeError};

pub use crate::block::{convert_compressed, is_secondary, Converted};

/// Decides which images live in list mode.
pub trait ListMembership: Send + Sync {
    /// Whether `entry` (an image path, optionally prefixed with its archive
    /// directory) of archive `archive_name` is list-mode.
    fn contains(&self, archive_name: &str, entry: &str) -> bool;

    /// Whether `full_path` lies beneath any list-mode entry.
    fn is_inside(&self, full_path: &str) -> bool;
}

/// Membership backed by a set of lowercase `archive/path.img` entries.
#[derive(Debug, Clone, Default)]
pub struct ListManifest {
    entries: HashSet<String>,
}

impl ListManifest {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries.into_iter().map(|e| e.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ListMembership for ListManifest {
    fn contains(&self, archive_name: &str, entry: &str) -> bool {
        let entry = entry.to_lowercase().replace(".wz/", "/");
        if archive_name.is_empty() {
            return self.entries.contains(&entry);
        }
        let clean = clean_archive_name(archive_name);
        if !entry.starts_with(&clean) {
            return self.entries.contains(&format!("{clean}/{entry}"));
        }
        // "mob_test/0100100.img" is looked up as "mob/0100100.img".
        let entry = match entry.split_once('/') {
            Some((first, rest)) if first != clean => format!("{clean}/{rest}"),
            _ => entry,
        };
        self.entries.contains(&entry)
    }

    fn is_inside(&self, full_path: &str) -> bool {
        let path = full_path.to_lowercase().replace(".wz", "");
        self.entries.iter().any(|e| path.starts_with(e.as_str()))
    }
}

/// Base archive name: file name only, lowercase, extension and a trailing
/// `_NNN` shard number removed.  `"Mob_001.wz"` becomes `"mob"`.
pub fn clean_archive_name(name: &str) -> String {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name).to_lowercase();
    let stem = match file.rfind('.') {
        Some(i) if i > 0 => &file[..i],
        _ => file.as_str(),
    };
    match stem.rfind('_') {
        Some(i) if i + 1 < stem.len() && stem[i + 1..].bytes().all(|b| b.is_ascii_digit()) => stem[..i].to_owned(),
        _ => stem.to_owned(),
    }
}

// ── Tree operations ──────────────────────────────────────────────────────────

fn canvases(tree: &PropertyTree, id: NodeId) -> Vec<NodeId> {
    tree.walk(id)
        .into_iter()
        .filter(|&n| tree.kind(n) == Some(NodeKind::Canvas))
        .collect()
}

fn images(tree: &PropertyTree, id: NodeId) -> Vec<NodeId> {
    tree.walk(id)
        .into_iter()
        .filter(|&n| tree.kind(n) == Some(NodeKind::Image))
        .collect()
}

/// Run one conversion on the canvas at `id`.  Returns whether it changed.
fn convert_canvas(
    tree:  &mut PropertyTree,
    id:    NodeId,
    dec:   Option<&WzKey>,
    enc:   Option<&WzKey>,
    strip: bool,
) -> Result<bool, TreeError> {
    let Some(canvas) = tree.canvas_mut(id) else { return Ok(false) };
    if !canvas.has_payload() {
        return Ok(false);
    }
    let converted = convert_compressed(canvas.ensure_compressed()?, dec, enc, strip)?;
    if !converted.modified {
        return Ok(false);
    }
    canvas.set_compressed(converted.payload);
    tree.mark_changed(id);
    Ok(true)
}

/// Put every canvas at or beneath `id` into (or out of) list mode under the
/// owning image's key.  Returns the number of canvases rewritten.
pub fn mark_list_mode(tree: &mut PropertyTree, id: NodeId, list: bool) -> Result<usize, TreeError> {
    let key = tree.image_key(id);
    let mut changed = 0;
    for c in canvases(tree, id) {
        let already = tree.canvas(c).is_some_and(|cv| cv.is_secondary() == list);
        if already {
            continue;
        }
        let enc = list.then_some(&key);
        if convert_canvas(tree, c, Some(&key), enc, !list)? {
            changed += 1;
        }
    }
    Ok(changed)
}

/// Set an image's list mode explicitly: its string mode and its canvases.
pub fn set_list_mode(tree: &mut PropertyTree, image: NodeId, list: bool) -> Result<usize, TreeError> {
    tree.parse_image(image)?;
    let img = tree.image_mut(image).ok_or(TreeError::Missing(image))?;
    if img.secondary != list {
        img.secondary = list;
        img.changed = true;
    }
    mark_list_mode(tree, image, list)
}

/// Re-evaluate an image against the tree's membership predicate.  Without
/// a predicate nothing happens.  Returns the resulting list mode.
pub fn mark_image_list_mode(tree: &mut PropertyTree, image: NodeId) -> Result<bool, TreeError> {
    let Some(membership) = tree.membership.clone() else {
        return Ok(tree.image(image).is_some_and(|i| i.secondary));
    };
    let list = membership.contains(&tree.archive_name, &tree.full_path(image));
    set_list_mode(tree, image, list)?;
    Ok(list)
}

/// Remove list-mode obfuscation from everything at or beneath `id`, so the
/// subtree can be exported or pasted elsewhere without its key.
pub fn strip_secondary(tree: &mut PropertyTree, id: NodeId) -> Result<usize, TreeError> {
    let mut changed = 0;
    for image in images(tree, id) {
        tree.parse_image(image)?;
        if let Some(img) = tree.image_mut(image) {
            if img.secondary {
                img.secondary = false;
                img.changed = true;
            }
        }
    }
    for c in canvases(tree, id) {
        let key = tree.image_key(c);
        if convert_canvas(tree, c, Some(&key), None, true)? {
            changed += 1;
        }
    }
    Ok(changed)
}

/// Move every image at or beneath `id` to `new_key`, re-keying list-mode
/// canvases.  Returns the number of canvases rewritten.
pub fn rekey(tree: &mut PropertyTree, id: NodeId, new_key: &WzKey) -> Result<usize, TreeError> {
    let mut changed = 0;
    for image in images(tree, id) {
        tree.parse_image(image)?;
        let old = tree.image_key(image);
        for c in canvases(tree, image) {
            let secondary = tree.canvas(c).is_some_and(|cv| cv.is_secondary());
            if secondary && convert_canvas(tree, c, Some(&old), Some(new_key), false)? {
                changed += 1;
            }
        }
        if let Some(img) = tree.image_mut(image) {
            img.key = new_key.clone();
            img.changed = true;
        }
    }
    tracing::debug!(root = %tree.full_path(id), canvases = changed, "rekeyed subtree");
    Ok(changed)
}

/// Whether `value` is a canvas stored in list mode.
pub fn is_list_canvas(value: &NodeValue) -> bool {
    matches!(value, NodeValue::Canvas(c) if c.is_secondary())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PixelFormat;
    use crate::crypto::test_support::SeededKeyStream;
    use crate::tree::{CanvasNode, DirectoryNode, ImageNode};
    use std::sync::Arc;

    fn manifest() -> ListManifest {
        ListManifest::new(["mob/0100100.img", "Map/Map/Map1/100000000.img"])
    }

    #[test]
    fn clean_names() {
        assert_eq!(clean_archive_name("Mob.wz"), "mob");
        assert_eq!(clean_archive_name("Mob_001.wz"), "mob");
        assert_eq!(clean_archive_name("C:\\Data\\Map2.wz"), "map2");
        assert_eq!(clean_archive_name("Skill_x.wz"), "skill_x");
        assert_eq!(clean_archive_name("Base"), "base");
    }

    #[test]
    fn contains_normalises_entries() {
        let m = manifest();
        assert!(m.contains("", "Mob/0100100.img"));
        assert!(m.contains("Mob.wz", "Mob.wz/0100100.img"));
        assert!(m.contains("Mob.wz", "0100100.img"));
        assert!(m.contains("Mob_002.wz", "mob_002/0100100.img"));
        assert!(!m.contains("Mob.wz", "0100101.img"));
        assert!(!m.contains("Npc.wz", "0100100.img"));
    }

    #[test]
    fn is_inside_is_a_prefix_test() {
        let m = manifest();
        assert!(m.is_inside("Mob.wz/0100100.img/stand/0"));
        assert!(!m.is_inside("Mob.wz/0100101.img"));
    }

    fn tree_with_canvas(key: &WzKey) -> (PropertyTree, NodeId, NodeId, Vec<u8>) {
        let mut t = PropertyTree::new();
        let dir = t.create("Mob.wz", NodeValue::Directory(DirectoryNode::default()));
        let img = t.add_child(dir, "0100100.img", NodeValue::Image(ImageNode::new(key.clone()))).unwrap();
        let packed: Vec<u8> = (0..64).map(|i| (i * 3) as u8).collect();
        let canvas = CanvasNode::from_packed(4, 4, PixelFormat::Argb8888, &packed, key, false).unwrap();
        let c = t.add_child(img, "0", NodeValue::Canvas(canvas)).unwrap();
        (t, img, c, packed)
    }

    #[test]
    fn list_mode_round_trip() {
        let key = WzKey::new(SeededKeyStream(3));
        let (mut t, img, c, packed) = tree_with_canvas(&key);
        let before = t.canvas(c).unwrap().compressed().unwrap().into_owned();

        assert_eq!(set_list_mode(&mut t, img, true).unwrap(), 1);
        assert!(t.canvas(c).unwrap().is_secondary());
        assert!(t.image(img).unwrap().secondary);
        assert_eq!(t.decode_canvas(c).unwrap().unwrap().to_packed(), packed);

        assert_eq!(mark_list_mode(&mut t, img, true).unwrap(), 0);

        assert_eq!(strip_secondary(&mut t, img).unwrap(), 1);
        assert_eq!(t.canvas(c).unwrap().compressed().unwrap().as_ref(), before.as_slice());
        assert!(!t.image(img).unwrap().secondary);
    }

    #[test]
    fn membership_drives_new_children() {
        let key = WzKey::new(SeededKeyStream(9));
        let (mut t, img, _, _) = tree_with_canvas(&key);
        t.membership = Some(Arc::new(manifest()));
        t.archive_name = "Mob.wz".into();
        assert!(mark_image_list_mode(&mut t, img).unwrap());

        let packed = vec![0u8; 4];
        let canvas = CanvasNode::from_packed(1, 1, PixelFormat::Argb8888, &packed, &key, false).unwrap();
        let added = t.add_child(img, "1", NodeValue::Canvas(canvas)).unwrap();
        assert!(t.canvas(added).unwrap().is_secondary());
    }

    #[test]
    fn rekey_moves_list_canvases() {
        let old = WzKey::new(SeededKeyStream(1));
        let new = WzKey::new(SeededKeyStream(2));
        let (mut t, img, c, packed) = tree_with_canvas(&old);
        set_list_mode(&mut t, img, true).unwrap();
        assert_eq!(rekey(&mut t, img, &new).unwrap(), 1);
        assert_eq!(t.image_key(c), new);
        assert_eq!(t.decode_canvas(c).unwrap().unwrap().to_packed(), packed);
    }

    #[test]
    fn plain_canvases_are_left_alone_by_rekey() {
        let old = WzKey::new(SeededKeyStream(1));
        let (mut t, img, c, _) = tree_with_canvas(&old);
        let before = t.canvas(c).unwrap().compressed().unwrap().into_owned();
        assert_eq!(rekey(&mut t, img, &WzKey::zero()).unwrap(), 0);
        assert_eq!(t.canvas(c).unwrap().compressed().unwrap().as_ref(), before.as_slice());
        assert!(!is_list_canvas(t.value(c).unwrap()));
    }
}
