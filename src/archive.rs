//! High-level [`Archive`] API: the primary embedding surface.
//!
//! ```no_run
//! use wzarchive::archive::{Archive, ArchiveOptions};
//! use wzarchive::tree::{NodeValue, ScalarValue};
//!
//! // Read
//! let mut ar = Archive::open("Mob.wz", ArchiveOptions::default())?;
//! let speed = ar.get("0100100.img/info/speed")?.expect("present");
//! println!("{:?}", ar.tree().get_int(speed));
//!
//! // Modify and write back
//! ar.tree_mut().set_value(speed, ScalarValue::Int(-20))?;
//! ar.save("Mob.new.wz")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::{version_hash, VersionHash, WzKey};
use crate::header::{Header, HeaderError};
use crate::io_stream::{BoxedReader, DecodeError, ReadSeek, SharedStream, WzWriter, TAG_INLINE_EXTENDED, TAG_OFFSET_EXTENDED};
use crate::obfuscation::{ListManifest, ListMembership};
use crate::perf;
use crate::plugin::BlockAccelerator;
use crate::tree::{DirectoryNode, EntryMeta, ImageNode, ImageSource, NodeId, NodeKind, NodeValue, PropertyTree, TreeError};

/// Directory entry tags.
mod entry_tag {
    pub const SKIP:      u8 = 1;
    pub const NAMED_AT:  u8 = 2;
    pub const DIRECTORY: u8 = 3;
    pub const IMAGE:     u8 = 4;
}

const MAX_DIRECTORY_DEPTH: usize = 64;

/// File position of the header's `data_size` field.
const DATA_SIZE_FIELD: u64 = 4;

/// Versions tried when none is given.
pub const DEFAULT_PROBE_LIMIT: u16 = i16::MAX as u16;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Version {version} does not match the file (stored {stored:#06x}, expected {expected:#06x})")]
    VersionMismatch { version: u16, stored: u16, expected: u16 },
    #[error("No version up to {0} opens this archive")]
    VersionNotFound(u16),
    #[error("Corrupt archive: {0}")]
    Corrupt(String),
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Configuration for [`Archive::open`] and [`Archive::new`].
#[derive(Clone)]
pub struct ArchiveOptions {
    /// Client version.  `None` probes versions up to `probe_limit`.
    pub version:       Option<u16>,
    pub key:           WzKey,
    pub resolve_links: bool,
    /// Load canvas payloads while parsing images.
    pub parse_eagerly: bool,
    pub accelerator:   Option<Arc<dyn BlockAccelerator>>,
    pub membership:    Option<Arc<dyn ListMembership>>,
    pub probe_limit:   u16,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            version:       None,
            key:           WzKey::zero(),
            resolve_links: true,
            parse_eagerly: false,
            accelerator:   None,
            membership:    None,
            probe_limit:   DEFAULT_PROBE_LIMIT,
        }
    }
}

impl std::fmt::Debug for ArchiveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveOptions")
            .field("version", &self.version)
            .field("resolve_links", &self.resolve_links)
            .field("parse_eagerly", &self.parse_eagerly)
            .field("accelerator", &self.accelerator.is_some())
            .field("membership", &self.membership.is_some())
            .field("probe_limit", &self.probe_limit)
            .finish()
    }
}

/// The file-configurable part of [`ArchiveOptions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    pub version:       Option<u16>,
    pub resolve_links: bool,
    pub parse_eagerly: bool,
    pub probe_limit:   Option<u16>,
    /// Lowercase `archive/path.img` entries that live in list mode.
    pub list_entries:  Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            version:       None,
            resolve_links: true,
            parse_eagerly: false,
            probe_limit:   None,
            list_entries:  Vec::new(),
        }
    }
}

impl ArchiveConfig {
    pub fn from_json(text: &str) -> Result<Self, ArchiveError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn into_options(self) -> ArchiveOptions {
        let membership: Option<Arc<dyn ListMembership>> = if self.list_entries.is_empty() {
            None
        } else {
            Some(Arc::new(ListManifest::new(self.list_entries)))
        };
        ArchiveOptions {
            version: self.version,
            resolve_links: self.resolve_links,
            parse_eagerly: self.parse_eagerly,
            probe_limit: self.probe_limit.unwrap_or(DEFAULT_PROBE_LIMIT),
            membership,
            ..ArchiveOptions::default()
        }
    }
}

// ── EntryInfo ────────────────────────────────────────────────────────────────

/// Lightweight descriptor returned by [`Archive::entries`].
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub path:      String,
    pub kind:      NodeKind,
    pub size:      u32,
    pub checksum:  i32,
    pub offset:    u32,
    pub parsed:    bool,
    pub list_mode: bool,
}

// ── Directory table decoding ─────────────────────────────────────────────────

struct RawEntry {
    name:     String,
    kind:     u8,
    meta:     EntryMeta,
    children: Vec<RawEntry>,
}

fn read_directory(r: &mut BoxedReader, offset: u64, len: u64, depth: usize) -> Result<Vec<RawEntry>, ArchiveError> {
    if depth > MAX_DIRECTORY_DEPTH {
        return Err(ArchiveError::Corrupt(format!("directories nested deeper than {MAX_DIRECTORY_DEPTH}")));
    }
    r.seek_to(offset)?;
    let count = r.read_compressed_int()?;
    if count < 0 || count as u64 > len {
        return Err(DecodeError::BadLength { length: count as i64, position: offset }.into());
    }

    let mut entries = Vec::with_capacity((count as usize).min(4096));
    for _ in 0..count {
        let tag_pos = r.position()?;
        let tag = r.read_u8()?;
        let (kind, name) = match tag {
            entry_tag::SKIP => {
                r.read_i32::<LittleEndian>()?;
                r.read_i16::<LittleEndian>()?;
                r.read_offset()?;
                continue;
            }
            entry_tag::NAMED_AT => {
                let rel = r.read_i32::<LittleEndian>()?;
                let back = r.position()?;
                r.seek_to((r.header_start as i64 + rel as i64).max(0) as u64)?;
                let kind = r.read_u8()?;
                let name = r.read_string(false)?;
                r.seek_to(back)?;
                (kind, name)
            }
            entry_tag::DIRECTORY | entry_tag::IMAGE => (tag, r.read_string(false)?),
            other => return Err(DecodeError::UnknownEntryTag { tag: other, position: tag_pos }.into()),
        };
        if kind != entry_tag::DIRECTORY && kind != entry_tag::IMAGE {
            return Err(DecodeError::UnknownEntryTag { tag: kind, position: tag_pos }.into());
        }
        let size = r.read_compressed_int()?;
        let checksum = r.read_compressed_int()?;
        let entry_offset = r.read_offset()?;
        let meta = EntryMeta { size: size as u32, checksum, offset: entry_offset };

        let end = entry_offset as u64 + if kind == entry_tag::IMAGE { meta.size as u64 } else { 0 };
        if end > len || size < 0 {
            return Err(DecodeError::OffsetOutOfBounds { offset: end, len }.into());
        }
        entries.push(RawEntry { name, kind, meta, children: Vec::new() });
    }

    for e in entries.iter_mut().filter(|e| e.kind == entry_tag::DIRECTORY) {
        e.children = read_directory(r, e.meta.offset as u64, len, depth + 1)?;
    }
    Ok(entries)
}

fn first_image(entries: &[RawEntry]) -> Option<&RawEntry> {
    entries.iter().find_map(|e| match e.kind {
        entry_tag::IMAGE => Some(e),
        _ => first_image(&e.children),
    })
}

/// Parse the root table under `vh`.  When `probing`, additionally require
/// the first image to start with a string block tag.
fn try_version(stream: &SharedStream, root: u64, vh: VersionHash, probing: bool) -> Result<Vec<RawEntry>, ArchiveError> {
    let len = stream.len()?;
    stream.with_reader(|r| {
        r.hash = vh.hash;
        let entries = read_directory(r, root, len, 0)?;
        if probing {
            if let Some(img) = first_image(&entries) {
                r.seek_to(img.meta.offset as u64)?;
                let first = r.read_u8()?;
                if first != TAG_INLINE_EXTENDED && first != TAG_OFFSET_EXTENDED {
                    return Err(ArchiveError::Corrupt(format!("image starts with {first:#04x}")));
                }
            }
        }
        Ok(entries)
    })
}

// ── Archive ──────────────────────────────────────────────────────────────────

pub struct Archive {
    tree:    PropertyTree,
    root:    NodeId,
    header:  Header,
    version: VersionHash,
    key:     WzKey,
    path:    Option<PathBuf>,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("name", &self.name())
            .field("version", &self.version.version)
            .field("path", &self.path)
            .finish()
    }
}

impl Archive {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// An empty archive named `name` (e.g. `"Mob.wz"`).
    pub fn new(name: &str, version: u16, opts: ArchiveOptions) -> Self {
        let mut tree = Self::tree_for(name, &opts);
        let root = tree.create(name, NodeValue::Directory(DirectoryNode::default()));
        Self {
            tree,
            root,
            header: Header::new(),
            version: version_hash(version),
            key: opts.key,
            path: None,
        }
    }

    pub fn open<P: AsRef<Path>>(path: P, opts: ArchiveOptions) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = BufReader::new(File::open(path)?);
        let mut archive = Self::from_reader(file, &name, opts)?;
        archive.path = Some(path.to_owned());
        Ok(archive)
    }

    /// Open an archive from any seekable source.  Images stay unparsed until
    /// first use.
    pub fn from_reader<R: ReadSeek + 'static>(mut source: R, name: &str, opts: ArchiveOptions) -> Result<Self, ArchiveError> {
        source.seek(SeekFrom::Start(0))?;
        let header = Header::read(&mut source)?;
        let stored = source.read_u16::<LittleEndian>()?;
        let root_offset = header.data_start as u64 + 2;
        let stream = SharedStream::new(source, opts.key.clone(), header.data_start, 0);

        let (vh, entries) = match opts.version {
            Some(v) => {
                let vh = version_hash(v);
                if vh.encrypted_version != stored {
                    return Err(ArchiveError::VersionMismatch {
                        version:  v,
                        stored,
                        expected: vh.encrypted_version,
                    });
                }
                (vh, try_version(&stream, root_offset, vh, false)?)
            }
            None => Self::probe(&stream, root_offset, stored, opts.probe_limit)?,
        };
        tracing::debug!(name, version = vh.version, "opened archive");

        let mut tree = Self::tree_for(name, &opts);
        let root = tree.create(name, NodeValue::Directory(DirectoryNode::default()));
        Self::build(&mut tree, root, entries, &stream, &opts.key);

        Ok(Self { tree, root, header, version: vh, key: opts.key, path: None })
    }

    fn probe(stream: &SharedStream, root: u64, stored: u16, limit: u16) -> Result<(VersionHash, Vec<RawEntry>), ArchiveError> {
        for v in 0..=limit {
            let vh = version_hash(v);
            if vh.encrypted_version != stored {
                continue;
            }
            match try_version(stream, root, vh, true) {
                Ok(entries) => return Ok((vh, entries)),
                Err(e) => tracing::debug!(version = v, error = %e, "version rejected"),
            }
        }
        Err(ArchiveError::VersionNotFound(limit))
    }

    fn tree_for(name: &str, opts: &ArchiveOptions) -> PropertyTree {
        let mut tree = PropertyTree::new();
        tree.resolve_links = opts.resolve_links;
        tree.parse_eagerly = opts.parse_eagerly;
        tree.accelerator = opts.accelerator.clone();
        tree.membership = opts.membership.clone();
        tree.archive_name = name.to_owned();
        tree
    }

    fn build(tree: &mut PropertyTree, parent: NodeId, entries: Vec<RawEntry>, stream: &SharedStream, key: &WzKey) {
        for e in entries {
            if e.kind == entry_tag::DIRECTORY {
                let id = tree.create(e.name, NodeValue::Directory(DirectoryNode { meta: e.meta }));
                tree.push_child(parent, id);
                Self::build(tree, id, e.children, stream, key);
            } else {
                let source = ImageSource {
                    stream: stream.clone(),
                    offset: e.meta.offset as u64,
                    size:   e.meta.size,
                };
                let id = tree.create(e.name, NodeValue::Image(ImageNode::lazy(key.clone(), source, e.meta)));
                tree.push_child(parent, id);
                let list = tree
                    .membership
                    .as_ref()
                    .is_some_and(|m| m.contains(&tree.archive_name, &tree.full_path(id)));
                if let Some(img) = tree.image_mut(id) {
                    img.secondary = list;
                }
            }
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn tree(&self) -> &PropertyTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut PropertyTree {
        &mut self.tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn name(&self) -> &str {
        self.tree.name(self.root).unwrap_or_default()
    }

    pub fn version(&self) -> u16 {
        self.version.version
    }

    pub fn version_hash(&self) -> VersionHash {
        self.version
    }

    /// Change the version written by the next save.
    pub fn set_version(&mut self, version: u16) {
        self.version = version_hash(version);
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn key(&self) -> &WzKey {
        &self.key
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up `path` below the root, parsing images on the way.
    pub fn get(&mut self, path: &str) -> Result<Option<NodeId>, ArchiveError> {
        Ok(self.tree.get_from_path_mut(self.root, path)?)
    }

    /// Directories and images, pre-order, without parsing anything.
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.tree
            .walk(self.root)
            .into_iter()
            .skip(1)
            .filter_map(|id| {
                let (meta, parsed, list_mode) = match self.tree.value(id)? {
                    NodeValue::Directory(d) => (d.meta, true, false),
                    NodeValue::Image(i) => (i.meta, i.parsed, i.secondary),
                    _ => return None,
                };
                Some(EntryInfo {
                    path: self.tree.full_path(id),
                    kind: self.tree.kind(id)?,
                    size: meta.size,
                    checksum: meta.checksum,
                    offset: meta.offset,
                    parsed,
                    list_mode,
                })
            })
            .collect()
    }

    /// Every image node, pre-order.
    pub fn images(&self) -> Vec<NodeId> {
        self.tree
            .walk(self.root)
            .into_iter()
            .filter(|&id| self.tree.kind(id) == Some(NodeKind::Image))
            .collect()
    }

    /// Parse every image.  Returns how many were parsed by this call.
    pub fn parse_all(&mut self) -> Result<usize, ArchiveError> {
        let images = self.images();
        Ok(perf::load_images_parallel(&mut self.tree, &images)?)
    }

    // ── Building ─────────────────────────────────────────────────────────────

    pub fn add_directory(&mut self, parent: NodeId, name: &str) -> Result<NodeId, ArchiveError> {
        if !matches!(self.tree.kind(parent), Some(NodeKind::Directory)) {
            return Err(TreeError::NotContainer(self.tree.kind(parent).unwrap_or(NodeKind::Null)).into());
        }
        Ok(self.tree.add_child(parent, name, NodeValue::Directory(DirectoryNode::default()))?)
    }

    /// Add an empty image under `parent`, in list mode when the membership
    /// predicate says so.
    pub fn add_image(&mut self, parent: NodeId, name: &str) -> Result<NodeId, ArchiveError> {
        if !matches!(self.tree.kind(parent), Some(NodeKind::Directory)) {
            return Err(TreeError::NotContainer(self.tree.kind(parent).unwrap_or(NodeKind::Null)).into());
        }
        let id = self.tree.add_child(parent, name, NodeValue::Image(ImageNode::new(self.key.clone())))?;
        crate::obfuscation::mark_image_list_mode(&mut self.tree, id)?;
        Ok(id)
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Write the archive to `path`.  The file is written beside the target
    /// and renamed into place, so saving over the opened file is safe.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ArchiveError> {
        let path = path.as_ref();
        let tmp = path.with_extension("wz.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            self.write_to(&mut out)?;
            out.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "saved archive");
        Ok(())
    }

    /// Serialize: header, version, directory tables (pre-order), image blobs.
    /// `out` must be positioned at its start; offsets are absolute.
    pub fn write_to<W: Write + Seek>(&self, out: W) -> Result<(), ArchiveError> {
        let images = self.images();
        let blobs: HashMap<NodeId, Vec<u8>> = images
            .iter()
            .copied()
            .zip(perf::serialize_images_parallel(&self.tree, &images)?)
            .collect();

        let mut header = self.header.clone();
        header.data_size = 0;
        let mut w = WzWriter::new(out, self.key.clone(), header.data_start, self.version.hash);
        header.write(&mut w)?;
        w.write_u16::<LittleEndian>(self.version.encrypted_version)?;

        let mut pending = Vec::new();
        self.write_directory(self.root, &mut w, &blobs, &mut pending)?;

        for (field, id) in pending {
            let pos = w.position()?;
            w.patch_offset(field, pos as u32)?;
            if let Some(blob) = blobs.get(&id) {
                w.write_all(blob)?;
            }
        }

        let end = w.position()?;
        w.seek_to(DATA_SIZE_FIELD)?;
        w.write_u64::<LittleEndian>(end - header.data_start as u64)?;
        w.seek_to(end)?;
        w.flush()?;
        Ok(())
    }

    fn write_directory<W: Write + Seek>(
        &self,
        dir:     NodeId,
        w:       &mut WzWriter<W>,
        blobs:   &HashMap<NodeId, Vec<u8>>,
        pending: &mut Vec<(u64, NodeId)>,
    ) -> Result<(), ArchiveError> {
        let children = self.tree.children(dir);
        w.write_compressed_int(children.len() as i32)?;

        let mut subdirs = Vec::new();
        for &c in children {
            let node = self.tree.node(c).ok_or(TreeError::Missing(c))?;
            let (tag, size, checksum) = match node.kind() {
                NodeKind::Directory => (entry_tag::DIRECTORY, 0, 0),
                NodeKind::Image => {
                    let blob = blobs.get(&c).map(Vec::as_slice).unwrap_or_default();
                    (entry_tag::IMAGE, blob.len() as i32, checksum(blob))
                }
                other => return Err(TreeError::NotSerializable(other).into()),
            };
            w.write_object_value(&node.name, tag, false)?;
            w.write_compressed_int(size)?;
            w.write_compressed_int(checksum)?;
            let field = w.position()?;
            w.write_u32::<LittleEndian>(0)?;
            if tag == entry_tag::DIRECTORY {
                subdirs.push((field, c));
            } else {
                pending.push((field, c));
            }
        }

        for (field, sub) in subdirs {
            let pos = w.position()?;
            w.patch_offset(field, pos as u32)?;
            self.write_directory(sub, w, blobs, pending)?;
        }
        Ok(())
    }

    /// Serialize into memory.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut cur = Cursor::new(Vec::new());
        self.write_to(&mut cur)?;
        Ok(cur.into_inner())
    }
}

/// Wrapping sum of every byte.
pub fn checksum(bytes: &[u8]) -> i32 {
    bytes.iter().fold(0i32, |acc, &b| acc.wrapping_add(b as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{LinkNode, ScalarValue};

    const VERSION: u16 = 83;

    fn sample() -> Archive {
        let mut ar = Archive::new("Mob.wz", VERSION, ArchiveOptions::default());
        let root = ar.root();
        let img = ar.add_image(root, "0100100.img").unwrap();
        let t = ar.tree_mut();
        let info = t.add_child(img, "info", NodeValue::Property).unwrap();
        t.add_child(info, "speed", NodeValue::Int(-30)).unwrap();
        t.add_child(info, "bodyAttack", NodeValue::Short(1)).unwrap();
        t.add_child(img, "alias", NodeValue::Link(LinkNode::new("info/speed"))).unwrap();

        let sub = ar.add_directory(root, "Boss").unwrap();
        let boss = ar.add_image(sub, "8800000.img").unwrap();
        ar.tree_mut().add_child(boss, "hp", NodeValue::Long(1 << 40)).unwrap();
        ar
    }

    fn reopen(bytes: Vec<u8>, version: Option<u16>) -> Archive {
        let opts = ArchiveOptions { version, ..ArchiveOptions::default() };
        Archive::from_reader(Cursor::new(bytes), "Mob.wz", opts).unwrap()
    }

    #[test]
    fn save_and_reopen_with_explicit_version() {
        let bytes = sample().to_bytes().unwrap();
        let mut ar = reopen(bytes, Some(VERSION));
        assert_eq!(ar.version(), VERSION);
        let speed = ar.get("0100100.img/info/speed").unwrap().unwrap();
        assert_eq!(ar.tree().get_int(speed), Some(-30));
        let alias = ar.get("0100100.img/alias").unwrap().unwrap();
        assert_eq!(ar.tree().get_int(alias), Some(-30));
        let hp = ar.get("Boss/8800000.img/hp").unwrap().unwrap();
        assert_eq!(ar.tree().get_long(hp), Some(1 << 40));
    }

    #[test]
    fn version_is_probed() {
        let bytes = sample().to_bytes().unwrap();
        let mut ar = reopen(bytes, None);
        assert_eq!(ar.version_hash().encrypted_version, version_hash(VERSION).encrypted_version);
        assert!(ar.get("Boss/8800000.img/hp").unwrap().is_some());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let bytes = sample().to_bytes().unwrap();
        let other = (0..u16::MAX)
            .find(|&v| version_hash(v).encrypted_version != version_hash(VERSION).encrypted_version)
            .unwrap();
        let opts = ArchiveOptions { version: Some(other), ..ArchiveOptions::default() };
        assert!(matches!(
            Archive::from_reader(Cursor::new(bytes), "Mob.wz", opts),
            Err(ArchiveError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn entries_do_not_parse_images() {
        let ar = reopen(sample().to_bytes().unwrap(), Some(VERSION));
        let entries = ar.entries();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["Mob.wz/0100100.img", "Mob.wz/Boss", "Mob.wz/Boss/8800000.img"]);
        assert!(entries.iter().all(|e| e.parsed || e.kind == NodeKind::Image));
        assert!(!entries[0].parsed);
        assert!(entries[0].size > 0);
    }

    #[test]
    fn untouched_archive_resaves_identically() {
        let first = sample().to_bytes().unwrap();
        let ar = reopen(first.clone(), Some(VERSION));
        assert_eq!(ar.to_bytes().unwrap(), first);
    }

    #[test]
    fn edits_survive_a_resave() {
        let mut ar = reopen(sample().to_bytes().unwrap(), Some(VERSION));
        let speed = ar.get("0100100.img/info/speed").unwrap().unwrap();
        ar.tree_mut().set_value(speed, ScalarValue::Int(45)).unwrap();
        let mut again = reopen(ar.to_bytes().unwrap(), Some(VERSION));
        let speed = again.get("0100100.img/info/speed").unwrap().unwrap();
        assert_eq!(again.tree().get_int(speed), Some(45));
        let hp = again.get("Boss/8800000.img/hp").unwrap().unwrap();
        assert_eq!(again.tree().get_long(hp), Some(1 << 40));
    }

    #[test]
    fn repeated_image_names_are_back_referenced() {
        let mut ar = Archive::new("Map.wz", VERSION, ArchiveOptions::default());
        let root = ar.root();
        for d in ["Map0", "Map1", "Map2"] {
            let dir = ar.add_directory(root, d).unwrap();
            ar.add_image(dir, "100000000.img").unwrap();
        }
        let bytes = ar.to_bytes().unwrap();
        let back = Archive::from_reader(Cursor::new(bytes), "Map.wz", ArchiveOptions { version: Some(VERSION), ..Default::default() }).unwrap();
        let names: Vec<_> = back.entries().into_iter().map(|e| e.path).collect();
        assert_eq!(names.iter().filter(|p| p.ends_with("/100000000.img")).count(), 3);
    }

    #[test]
    fn config_builds_options() {
        let cfg = ArchiveConfig::from_json(r#"{ "version": 95, "list_entries": ["mob/0100100.img"] }"#).unwrap();
        assert!(cfg.resolve_links);
        let opts = cfg.into_options();
        assert_eq!(opts.version, Some(95));
        assert!(opts.membership.is_some_and(|m| m.contains("Mob.wz", "0100100.img")));
        assert!(ArchiveConfig::from_json(r#"{ "bogus": 1 }"#).is_err());
    }

    #[test]
    fn checksum_wraps() {
        assert_eq!(checksum(&[0xFF; 4]), 1020);
        assert_eq!(checksum(&[]), 0);
    }
}
