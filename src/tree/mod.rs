//! Property tree: an arena of named, typed nodes.
//!
//! # Ownership
//! Nodes live in a [`PropertyTree`] and are addressed by [`NodeId`].  A node
//! owns its children through the arena; its `parent` is a plain id and never
//! keeps anything alive.  Disposed slots are not reused, so a stale id
//! resolves to "missing" instead of aliasing a newer node.
//!
//! # Images
//! Image nodes start unparsed.  [`PropertyTree::parse_image`] reads the body
//! through the archive's shared stream and grafts the decoded properties in.
//! Path lookups that need to descend into an unparsed image use
//! [`PropertyTree::get_from_path_mut`].
//!
//! # Links
//! With `resolve_links` on, scalar and canvas accessors called on a link
//! forward to its target, following at most [`MAX_LINK_HOPS`] links.  With it
//! off, a link is just a string holding its path.

pub mod canvas;
pub mod link;
pub mod parse;
pub mod value;
pub mod write;

use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::codec::{CodecError, Raster};
use crate::crypto::WzKey;
use crate::io_stream::DecodeError;
use crate::obfuscation::{self, ListMembership};
use crate::plugin::BlockAccelerator;

pub use canvas::{CanvasNode, PayloadSource};
pub use link::{LinkNode, MAX_LINK_HOPS};
pub use parse::{LazyPayloads, ParsedProperty};
pub use value::{DirectoryNode, EntryMeta, ImageNode, ImageSource, NodeKind, NodeValue, ScalarValue};

// ── Ids and nodes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct Node {
    pub name:     String,
    pub parent:   Option<NodeId>,
    pub children: Vec<NodeId>,
    pub value:    NodeValue,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.value.kind()
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Node {0} does not exist")]
    Missing(NodeId),
    #[error("A {0} node cannot hold children")]
    NotContainer(NodeKind),
    #[error("A child named '{0}' already exists")]
    DuplicateName(String),
    #[error("Cannot set a value on a {0} node")]
    ValueNotSettable(NodeKind),
    #[error("Value {value:?} does not fit a {kind} node")]
    TypeMismatch { kind: NodeKind, value: ScalarValue },
    #[error("Node {0} is not a canvas")]
    NotCanvas(NodeId),
    #[error("A {0} node cannot be written inside an image")]
    NotSerializable(NodeKind),
    #[error("Convex member '{0}' is not an extended value")]
    InvalidConvexMember(String),
    #[error("Node {0} would become its own ancestor")]
    Cycle(NodeId),
    #[error("Image {0} has no backing data")]
    NoSource(NodeId),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Image parse job ──────────────────────────────────────────────────────────

/// Everything needed to parse one image without touching the tree.
#[derive(Debug, Clone)]
pub struct ImageJob {
    pub source:    ImageSource,
    pub key:       WzKey,
    pub secondary: bool,
    /// Load canvas payloads now instead of on first use.
    pub eager:     bool,
}

impl ImageJob {
    pub fn run(&self) -> Result<Vec<ParsedProperty>, DecodeError> {
        let blob = self.source.read_blob()?;
        let lazy = (!self.eager).then(|| LazyPayloads {
            stream: self.source.stream.clone(),
            origin: self.source.offset,
        });
        parse::parse_image_blob(&blob, &self.key, self.secondary, lazy.as_ref())
    }
}

// ── PropertyTree ─────────────────────────────────────────────────────────────

pub struct PropertyTree {
    nodes:             Vec<Option<Node>>,
    /// Bumped whenever a node moves, is renamed or released.
    layout:            u64,
    /// Forward accessors through links.
    pub resolve_links: bool,
    /// Load canvas payloads while parsing images.
    pub parse_eagerly: bool,
    pub accelerator:   Option<Arc<dyn BlockAccelerator>>,
    /// When set, nodes added beneath a parsed image take on its list mode.
    pub membership:    Option<Arc<dyn ListMembership>>,
    /// Archive file name handed to `membership`.
    pub archive_name:  String,
}

impl Default for PropertyTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PropertyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyTree")
            .field("nodes", &self.len())
            .field("resolve_links", &self.resolve_links)
            .field("archive_name", &self.archive_name)
            .finish()
    }
}

impl PropertyTree {
    pub fn new() -> Self {
        Self {
            nodes:         Vec::new(),
            layout:        0,
            resolve_links: true,
            parse_eagerly: false,
            accelerator:   None,
            membership:    None,
            archive_name:  String::new(),
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn get(&self, id: NodeId) -> Result<&Node, TreeError> {
        self.node(id).ok_or(TreeError::Missing(id))
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut Node, TreeError> {
        self.node_mut(id).ok_or(TreeError::Missing(id))
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.node(id).map(|n| n.name.as_str())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn kind(&self, id: NodeId) -> Option<NodeKind> {
        self.node(id).map(Node::kind)
    }

    pub fn value(&self, id: NodeId) -> Option<&NodeValue> {
        self.node(id).map(|n| &n.value)
    }

    /// Mutable access to a node's payload.  Callers that change what gets
    /// serialized must also call [`PropertyTree::mark_changed`].
    pub fn value_mut(&mut self, id: NodeId) -> Option<&mut NodeValue> {
        self.node_mut(id).map(|n| &mut n.value)
    }

    // ── Construction ─────────────────────────────────────────────────────────

    /// A new parent-less node.
    pub fn create(&mut self, name: impl Into<String>, value: NodeValue) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node {
            name: name.into(),
            parent: None,
            children: Vec::new(),
            value,
        }));
        id
    }

    /// Create a node and add it beneath `parent`.
    pub fn add_child(&mut self, parent: NodeId, name: impl Into<String>, value: NodeValue) -> Result<NodeId, TreeError> {
        let name = name.into();
        self.check_can_adopt(parent, &name)?;
        let id = self.create(name, value);
        self.push_child(parent, id);
        self.after_insert(id)?;
        Ok(id)
    }

    /// Move a parent-less node beneath `parent`.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
        let name = self.get(child)?.name.clone();
        if self.get(child)?.parent.is_some() {
            self.detach(child)?;
        }
        if self.ancestors(parent).any(|a| a == child) || parent == child {
            return Err(TreeError::Cycle(child));
        }
        self.check_can_adopt(parent, &name)?;
        self.push_child(parent, child);
        self.after_insert(child)
    }

    fn check_can_adopt(&self, parent: NodeId, name: &str) -> Result<(), TreeError> {
        let kind = self.get(parent)?.kind();
        if !kind.is_container() {
            return Err(TreeError::NotContainer(kind));
        }
        if self.child(parent, name).is_some() {
            return Err(TreeError::DuplicateName(name.to_owned()));
        }
        Ok(())
    }

    /// Append without checks or change tracking; used while loading.
    pub(crate) fn push_child(&mut self, parent: NodeId, child: NodeId) {
        self.layout += 1;
        if let Some(c) = self.node_mut(child) {
            c.parent = Some(parent);
        }
        if let Some(p) = self.node_mut(parent) {
            p.children.push(child);
        }
    }

    fn after_insert(&mut self, id: NodeId) -> Result<(), TreeError> {
        self.mark_changed(id);
        let Some(image) = self.owning_image(id) else { return Ok(()) };
        let Some(membership) = self.membership.clone() else { return Ok(()) };
        if !self.is_parsed(image) {
            return Ok(());
        }
        let list = membership.contains(&self.archive_name, &self.full_path(image));
        obfuscation::mark_list_mode(self, id, list)?;
        Ok(())
    }

    /// Unlink `id` from its parent without disposing it.
    pub fn detach(&mut self, id: NodeId) -> Result<(), TreeError> {
        let parent = self.get(id)?.parent;
        self.layout += 1;
        if let Some(p) = parent {
            self.mark_changed(p);
            if let Some(pn) = self.node_mut(p) {
                pn.children.retain(|&c| c != id);
            }
        }
        self.get_mut(id)?.parent = None;
        Ok(())
    }

    /// Detach and return the child called `name`.
    pub fn remove_child(&mut self, parent: NodeId, name: &str) -> Result<Option<NodeId>, TreeError> {
        match self.child(parent, name) {
            Some(id) => {
                self.detach(id)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Dispose every child of `id`.
    pub fn clear_children(&mut self, id: NodeId) -> Result<(), TreeError> {
        let children = std::mem::take(&mut self.get_mut(id)?.children);
        self.layout += 1;
        for c in children {
            if let Some(n) = self.node_mut(c) {
                n.parent = None;
            }
            self.dispose(c);
        }
        self.mark_changed(id);
        Ok(())
    }

    /// Release `id` and its subtree.  Later lookups of any of their ids fail.
    /// Disposing a missing node does nothing.
    pub fn dispose(&mut self, id: NodeId) {
        if !self.contains(id) {
            return;
        }
        let _ = self.detach(id);
        for n in self.walk(id) {
            if let Some(mut node) = self.nodes.get_mut(n.index()).and_then(Option::take) {
                if let NodeValue::Canvas(c) = &mut node.value {
                    c.release();
                }
            }
        }
    }

    pub fn rename(&mut self, id: NodeId, name: impl Into<String>) -> Result<(), TreeError> {
        let name = name.into();
        if let Some(p) = self.parent(id) {
            if self.child(p, &name).is_some_and(|c| c != id) {
                return Err(TreeError::DuplicateName(name));
            }
        }
        self.get_mut(id)?.name = name;
        self.layout += 1;
        self.mark_changed(id);
        Ok(())
    }

    // ── Navigation ───────────────────────────────────────────────────────────

    /// Child of `id` called `name`, ignoring ASCII case.
    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|&c| self.name(c).is_some_and(|n| n.eq_ignore_ascii_case(name)))
    }

    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |&p| self.parent(p))
    }

    /// Follow a `/`-separated path from `id`.  `..` steps to the parent.
    /// Does not parse images; see [`PropertyTree::get_from_path_mut`].
    pub fn get_from_path(&self, id: NodeId, path: &str) -> Option<NodeId> {
        let mut cur = id;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            cur = match seg {
                ".." => self.parent(cur)?,
                "." => cur,
                _ => self.child(cur, seg)?,
            };
        }
        Some(cur)
    }

    /// Like [`PropertyTree::get_from_path`], parsing images on the way down.
    pub fn get_from_path_mut(&mut self, id: NodeId, path: &str) -> Result<Option<NodeId>, TreeError> {
        let mut cur = id;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            let next = match seg {
                ".." => self.parent(cur),
                "." => Some(cur),
                _ => {
                    self.ensure_parsed(cur)?;
                    self.child(cur, seg)
                }
            };
            match next {
                Some(n) => cur = n,
                None => return Ok(None),
            }
        }
        self.ensure_parsed(cur)?;
        Ok(Some(cur))
    }

    /// Names from the root down to `id`, joined by `/`.
    pub fn full_path(&self, id: NodeId) -> String {
        let mut parts: Vec<&str> = self.ancestors(id).filter_map(|a| self.name(a)).collect();
        parts.reverse();
        if let Some(n) = self.name(id) {
            parts.push(n);
        }
        parts.join("/")
    }

    /// `id` itself when it is an image, else its nearest image ancestor.
    pub fn owning_image(&self, id: NodeId) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|&n| self.kind(n) == Some(NodeKind::Image))
    }

    /// Key in effect for `id`: its image's key, or the zero key.
    pub fn image_key(&self, id: NodeId) -> WzKey {
        match self.owning_image(id).and_then(|i| self.value(i)) {
            Some(NodeValue::Image(img)) => img.key.clone(),
            _ => WzKey::zero(),
        }
    }

    /// Pre-order list of `id` and its descendants.
    pub fn walk(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if !self.contains(n) {
                continue;
            }
            out.push(n);
            stack.extend(self.children(n).iter().rev().copied());
        }
        out
    }

    // ── Images ───────────────────────────────────────────────────────────────

    pub fn image(&self, id: NodeId) -> Option<&ImageNode> {
        match self.value(id) {
            Some(NodeValue::Image(img)) => Some(img),
            _ => None,
        }
    }

    pub fn image_mut(&mut self, id: NodeId) -> Option<&mut ImageNode> {
        match self.value_mut(id) {
            Some(NodeValue::Image(img)) => Some(img),
            _ => None,
        }
    }

    /// `false` only for images whose body has not been read yet.
    pub fn is_parsed(&self, id: NodeId) -> bool {
        self.image(id).map_or(true, |img| img.parsed)
    }

    /// Flag the image owning `id` for re-serialization.
    pub fn mark_changed(&mut self, id: NodeId) {
        if let Some(image) = self.owning_image(id) {
            if let Some(img) = self.image_mut(image) {
                img.changed = true;
            }
        }
    }

    /// The parse work for an unparsed image, or `None` if nothing is pending.
    pub fn image_job(&self, id: NodeId) -> Result<Option<ImageJob>, TreeError> {
        let node = self.get(id)?;
        let NodeValue::Image(img) = &node.value else { return Ok(None) };
        if img.parsed {
            return Ok(None);
        }
        let source = img.source.clone().ok_or(TreeError::NoSource(id))?;
        Ok(Some(ImageJob {
            source,
            key:       img.key.clone(),
            secondary: img.secondary,
            eager:     self.parse_eagerly,
        }))
    }

    /// Attach decoded properties beneath `image` and mark it parsed.
    pub fn graft_parsed(&mut self, image: NodeId, props: Vec<ParsedProperty>) -> Result<(), TreeError> {
        self.get(image)?;
        for prop in props {
            self.graft(image, prop);
        }
        if let Some(img) = self.image_mut(image) {
            img.parsed = true;
        }
        Ok(())
    }

    fn graft(&mut self, parent: NodeId, prop: ParsedProperty) {
        let ParsedProperty { name, value, children } = prop;
        let id = self.create(name, value);
        self.push_child(parent, id);
        for c in children {
            self.graft(id, c);
        }
    }

    /// Read and decode an image body if it has not been yet.
    pub fn parse_image(&mut self, id: NodeId) -> Result<(), TreeError> {
        if let Some(job) = self.image_job(id)? {
            tracing::debug!(image = %self.full_path(id), offset = job.source.offset, "parsing image");
            let props = job.run()?;
            self.graft_parsed(id, props)?;
        }
        Ok(())
    }

    fn ensure_parsed(&mut self, id: NodeId) -> Result<(), TreeError> {
        if !self.is_parsed(id) {
            self.parse_image(id)?;
        }
        Ok(())
    }

    // ── Values ───────────────────────────────────────────────────────────────

    /// Assign a scalar, converting to the node's own type.
    pub fn set_value(&mut self, id: NodeId, value: ScalarValue) -> Result<(), TreeError> {
        let node = self.get_mut(id)?;
        let kind = node.kind();
        if kind.is_container()
            || matches!(kind, NodeKind::Vector | NodeKind::Null | NodeKind::Opaque)
        {
            return Err(TreeError::ValueNotSettable(kind));
        }
        if !node.value.assign(&value) {
            return Err(TreeError::TypeMismatch { kind, value });
        }
        self.mark_changed(id);
        Ok(())
    }

    /// Independent copy of `id`'s subtree, parent-less.  Images inside the
    /// subtree are parsed and canvas payloads loaded first.
    pub fn deep_clone(&mut self, id: NodeId) -> Result<NodeId, TreeError> {
        self.get(id)?;
        for n in self.walk(id) {
            self.ensure_parsed(n)?;
        }
        for n in self.walk(id) {
            if let Some(NodeValue::Canvas(c)) = self.value_mut(n) {
                c.ensure_compressed()?;
            }
        }
        Ok(self.clone_subtree(id))
    }

    fn clone_subtree(&mut self, id: NodeId) -> NodeId {
        let (name, value, children) = match self.node(id) {
            Some(n) => (n.name.clone(), n.value.duplicate(), n.children.clone()),
            None => return id,
        };
        let copy = self.create(name, value);
        for c in children {
            let cc = self.clone_subtree(c);
            self.push_child(copy, cc);
        }
        copy
    }

    // ── Links ────────────────────────────────────────────────────────────────

    fn link(&self, id: NodeId) -> Option<&LinkNode> {
        match self.value(id) {
            Some(NodeValue::Link(l)) => Some(l),
            _ => None,
        }
    }

    fn step_link(&self, cur: NodeId, seg: &str) -> Option<NodeId> {
        match seg {
            ".." => self.parent(cur),
            "." => Some(cur),
            _ => self.child(cur, seg).or_else(|| {
                if self.kind(cur) == Some(NodeKind::Directory) {
                    self.child(cur, &format!("{seg}.img"))
                } else {
                    None
                }
            }),
        }
    }

    /// Target of link `id`, resolved relative to its parent and memoized
    /// until the tree's shape next changes.  Failures are logged and yield
    /// `None`.
    pub fn resolve_link(&self, id: NodeId) -> Option<NodeId> {
        let link = self.link(id)?;
        if let Some(t) = link.memo(self.layout) {
            return Some(t);
        }
        link.clear_memo();
        let mut cur = self.parent(id)?;
        for seg in link.segments() {
            match self.step_link(cur, seg) {
                Some(n) => cur = n,
                None => {
                    tracing::warn!(
                        link = %self.full_path(id),
                        target = link.path(),
                        missing = seg,
                        "link target not found"
                    );
                    return None;
                }
            }
        }
        link.remember(self.layout, cur);
        Some(cur)
    }

    /// [`PropertyTree::resolve_link`], parsing images along the path.
    pub fn resolve_link_mut(&mut self, id: NodeId) -> Result<Option<NodeId>, TreeError> {
        let Some(link) = self.link(id) else { return Ok(None) };
        let segments: Vec<String> = link.segments().map(str::to_owned).collect();
        let Some(mut cur) = self.parent(id) else { return Ok(None) };
        for seg in &segments {
            self.ensure_parsed(cur)?;
            match self.step_link(cur, seg) {
                Some(n) => cur = n,
                None => break,
            }
        }
        Ok(self.resolve_link(id))
    }

    /// Follow links from `id` while `resolve_links` is on.
    pub fn resolve(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = id;
        for _ in 0..=MAX_LINK_HOPS {
            match self.value(cur)? {
                NodeValue::Link(_) if self.resolve_links => cur = self.resolve_link(cur)?,
                _ => return Some(cur),
            }
        }
        tracing::warn!(link = %self.full_path(id), "link chain exceeds {} hops", MAX_LINK_HOPS);
        None
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn get_long(&self, id: NodeId) -> Option<i64> {
        match self.value(self.resolve(id)?)? {
            NodeValue::Short(v)  => Some(*v as i64),
            NodeValue::Int(v)    => Some(*v as i64),
            NodeValue::Long(v)   => Some(*v),
            NodeValue::Float(v)  => Some(*v as i64),
            NodeValue::Double(v) => Some(*v as i64),
            NodeValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_int(&self, id: NodeId) -> Option<i32> {
        self.get_long(id).map(|v| v as i32)
    }

    pub fn get_short(&self, id: NodeId) -> Option<i16> {
        self.get_long(id).map(|v| v as i16)
    }

    pub fn get_double(&self, id: NodeId) -> Option<f64> {
        match self.value(self.resolve(id)?)? {
            NodeValue::Short(v)  => Some(*v as f64),
            NodeValue::Int(v)    => Some(*v as f64),
            NodeValue::Long(v)   => Some(*v as f64),
            NodeValue::Float(v)  => Some(*v as f64),
            NodeValue::Double(v) => Some(*v),
            NodeValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_float(&self, id: NodeId) -> Option<f32> {
        self.get_double(id).map(|v| v as f32)
    }

    /// Text of a string node, number formatted as text, or the path of a
    /// link when link resolution is off.
    pub fn get_string(&self, id: NodeId) -> Option<String> {
        match self.value(self.resolve(id)?)? {
            NodeValue::String(s) => Some(s.clone()),
            NodeValue::Link(l)   => Some(l.path().to_owned()),
            NodeValue::Short(v)  => Some(v.to_string()),
            NodeValue::Int(v)    => Some(v.to_string()),
            NodeValue::Long(v)   => Some(v.to_string()),
            NodeValue::Float(v)  => Some(v.to_string()),
            NodeValue::Double(v) => Some(v.to_string()),
            _ => None,
        }
    }

    pub fn get_vector(&self, id: NodeId) -> Option<(i32, i32)> {
        match self.value(self.resolve(id)?)? {
            NodeValue::Vector { x, y } => Some((*x, *y)),
            _ => None,
        }
    }

    pub fn canvas(&self, id: NodeId) -> Option<&CanvasNode> {
        match self.value(self.resolve(id)?)? {
            NodeValue::Canvas(c) => Some(c),
            _ => None,
        }
    }

    /// Canvas at `id` itself (links are not followed for mutation).
    pub fn canvas_mut(&mut self, id: NodeId) -> Option<&mut CanvasNode> {
        match self.value_mut(id)? {
            NodeValue::Canvas(c) => Some(c),
            _ => None,
        }
    }

    /// Decode the canvas at (or linked from) `id` without caching.
    pub fn decode_canvas(&self, id: NodeId) -> Result<Option<Raster>, TreeError> {
        let target = self.resolve(id).ok_or(TreeError::Missing(id))?;
        let canvas = self.canvas(target).ok_or(TreeError::NotCanvas(target))?;
        Ok(canvas.decode(&self.image_key(target), self.accelerator.clone())?)
    }

    /// Decode the canvas at (or linked from) `id` and cache the raster.
    pub fn load_canvas(&mut self, id: NodeId) -> Result<Option<&Raster>, TreeError> {
        let target = self.resolve(id).ok_or(TreeError::Missing(id))?;
        let key = self.image_key(target);
        let accelerator = self.accelerator.clone();
        let canvas = self.canvas_mut(target).ok_or(TreeError::NotCanvas(target))?;
        Ok(canvas.decode_retained(&key, accelerator)?)
    }

    /// Replace the pixels of the canvas at `id`, keeping its format.
    pub fn set_canvas_raster(&mut self, id: NodeId, raster: Raster) -> Result<(), TreeError> {
        let key = self.image_key(id);
        let accelerator = self.accelerator.clone();
        let canvas = self.canvas_mut(id).ok_or(TreeError::NotCanvas(id))?;
        canvas.set_raster(raster, &key, accelerator)?;
        self.mark_changed(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PixelFormat;

    fn sample() -> (PropertyTree, NodeId, NodeId) {
        let mut t = PropertyTree::new();
        let dir = t.create("Mob.wz", NodeValue::Directory(DirectoryNode::default()));
        let img = t.add_child(dir, "0100100.img", NodeValue::Image(ImageNode::new(WzKey::zero()))).unwrap();
        let info = t.add_child(img, "info", NodeValue::Property).unwrap();
        t.add_child(info, "speed", NodeValue::Int(-30)).unwrap();
        t.add_child(info, "name", NodeValue::String("Snail".into())).unwrap();
        t.add_child(info, "origin", NodeValue::Vector { x: 3, y: -4 }).unwrap();
        (t, dir, img)
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let (t, _, img) = sample();
        let info = t.child(img, "INFO").unwrap();
        assert_eq!(t.get_int(t.child(info, "Speed").unwrap()), Some(-30));
    }

    #[test]
    fn path_lookup_with_parent_steps() {
        let (t, dir, img) = sample();
        let speed = t.get_from_path(dir, "0100100.img/info/speed").unwrap();
        assert_eq!(t.get_from_path(speed, "../name").and_then(|n| t.get_string(n)), Some("Snail".into()));
        assert_eq!(t.get_from_path(img, "info/missing/x"), None);
        assert_eq!(t.full_path(speed), "Mob.wz/0100100.img/info/speed");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (mut t, _, img) = sample();
        assert!(matches!(
            t.add_child(img, "Info", NodeValue::Null),
            Err(TreeError::DuplicateName(_))
        ));
    }

    #[test]
    fn leaves_cannot_hold_children() {
        let (mut t, dir, _) = sample();
        let speed = t.get_from_path(dir, "0100100.img/info/speed").unwrap();
        assert!(matches!(
            t.add_child(speed, "x", NodeValue::Null),
            Err(TreeError::NotContainer(NodeKind::Int))
        ));
    }

    #[test]
    fn set_value_marks_image_changed() {
        let (mut t, dir, img) = sample();
        t.image_mut(img).unwrap().changed = false;
        let speed = t.get_from_path(dir, "0100100.img/info/speed").unwrap();
        t.set_value(speed, ScalarValue::Short(12)).unwrap();
        assert_eq!(t.get_int(speed), Some(12));
        assert!(t.image(img).unwrap().changed);
    }

    #[test]
    fn set_value_rejects_containers_and_vectors() {
        let (mut t, dir, img) = sample();
        let origin = t.get_from_path(dir, "0100100.img/info/origin").unwrap();
        assert!(matches!(
            t.set_value(origin, ScalarValue::Int(1)),
            Err(TreeError::ValueNotSettable(NodeKind::Vector))
        ));
        assert!(matches!(
            t.set_value(img, ScalarValue::Int(1)),
            Err(TreeError::ValueNotSettable(NodeKind::Image))
        ));
    }

    #[test]
    fn dispose_fails_fast_afterwards() {
        let (mut t, _, img) = sample();
        let info = t.child(img, "info").unwrap();
        let speed = t.child(info, "speed").unwrap();
        t.dispose(info);
        assert!(!t.contains(info));
        assert!(!t.contains(speed));
        assert!(t.child(img, "info").is_none());
        assert!(matches!(t.set_value(speed, ScalarValue::Int(1)), Err(TreeError::Missing(_))));
        t.dispose(info);
    }

    #[test]
    fn deep_clone_is_independent() {
        let (mut t, _, img) = sample();
        let info = t.child(img, "info").unwrap();
        let copy = t.deep_clone(info).unwrap();
        assert_eq!(t.parent(copy), None);
        let copied_speed = t.child(copy, "speed").unwrap();
        t.set_value(copied_speed, ScalarValue::Int(99)).unwrap();
        assert_eq!(t.get_int(t.child(info, "speed").unwrap()), Some(-30));
        assert_eq!(t.get_int(copied_speed), Some(99));
        assert_eq!(t.get_vector(t.child(copy, "origin").unwrap()), Some((3, -4)));
    }

    #[test]
    fn deep_clone_copies_canvas_payload() {
        let (mut t, _, img) = sample();
        let canvas = CanvasNode::from_packed(1, 1, PixelFormat::Argb8888, &[1, 2, 3, 4], &WzKey::zero(), false).unwrap();
        let c = t.add_child(img, "icon", NodeValue::Canvas(canvas)).unwrap();
        let copy = t.deep_clone(c).unwrap();
        t.dispose(c);
        let raster = t.decode_canvas(copy).unwrap().unwrap();
        assert_eq!(raster.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn link_resolves_sibling_added_later() {
        let (mut t, _, img) = sample();
        let info = t.child(img, "info").unwrap();
        let link = t.add_child(info, "alias", NodeValue::Link(LinkNode::new("../stand"))).unwrap();
        assert_eq!(t.resolve_link(link), None);
        let stand = t.add_child(img, "stand", NodeValue::Int(7)).unwrap();
        assert_eq!(t.resolve_link(link), Some(stand));
        assert_eq!(t.get_int(link), Some(7));
    }

    #[test]
    fn link_forwarding_can_be_disabled() {
        let (mut t, _, img) = sample();
        let link = t.add_child(img, "speedLink", NodeValue::Link(LinkNode::new("info/speed"))).unwrap();
        assert_eq!(t.get_int(link), Some(-30));
        t.resolve_links = false;
        assert_eq!(t.get_int(link), None);
        assert_eq!(t.get_string(link), Some("info/speed".into()));
    }

    #[test]
    fn link_into_directory_appends_img() {
        let (mut t, _, img) = sample();
        let link = t.add_child(img, "other", NodeValue::Link(LinkNode::new("../0100100/info/name"))).unwrap();
        assert_eq!(t.get_string(link), Some("Snail".into()));
    }

    #[test]
    fn link_cycles_are_bounded() {
        let (mut t, _, img) = sample();
        let a = t.add_child(img, "a", NodeValue::Link(LinkNode::new("b"))).unwrap();
        t.add_child(img, "b", NodeValue::Link(LinkNode::new("a"))).unwrap();
        assert_eq!(t.get_int(a), None);
    }

    #[test]
    fn memo_is_dropped_when_target_is_disposed() {
        let (mut t, _, img) = sample();
        let link = t.add_child(img, "n", NodeValue::Link(LinkNode::new("info/name"))).unwrap();
        assert!(t.resolve_link(link).is_some());
        let info = t.child(img, "info").unwrap();
        let name = t.child(info, "name").unwrap();
        t.dispose(name);
        assert_eq!(t.resolve_link(link), None);
    }

    #[test]
    fn link_follows_a_replaced_target() {
        let (mut t, _, img) = sample();
        let link = t.add_child(img, "n", NodeValue::Link(LinkNode::new("info/name"))).unwrap();
        let info = t.child(img, "info").unwrap();
        let old = t.child(info, "name").unwrap();
        assert_eq!(t.resolve_link(link), Some(old));

        t.detach(old).unwrap();
        assert_eq!(t.resolve_link(link), None);
        let new = t.add_child(info, "name", NodeValue::String("Blue Cap".into())).unwrap();
        assert_eq!(t.resolve_link(link), Some(new));
        assert_eq!(t.get_string(link), Some("Blue Cap".into()));

        t.rename(new, "label").unwrap();
        assert_eq!(t.resolve_link(link), None);
    }

    #[test]
    fn link_moved_elsewhere_resolves_from_its_new_parent() {
        let (mut t, _, img) = sample();
        let info = t.child(img, "info").unwrap();
        let name = t.child(info, "name").unwrap();
        let link = t.add_child(img, "n", NodeValue::Link(LinkNode::new("info/name"))).unwrap();
        assert_eq!(t.resolve_link(link), Some(name));

        let other = t.add_child(info, "sub", NodeValue::Property).unwrap();
        t.attach(other, link).unwrap();
        assert_eq!(t.resolve_link(link), None);
    }

    #[test]
    fn attach_rejects_cycles() {
        let (mut t, _, img) = sample();
        let info = t.child(img, "info").unwrap();
        let sub = t.add_child(info, "sub", NodeValue::Property).unwrap();
        assert!(matches!(t.attach(sub, info), Err(TreeError::Cycle(_))));
    }
}
