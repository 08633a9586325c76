use serde::Serialize;

use crate::crypto::WzKey;
use crate::io_stream::{DecodeError, SharedStream};

use super::canvas::CanvasNode;
use super::link::LinkNode;

/// Discriminant of a [`NodeValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    Directory,
    Image,
    Property,
    Canvas,
    Convex,
    Vector,
    Link,
    Null,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Opaque,
}

impl NodeKind {
    /// Whether nodes of this kind own named children.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            NodeKind::Directory | NodeKind::Image | NodeKind::Property | NodeKind::Canvas | NodeKind::Convex
        )
    }

    /// Whether the value is written as a length-prefixed extended body.
    pub fn is_extended(self) -> bool {
        matches!(
            self,
            NodeKind::Property
                | NodeKind::Canvas
                | NodeKind::Convex
                | NodeKind::Vector
                | NodeKind::Link
                | NodeKind::Opaque
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Directory => "directory",
            NodeKind::Image     => "image",
            NodeKind::Property  => "property",
            NodeKind::Canvas    => "canvas",
            NodeKind::Convex    => "convex",
            NodeKind::Vector    => "vector",
            NodeKind::Link      => "link",
            NodeKind::Null      => "null",
            NodeKind::Short     => "short",
            NodeKind::Int       => "int",
            NodeKind::Long      => "long",
            NodeKind::Float     => "float",
            NodeKind::Double    => "double",
            NodeKind::String    => "string",
            NodeKind::Opaque    => "opaque",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an image's body lives in the file it was opened from.
#[derive(Debug, Clone)]
pub struct ImageSource {
    pub stream: SharedStream,
    pub offset: u64,
    pub size:   u32,
}

impl ImageSource {
    /// The image's bytes exactly as stored.
    pub fn read_blob(&self) -> Result<Vec<u8>, DecodeError> {
        let len = self.stream.len()?;
        let end = self.offset + self.size as u64;
        if end > len {
            return Err(DecodeError::OffsetOutOfBounds { offset: end, len });
        }
        let size = self.size as usize;
        self.stream.read_at(self.offset, |r| r.read_bytes(size).map_err(DecodeError::from))
    }
}

/// Directory entry metadata as read from (or written to) the parent table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntryMeta {
    pub size:     u32,
    pub checksum: i32,
    pub offset:   u32,
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryNode {
    pub meta: EntryMeta,
}

#[derive(Debug, Clone)]
pub struct ImageNode {
    /// Key for secondary strings and list-mode canvases beneath this image.
    pub key:       WzKey,
    /// Strings beneath this image use secondary mode.
    pub secondary: bool,
    /// Must be re-serialized on save.
    pub changed:   bool,
    pub parsed:    bool,
    pub source:    Option<ImageSource>,
    pub meta:      EntryMeta,
}

impl ImageNode {
    /// An empty, already-parsed image.
    pub fn new(key: WzKey) -> Self {
        Self {
            key,
            secondary: false,
            changed:   true,
            parsed:    true,
            source:    None,
            meta:      EntryMeta::default(),
        }
    }

    /// An unparsed image backed by `source`.
    pub fn lazy(key: WzKey, source: ImageSource, meta: EntryMeta) -> Self {
        Self { key, secondary: false, changed: false, parsed: false, source: Some(source), meta }
    }
}

/// Value that [`super::PropertyTree::set_value`] can assign.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl ScalarValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Short(v)  => Some(*v as f64),
            ScalarValue::Int(v)    => Some(*v as f64),
            ScalarValue::Long(v)   => Some(*v as f64),
            ScalarValue::Float(v)  => Some(*v as f64),
            ScalarValue::Double(v) => Some(*v),
            ScalarValue::String(s) => s.trim().parse().ok(),
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Short(v)  => Some(*v as i64),
            ScalarValue::Int(v)    => Some(*v as i64),
            ScalarValue::Long(v)   => Some(*v),
            ScalarValue::Float(v)  => Some(*v as i64),
            ScalarValue::Double(v) => Some(*v as i64),
            ScalarValue::String(s) => s.trim().parse().ok(),
        }
    }

    fn to_text(&self) -> String {
        match self {
            ScalarValue::Short(v)  => v.to_string(),
            ScalarValue::Int(v)    => v.to_string(),
            ScalarValue::Long(v)   => v.to_string(),
            ScalarValue::Float(v)  => v.to_string(),
            ScalarValue::Double(v) => v.to_string(),
            ScalarValue::String(s) => s.clone(),
        }
    }
}

/// Payload of a tree node.
#[derive(Debug)]
pub enum NodeValue {
    Directory(DirectoryNode),
    Image(ImageNode),
    Property,
    Convex,
    Canvas(CanvasNode),
    Null,
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Vector { x: i32, y: i32 },
    Link(LinkNode),
    /// Extended value of a type this crate does not interpret.
    Opaque { type_name: String, bytes: Vec<u8> },
}

impl NodeValue {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeValue::Directory(_)  => NodeKind::Directory,
            NodeValue::Image(_)      => NodeKind::Image,
            NodeValue::Property      => NodeKind::Property,
            NodeValue::Convex        => NodeKind::Convex,
            NodeValue::Canvas(_)     => NodeKind::Canvas,
            NodeValue::Null          => NodeKind::Null,
            NodeValue::Short(_)      => NodeKind::Short,
            NodeValue::Int(_)        => NodeKind::Int,
            NodeValue::Long(_)       => NodeKind::Long,
            NodeValue::Float(_)      => NodeKind::Float,
            NodeValue::Double(_)     => NodeKind::Double,
            NodeValue::String(_)     => NodeKind::String,
            NodeValue::Vector { .. } => NodeKind::Vector,
            NodeValue::Link(_)       => NodeKind::Link,
            NodeValue::Opaque { .. } => NodeKind::Opaque,
        }
    }

    /// Assign `value`, converting to this node's own type.  Returns `false`
    /// when the value cannot be represented.
    pub(crate) fn assign(&mut self, value: &ScalarValue) -> bool {
        match self {
            NodeValue::Short(v)  => value.as_i64().map(|n| *v = n as i16).is_some(),
            NodeValue::Int(v)    => value.as_i64().map(|n| *v = n as i32).is_some(),
            NodeValue::Long(v)   => value.as_i64().map(|n| *v = n).is_some(),
            NodeValue::Float(v)  => value.as_f64().map(|n| *v = n as f32).is_some(),
            NodeValue::Double(v) => value.as_f64().map(|n| *v = n).is_some(),
            NodeValue::String(s) => {
                *s = value.to_text();
                true
            }
            NodeValue::Link(link) => {
                link.set_path(value.to_text());
                true
            }
            _ => false,
        }
    }

    /// Copy of this value with no shared mutable state.  Canvas payloads
    /// must already be materialised; see `PropertyTree::deep_clone`.
    pub(crate) fn duplicate(&self) -> NodeValue {
        match self {
            NodeValue::Directory(d) => NodeValue::Directory(d.clone()),
            NodeValue::Image(i) => NodeValue::Image(ImageNode {
                changed: true,
                ..i.clone()
            }),
            NodeValue::Property => NodeValue::Property,
            NodeValue::Convex => NodeValue::Convex,
            NodeValue::Canvas(c) => NodeValue::Canvas(c.detached_copy()),
            NodeValue::Null => NodeValue::Null,
            NodeValue::Short(v) => NodeValue::Short(*v),
            NodeValue::Int(v) => NodeValue::Int(*v),
            NodeValue::Long(v) => NodeValue::Long(*v),
            NodeValue::Float(v) => NodeValue::Float(*v),
            NodeValue::Double(v) => NodeValue::Double(*v),
            NodeValue::String(s) => NodeValue::String(s.clone()),
            NodeValue::Vector { x, y } => NodeValue::Vector { x: *x, y: *y },
            NodeValue::Link(l) => NodeValue::Link(LinkNode::new(l.path())),
            NodeValue::Opaque { type_name, bytes } => NodeValue::Opaque {
                type_name: type_name.clone(),
                bytes:     bytes.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_converts_numeric_types() {
        let mut v = NodeValue::Short(0);
        assert!(v.assign(&ScalarValue::Int(300)));
        assert!(matches!(v, NodeValue::Short(300)));

        let mut f = NodeValue::Float(0.0);
        assert!(f.assign(&ScalarValue::String("2.5".into())));
        assert!(matches!(f, NodeValue::Float(x) if x == 2.5));

        let mut i = NodeValue::Int(1);
        assert!(!i.assign(&ScalarValue::String("abc".into())));
        assert!(matches!(i, NodeValue::Int(1)));
    }

    #[test]
    fn containers_reject_assignment() {
        assert!(!NodeValue::Property.assign(&ScalarValue::Int(1)));
        assert!(!NodeValue::Vector { x: 0, y: 0 }.assign(&ScalarValue::Int(1)));
        assert!(!NodeValue::Null.assign(&ScalarValue::Int(1)));
    }

    #[test]
    fn string_accepts_numbers() {
        let mut s = NodeValue::String(String::new());
        assert!(s.assign(&ScalarValue::Long(-7)));
        assert!(matches!(s, NodeValue::String(ref t) if t == "-7"));
    }
}
