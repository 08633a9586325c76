use parking_lot::Mutex;

use super::NodeId;

/// Maximum number of links followed when forwarding an accessor.
pub const MAX_LINK_HOPS: usize = 16;

/// A relative-path indirection (`UOL`).  `..` steps to the parent.
#[derive(Debug)]
pub struct LinkNode {
    path: String,
    /// Last target, stamped with the tree layout it was resolved in.
    memo: Mutex<Option<(u64, NodeId)>>,
}

impl LinkNode {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), memo: Mutex::new(None) }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: String) {
        self.path = path;
        self.clear_memo();
    }

    /// The memoized target, if it was resolved under `layout`.
    pub(crate) fn memo(&self, layout: u64) -> Option<NodeId> {
        match *self.memo.lock() {
            Some((stamp, target)) if stamp == layout => Some(target),
            _ => None,
        }
    }

    pub(crate) fn remember(&self, layout: u64, target: NodeId) {
        *self.memo.lock() = Some((layout, target));
    }

    pub(crate) fn clear_memo(&self) {
        *self.memo.lock() = None;
    }

    /// Path segments, ignoring empty ones.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }
}
