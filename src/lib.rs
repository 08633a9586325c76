pub mod archive;
pub mod block;
pub mod codec;
pub mod crypto;
pub mod header;
pub mod io_stream;
pub mod obfuscation;
pub mod perf;
pub mod plugin;
pub mod scan;
pub mod tree;

pub use archive::{Archive, ArchiveConfig, ArchiveError, ArchiveOptions, EntryInfo};
pub use codec::{get_codec, PixelFormat, Raster};
pub use crypto::{KeyStream, WzKey};
pub use obfuscation::{ListManifest, ListMembership};
pub use tree::{NodeId, NodeKind, NodeValue, PropertyTree, ScalarValue};
