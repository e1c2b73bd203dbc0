//! 远程目录结构的内存缓存，纯数据，不做任何 I/O

mod node;
mod persist;
mod tree;

pub use node::{Directory, Node, NodeId, NodeInfo, NodeKind};
pub use persist::{CacheFile, CACHE_VERSION};
pub use tree::{VfsEvent, VfsTree, WatchKind};

pub(crate) use tree::split_path;
