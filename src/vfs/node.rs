use crate::storage::{FileInfo, FileType};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// 节点在树内存储区中的下标
pub type NodeId = usize;

/// 目录专有数据
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub(crate) children: BTreeMap<String, NodeId>,
    /// 最近一次用远程列表刷新的时间，`None` 表示从未列出过
    pub(crate) refreshed_at: Option<Instant>,
}

impl Directory {
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    File,
    Directory(Directory),
    SymLink { target: Option<String> },
}

impl NodeKind {
    pub fn file_type(&self) -> FileType {
        match self {
            NodeKind::File => FileType::File,
            NodeKind::Directory(_) => FileType::Directory,
            NodeKind::SymLink { .. } => FileType::SymLink,
        }
    }
}

/// 远程文件树中的一个节点
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub(crate) parent: Option<NodeId>,
    pub kind: NodeKind,
    pub size: u64,
    /// 远程报告的修改时间（毫秒），0 表示尚未从列表中获得
    pub date: i64,
    /// 本地最后一次与该节点一致时的修改时间（毫秒）
    pub lmtime: i64,
    pub lmtime_with_threshold: i64,
    /// 刷新时发现远程副本被其他途径修改
    pub remote_modified: bool,
}

impl Node {
    fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            parent: None,
            kind,
            size: 0,
            date: 0,
            lmtime: 0,
            lmtime_with_threshold: 0,
            remote_modified: false,
        }
    }

    pub fn file(name: impl Into<String>, size: u64, date: i64) -> Self {
        let mut node = Self::new(name, NodeKind::File);
        node.size = size;
        node.date = date;
        node
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Directory(Directory::default()))
    }

    pub fn symlink(name: impl Into<String>, target: Option<String>) -> Self {
        Self::new(name, NodeKind::SymLink { target })
    }

    pub fn from_info(info: &FileInfo) -> Self {
        let mut node = match info.kind {
            FileType::File => Self::file(info.name.clone(), info.size, info.date),
            FileType::Directory => Self::directory(info.name.clone()),
            FileType::SymLink => Self::symlink(info.name.clone(), info.link.clone()),
        };
        node.size = info.size;
        node.date = info.date;
        node
    }

    /// 记录本地与该节点一致时的 mtime
    pub fn with_lmtime(mut self, lmtime: i64, threshold: i64) -> Self {
        self.set_lmtime(lmtime, threshold);
        self
    }

    pub fn set_lmtime(&mut self, lmtime: i64, threshold: i64) {
        self.lmtime = lmtime;
        self.lmtime_with_threshold = lmtime + threshold;
    }

    pub fn file_type(&self) -> FileType {
        self.kind.file_type()
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn as_directory(&self) -> Option<&Directory> {
        match &self.kind {
            NodeKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub(crate) fn as_directory_mut(&mut self) -> Option<&mut Directory> {
        match &mut self.kind {
            NodeKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn link_target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::SymLink { target } => target.as_deref(),
            _ => None,
        }
    }
}

/// 节点的只读快照，可以在释放树锁之后使用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub path: String,
    pub kind: FileType,
    pub size: u64,
    pub date: i64,
    pub lmtime: i64,
    pub lmtime_with_threshold: i64,
    pub remote_modified: bool,
    pub link: Option<String>,
}

impl NodeInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileType::File
    }

    /// 与本地 mtime 比较用的参考时间；从未同步过时退回远程时间
    pub fn reference_mtime(&self, threshold: i64) -> i64 {
        if self.lmtime != 0 {
            self.lmtime_with_threshold
        } else {
            self.date + threshold
        }
    }
}
