use super::node::{Node, NodeId, NodeInfo, NodeKind};
use crate::config::ServerId;
use crate::storage::{FileInfo, FileType};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// 事件通道容量，慢订阅者会丢失最旧的事件
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Created,
    Changed,
    Deleted,
}

/// 树变化通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsEvent {
    pub kind: WatchKind,
    pub path: String,
}

/// 一个远程根目录的内存镜像
///
/// 节点保存在 `slots` 中，用下标互相引用；删除的槽位进入 `free` 等待复用。
/// 根节点代表服务器本身，其路径为 `/`。
pub struct VfsTree {
    server: ServerId,
    slots: Vec<Option<Node>>,
    free: Vec<NodeId>,
    root: NodeId,
    events: broadcast::Sender<VfsEvent>,
}

/// 按 `/` 切分路径，忽略空段（处理重复的 `/`）
pub(crate) fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn is_dot(name: &str) -> bool {
    name == "." || name == ".."
}

impl VfsTree {
    pub fn new(server: ServerId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            server,
            slots: vec![Some(Node::directory(""))],
            free: Vec::new(),
            root: 0,
            events,
        }
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VfsEvent> {
        self.events.subscribe()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    /// 存活节点数（含根）
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// `..` 的解析：根的父目录是根自己
    pub fn parent(&self, id: NodeId) -> NodeId {
        self.node(id).and_then(|n| n.parent).unwrap_or(self.root)
    }

    /// 目录的子节点，按名称排序
    pub fn children(&self, dir: NodeId) -> Vec<NodeId> {
        self.node(dir)
            .and_then(|n| n.as_directory())
            .map(|d| d.children.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        match name {
            "" | "." => Some(dir),
            ".." => Some(self.parent(dir)),
            _ => self.node(dir)?.as_directory()?.children.get(name).copied(),
        }
    }

    /// 节点的绝对路径
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = id;
        while cur != self.root {
            match self.node(cur) {
                Some(node) => {
                    parts.push(node.name.as_str());
                    match node.parent {
                        Some(p) => cur = p,
                        None => break,
                    }
                }
                None => break,
            }
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    pub fn info(&self, id: NodeId) -> Option<NodeInfo> {
        let node = self.node(id)?;
        Some(NodeInfo {
            name: node.name.clone(),
            path: self.path_of(id),
            kind: node.file_type(),
            size: node.size,
            date: node.date,
            lmtime: node.lmtime,
            lmtime_with_threshold: node.lmtime_with_threshold,
            remote_modified: node.remote_modified,
            link: node.link_target().map(str::to_string),
        })
    }

    pub fn get_node(&self, path: &str) -> Option<NodeId> {
        let mut cur = self.root;
        for name in split_path(path) {
            cur = self.child(cur, name)?;
        }
        Some(cur)
    }

    /// 查找目录；`create` 为真时沿途补建缺失目录，同名的非目录节点会被替换
    pub fn get_directory(&mut self, path: &str, create: bool) -> Option<NodeId> {
        let mut cur = self.root;
        for name in split_path(path) {
            let next = self.child(cur, name);
            cur = match next {
                Some(id) if self.node(id).map_or(false, Node::is_dir) => id,
                _ if create => self.set_item(cur, Node::directory(name))?,
                _ => return None,
            };
        }
        self.node(cur).filter(|n| n.is_dir()).map(|_| cur)
    }

    /// 放入节点，同名节点整体替换
    ///
    /// 新建发出 `Created`，替换发出 `Changed`。`dir` 不是目录时返回 `None`。
    pub fn set_item(&mut self, dir: NodeId, mut node: Node) -> Option<NodeId> {
        if is_dot(&node.name) || node.name.is_empty() {
            return None;
        }
        self.node(dir)?.as_directory()?;

        let name = node.name.clone();
        let old = self.child(dir, &name);
        if let Some(old) = old {
            self.free_subtree(old);
        }

        node.parent = Some(dir);
        let id = self.alloc(node);
        if let Some(d) = self.node_mut(dir).and_then(Node::as_directory_mut) {
            d.children.insert(name, id);
        }

        let kind = if old.is_some() {
            WatchKind::Changed
        } else {
            WatchKind::Created
        };
        self.emit(kind, id);
        Some(id)
    }

    /// 删除子节点（连同子树），发出 `Deleted`
    pub fn delete_item(&mut self, dir: NodeId, name: &str) -> bool {
        if is_dot(name) {
            return false;
        }
        let removed = self
            .node_mut(dir)
            .and_then(Node::as_directory_mut)
            .and_then(|d| d.children.remove(name));
        match removed {
            Some(id) => {
                let path = self.child_path(dir, name);
                self.free_subtree(id);
                self.send(WatchKind::Deleted, path);
                true
            }
            None => false,
        }
    }

    /// 移动节点，保留其子树；目标位置已有的同名节点被替换
    pub fn move_item(
        &mut self,
        from_dir: NodeId,
        name: &str,
        to_dir: NodeId,
        new_name: &str,
    ) -> Option<NodeId> {
        if is_dot(name) || is_dot(new_name) || new_name.is_empty() {
            return None;
        }
        self.node(to_dir)?.as_directory()?;
        let id = self.child(from_dir, name)?;
        if id == to_dir || self.is_ancestor(id, to_dir) {
            return None;
        }

        let old_path = self.path_of(id);
        if let Some(d) = self.node_mut(from_dir).and_then(Node::as_directory_mut) {
            d.children.remove(name);
        }
        if let Some(existing) = self.child(to_dir, new_name) {
            self.free_subtree(existing);
        }

        if let Some(node) = self.node_mut(id) {
            node.name = new_name.to_string();
            node.parent = Some(to_dir);
        }
        if let Some(d) = self.node_mut(to_dir).and_then(Node::as_directory_mut) {
            d.children.insert(new_name.to_string(), id);
        }

        self.send(WatchKind::Deleted, old_path);
        self.emit(WatchKind::Created, id);
        Some(id)
    }

    /// 用远程列表更新目录
    pub fn refresh(&mut self, dir: NodeId, listing: &[FileInfo]) {
        let Some(existing) = self
            .node(dir)
            .and_then(Node::as_directory)
            .map(|d| d.children.clone())
        else {
            return;
        };

        let mut seen = HashSet::new();
        for info in listing {
            if is_dot(&info.name) || info.name.is_empty() || info.name.contains('/') {
                continue;
            }
            seen.insert(info.name.as_str());

            let Some(&id) = existing.get(&info.name) else {
                self.set_item(dir, Node::from_info(info));
                continue;
            };
            let same_type = self.node(id).map(Node::file_type) == Some(info.kind);
            if !same_type {
                self.set_item(dir, Node::from_info(info));
                continue;
            }

            let mut changed = false;
            if let Some(node) = self.node_mut(id) {
                match &mut node.kind {
                    NodeKind::File => {
                        if node.size != info.size {
                            node.size = info.size;
                            node.remote_modified = true;
                            changed = true;
                        }
                    }
                    NodeKind::Directory(_) => {}
                    NodeKind::SymLink { target } => {
                        if info.link.is_some() && *target != info.link {
                            *target = info.link.clone();
                            changed = true;
                        }
                        node.size = info.size;
                    }
                }
                node.date = info.date;
            }
            if changed {
                self.emit(WatchKind::Changed, id);
            }
        }

        for name in existing.keys() {
            if !seen.contains(name.as_str()) {
                self.delete_item(dir, name);
            }
        }

        if let Some(d) = self.node_mut(dir).and_then(Node::as_directory_mut) {
            d.refreshed_at = Some(Instant::now());
        }
    }

    /// 丢弃目录下所有缓存内容，并标记为需要重新列出
    pub fn invalidate(&mut self, dir: NodeId) {
        let names: Vec<String> = match self.node(dir).and_then(Node::as_directory) {
            Some(d) => d.children.keys().cloned().collect(),
            None => return,
        };
        for name in names {
            self.delete_item(dir, &name);
        }
        if let Some(d) = self.node_mut(dir).and_then(Node::as_directory_mut) {
            d.refreshed_at = None;
        }
    }

    /// 目录缓存是否仍可直接使用
    ///
    /// 需要列出过、刷新时间在 `ttl` 内（`ttl` 为 `None` 表示不检查时间），
    /// 且没有 date 为 0 的占位子节点。
    pub fn is_fresh(&self, dir: NodeId, ttl: Option<Duration>) -> bool {
        let Some(d) = self.node(dir).and_then(Node::as_directory) else {
            return false;
        };
        let Some(at) = d.refreshed_at else {
            return false;
        };
        if let Some(ttl) = ttl {
            if at.elapsed() > ttl {
                return false;
            }
        }
        d.children
            .values()
            .filter_map(|&id| self.node(id))
            .all(|n| n.date != 0)
    }

    fn is_ancestor(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        while let Some(parent) = self.node(id).and_then(|n| n.parent) {
            if parent == ancestor {
                return true;
            }
            id = parent;
        }
        false
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.slots.get_mut(cur).and_then(Option::take) {
                if let NodeKind::Directory(d) = node.kind {
                    stack.extend(d.children.into_values());
                }
                self.free.push(cur);
            }
        }
    }

    fn child_path(&self, dir: NodeId, name: &str) -> String {
        let base = self.path_of(dir);
        if base == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", base, name)
        }
    }

    fn emit(&self, kind: WatchKind, id: NodeId) {
        self.send(kind, self.path_of(id));
    }

    fn send(&self, kind: WatchKind, path: String) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(VfsEvent { kind, path });
    }

    pub fn file_type_of(&self, path: &str) -> Option<FileType> {
        self.get_node(path)
            .and_then(|id| self.node(id))
            .map(Node::file_type)
    }
}
