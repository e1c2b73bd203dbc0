//! 树的 JSON 序列化与共享缓存文件

use super::node::{Node, NodeId, NodeKind};
use super::tree::VfsTree;
use crate::config::ServerId;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// 缓存文件格式版本，不匹配时整个文件作废
pub const CACHE_VERSION: u64 = 1;
const VERSION_KEY: &str = "$version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum SerialType {
    #[serde(rename = "-")]
    File,
    #[serde(rename = "d")]
    Directory,
    #[serde(rename = "l")]
    SymLink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerialNode {
    #[serde(rename = "type")]
    kind: SerialType,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    lmtime: i64,
    #[serde(default)]
    modified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    files: BTreeMap<String, SerialNode>,
}

impl VfsTree {
    /// 根目录内容的 JSON 表示：`{ name: {type, size, lmtime, modified, link?, files?} }`
    pub fn serialize(&self) -> Value {
        let files = self.serialize_children(self.root());
        serde_json::to_value(files).unwrap_or(Value::Null)
    }

    fn serialize_children(&self, dir: NodeId) -> BTreeMap<String, SerialNode> {
        self.children(dir)
            .into_iter()
            .filter_map(|id| {
                let node = self.node(id)?;
                let (kind, link, files) = match &node.kind {
                    NodeKind::File => (SerialType::File, None, BTreeMap::new()),
                    NodeKind::Directory(_) => {
                        (SerialType::Directory, None, self.serialize_children(id))
                    }
                    NodeKind::SymLink { target } => (SerialType::SymLink, target.clone(), BTreeMap::new()),
                };
                Some((
                    node.name.clone(),
                    SerialNode {
                        kind,
                        size: node.size,
                        lmtime: node.lmtime,
                        modified: node.remote_modified,
                        link,
                        files,
                    },
                ))
            })
            .collect()
    }

    /// 从 JSON 重建树
    ///
    /// 所有节点的 date 置 0，首次列出目录时会重新获取远程时间。
    pub fn deserialize(server: ServerId, value: &Value, threshold: i64) -> Result<Self> {
        let files: BTreeMap<String, SerialNode> = serde_json::from_value(value.clone())?;
        let mut tree = VfsTree::new(server);
        let root = tree.root();
        tree.load_children(root, files, threshold);
        Ok(tree)
    }

    fn load_children(&mut self, dir: NodeId, files: BTreeMap<String, SerialNode>, threshold: i64) {
        for (name, serial) in files {
            let mut node = match serial.kind {
                SerialType::File => Node::file(name, serial.size, 0),
                SerialType::Directory => Node::directory(name),
                SerialType::SymLink => Node::symlink(name, serial.link),
            };
            node.size = serial.size;
            node.remote_modified = serial.modified;
            node.set_lmtime(serial.lmtime, threshold);

            if let Some(id) = self.set_item(dir, node) {
                if serial.kind == SerialType::Directory {
                    self.load_children(id, serial.files, threshold);
                }
            }
        }
    }
}

/// 工作区共享缓存文件，按 host_uri 存放每个服务器的树
#[derive(Debug, Default)]
pub struct CacheFile {
    servers: Map<String, Value>,
}

impl CacheFile {
    /// 读取缓存文件；不存在、损坏或版本不符时返回空缓存
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };
        let mut map = match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!("缓存文件已损坏，丢弃: {:?}", path);
                return Self::default();
            }
        };
        let version = map.remove(VERSION_KEY).and_then(|v| v.as_u64());
        if version != Some(CACHE_VERSION) {
            warn!("缓存文件版本不匹配 ({:?})，丢弃: {:?}", version, path);
            return Self::default();
        }
        debug!("已读取缓存文件 {:?}，{} 个服务器", path, map.len());
        Self { servers: map }
    }

    pub fn get(&self, host_uri: &str) -> Option<&Value> {
        self.servers.get(host_uri)
    }

    pub fn set(&mut self, host_uri: impl Into<String>, value: Value) {
        self.servers.insert(host_uri.into(), value);
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = Map::new();
        out.insert(VERSION_KEY.to_string(), Value::from(CACHE_VERSION));
        for (k, v) in &self.servers {
            out.insert(k.clone(), v.clone());
        }
        fs::write(path, serde_json::to_string_pretty(&Value::Object(out))?)?;
        Ok(())
    }
}
