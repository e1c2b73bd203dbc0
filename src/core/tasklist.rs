use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// 批量任务中的单项操作
///
/// `UploadFrom(x)` 放在工作路径 W 上：把本地 x 上传到远程 W。
/// `UploadTo(x)` 放在 W 上：把本地 W 上传到远程 x。下载同理。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaskOp {
    Upload,
    Download,
    Delete,
    Mkdir,
    UploadFrom(String),
    UploadTo(String),
    DownloadFrom(String),
    DownloadTo(String),
}

impl fmt::Display for TaskOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOp::Upload => write!(f, "upload"),
            TaskOp::Download => write!(f, "download"),
            TaskOp::Delete => write!(f, "delete"),
            TaskOp::Mkdir => write!(f, "mkdir"),
            TaskOp::UploadFrom(p) => write!(f, "upload from {}", p),
            TaskOp::UploadTo(p) => write!(f, "upload to {}", p),
            TaskOp::DownloadFrom(p) => write!(f, "download from {}", p),
            TaskOp::DownloadTo(p) => write!(f, "download to {}", p),
        }
    }
}

impl FromStr for TaskOp {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let op = match s {
            "upload" => TaskOp::Upload,
            "download" => TaskOp::Download,
            "delete" => TaskOp::Delete,
            "mkdir" => TaskOp::Mkdir,
            _ => {
                let with_arg = |prefix: &str| {
                    s.strip_prefix(prefix)
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                };
                if let Some(p) = with_arg("upload from ") {
                    TaskOp::UploadFrom(p)
                } else if let Some(p) = with_arg("upload to ") {
                    TaskOp::UploadTo(p)
                } else if let Some(p) = with_arg("download from ") {
                    TaskOp::DownloadFrom(p)
                } else if let Some(p) = with_arg("download to ") {
                    TaskOp::DownloadTo(p)
                } else {
                    return Err(SyncError::Other(anyhow::anyhow!("unknown task: {}", s)));
                }
            }
        };
        Ok(op)
    }
}

impl TryFrom<String> for TaskOp {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TaskOp> for String {
    fn from(op: TaskOp) -> Self {
        op.to_string()
    }
}

/// 工作路径到操作的有序映射，父目录总是排在子项前面
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskList {
    entries: BTreeMap<String, TaskOp>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, workpath: impl Into<String>, op: TaskOp) {
        self.entries.insert(workpath.into(), op);
    }

    pub fn get(&self, workpath: &str) -> Option<&TaskOp> {
        self.entries.get(workpath)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TaskOp)> {
        self.entries.iter()
    }

    pub fn extend(&mut self, other: TaskList) {
        self.entries.extend(other.entries);
    }

    /// 写入确认文件
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// 读回（可能被用户编辑过的）确认文件
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl FromIterator<(String, TaskOp)> for TaskList {
    fn from_iter<I: IntoIterator<Item = (String, TaskOp)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TaskList {
    type Item = (String, TaskOp);
    type IntoIter = std::collections::btree_map::IntoIter<String, TaskOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// 批量执行结果
#[derive(Debug, Default)]
pub struct BatchResult {
    /// 失败的子集，重试时只重新执行这些
    pub failed_tasks: TaskList,
    pub errors: Vec<(String, SyncError)>,
    /// 执行的总项数
    pub count: usize,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.count - self.failed_tasks.len()
    }

    pub fn is_ok(&self) -> bool {
        self.failed_tasks.is_empty()
    }
}
