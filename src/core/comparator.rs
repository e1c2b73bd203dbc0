use super::scanner::LocalEntry;
use super::tasklist::{TaskList, TaskOp};
use crate::storage::FileType;
use crate::vfs::NodeInfo;

/// 本地与缓存节点的比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    /// 一致（在时间容差内）
    Equal,
    /// 对方不存在
    Missing,
    /// 类型不同
    TypeMismatch,
    /// 大小不同
    SizeDiffers,
    /// 本地更新
    LocalNewer,
    /// 远程被其他途径修改
    RemoteModified,
}

/// 文件比较器，只依据存在性、类型、大小和修改时间（加容差）
#[derive(Debug, Clone, Copy)]
pub struct FileComparator {
    /// 时间容差（毫秒）
    threshold: i64,
}

impl FileComparator {
    pub fn new(threshold: i64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// 从上传方向比较本地文件和远程节点
    pub fn compare_for_upload(&self, local: &LocalEntry, remote: Option<&NodeInfo>) -> FileRelation {
        let Some(remote) = remote else {
            return FileRelation::Missing;
        };
        if remote.kind != local.kind {
            return FileRelation::TypeMismatch;
        }
        if local.kind != FileType::File {
            return FileRelation::Equal;
        }
        if remote.size != local.size {
            return FileRelation::SizeDiffers;
        }
        if local.mtime > remote.reference_mtime(self.threshold) {
            tracing::debug!(
                "本地较新: {} (local={}, ref={})",
                remote.path,
                local.mtime,
                remote.reference_mtime(self.threshold)
            );
            return FileRelation::LocalNewer;
        }
        FileRelation::Equal
    }

    /// 从下载方向比较
    pub fn compare_for_download(&self, remote: &NodeInfo, local: Option<&LocalEntry>) -> FileRelation {
        let Some(local) = local else {
            return FileRelation::Missing;
        };
        if remote.kind != local.kind {
            return FileRelation::TypeMismatch;
        }
        if remote.kind != FileType::File {
            return FileRelation::Equal;
        }
        if remote.size != local.size {
            return FileRelation::SizeDiffers;
        }
        if remote.remote_modified {
            return FileRelation::RemoteModified;
        }
        FileRelation::Equal
    }

    pub fn upload_action(&self, local: &LocalEntry, remote: Option<&NodeInfo>) -> Option<TaskOp> {
        match local.kind {
            FileType::Directory => match remote {
                Some(r) if r.is_dir() => None,
                _ => Some(TaskOp::Mkdir),
            },
            FileType::File => match self.compare_for_upload(local, remote) {
                FileRelation::Equal => None,
                _ => Some(TaskOp::Upload),
            },
            FileType::SymLink => None,
        }
    }

    pub fn download_action(&self, remote: &NodeInfo, local: Option<&LocalEntry>) -> Option<TaskOp> {
        match remote.kind {
            FileType::Directory => match local {
                None => Some(TaskOp::Download),
                Some(_) => None,
            },
            FileType::File => match self.compare_for_download(remote, local) {
                FileRelation::Equal => None,
                _ => Some(TaskOp::Download),
            },
            FileType::SymLink => None,
        }
    }

    /// 远程有、本地没有的条目需要删除
    pub fn clean_action(&self, _remote: &NodeInfo, local: Option<&LocalEntry>) -> Option<TaskOp> {
        match local {
            None => Some(TaskOp::Delete),
            Some(_) => None,
        }
    }

    /// 上传可跳过：本地 mtime 不晚于节点记录的 lmtime + 容差
    pub fn is_upload_latest(&self, local_mtime: i64, node: &NodeInfo) -> bool {
        node.lmtime != 0 && local_mtime <= node.lmtime_with_threshold
    }

    /// 下载可跳过：本地仍是上次同步的样子，远程也没变
    pub fn is_download_latest(&self, local: &LocalEntry, node: &NodeInfo) -> bool {
        node.lmtime != 0
            && !node.remote_modified
            && local.kind == node.kind
            && local.size == node.size
            && local.mtime <= node.lmtime_with_threshold
            && local.mtime >= node.lmtime - self.threshold
    }

    /// 统计任务列表中的各类操作
    pub fn summarize(list: &TaskList) -> ActionSummary {
        let mut summary = ActionSummary::default();
        for (_, op) in list.iter() {
            match op {
                TaskOp::Upload | TaskOp::UploadFrom(_) | TaskOp::UploadTo(_) => summary.uploads += 1,
                TaskOp::Download | TaskOp::DownloadFrom(_) | TaskOp::DownloadTo(_) => {
                    summary.downloads += 1
                }
                TaskOp::Delete => summary.deletes += 1,
                TaskOp::Mkdir => summary.mkdirs += 1,
            }
        }
        summary
    }
}

/// 操作统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub uploads: usize,
    pub downloads: usize,
    pub deletes: usize,
    pub mkdirs: usize,
}

impl ActionSummary {
    pub fn total(&self) -> usize {
        self.uploads + self.downloads + self.deletes + self.mkdirs
    }
}

impl std::fmt::Display for ActionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} upload, {} download, {} delete, {} mkdir",
            self.uploads, self.downloads, self.deletes, self.mkdirs
        )
    }
}
