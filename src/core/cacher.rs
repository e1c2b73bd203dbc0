//! 同步缓存器：单个服务器的全部远程操作入口
//!
//! 公开方法各自提交一个调度任务；`*_in` 方法在已有任务内组合调用。
//! 目录列表按 `refresh_time` 缓存在 VFS 中，传输前后用 VFS 记录的
//! lmtime 判断是否需要真正传输。

use super::comparator::FileComparator;
use super::conflict::{remote_copy_name, ModifiedPolicy};
use super::manager::ConnectionManager;
use super::scanner::{local_stat, scan_dir, IgnoreMatcher};
use super::scheduler::{Scheduler, Task, TaskHandle, PRIORITY_HIGH, PRIORITY_NORMAL};
use super::tasklist::{BatchResult, TaskList, TaskOp};
use crate::config::{ServerConfig, WORKSPACE_DIR};
use crate::error::{ErrorCode, Result, SyncError};
use crate::interact::{ConfirmAction, Interact};
use crate::storage::{split_parent, ByteStream, ConnectionFactory, FileType, ProtocolFactory};
use crate::vfs::{CacheFile, Node, NodeInfo, VfsEvent, VfsTree};
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// 批量确认文件名
pub const TASKS_FILE: &str = "tasks.json";

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// 忽略缓存，总是重新列出
    pub force_refresh: bool,
    /// 只要列出过就使用缓存，不检查过期时间
    pub do_not_refresh: bool,
}

impl ListOptions {
    pub fn force() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    /// 覆盖配置里的 `whenRemoteModified`
    pub when_remote_modified: Option<ModifiedPolicy>,
    /// 批量执行中（diff 退化为 error）
    pub batch: bool,
}

/// 单项传输的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// 已是最新，未传输
    Latest,
    Skipped,
    /// 远程副本已下载到临时文件，等待外部比较
    Diff { local: PathBuf, remote_copy: PathBuf },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Done => write!(f, "done"),
            Outcome::Latest => write!(f, "latest"),
            Outcome::Skipped => write!(f, "skipped"),
            Outcome::Diff { remote_copy, .. } => write!(f, "diff ({})", remote_copy.display()),
        }
    }
}

/// 规范化工作路径：以 `/` 开头，无末尾 `/`，无空段与 `.`
pub fn normalize_workpath(path: &str) -> String {
    let parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

fn join_workpath(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

fn is_request_mkdir(err: &SyncError) -> bool {
    matches!(
        err.code(),
        Some(ErrorCode::RequestMkdir) | Some(ErrorCode::RequestRecursive)
    )
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

pub struct SyncCacher {
    workspace: PathBuf,
    scheduler: Scheduler,
    manager: Arc<ConnectionManager>,
    vfs: RwLock<VfsTree>,
    ignore: std::sync::RwLock<Arc<IgnoreMatcher>>,
    interact: Interact,
    confirm_batch: AtomicBool,
}

impl SyncCacher {
    pub fn new(
        workspace: impl Into<PathBuf>,
        config: ServerConfig,
        ignore: IgnoreMatcher,
        confirm_batch: bool,
        interact: Interact,
    ) -> Arc<Self> {
        Self::with_factory(
            workspace,
            config,
            ignore,
            confirm_batch,
            interact,
            Arc::new(ProtocolFactory),
        )
    }

    pub fn with_factory(
        workspace: impl Into<PathBuf>,
        config: ServerConfig,
        ignore: IgnoreMatcher,
        confirm_batch: bool,
        interact: Interact,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Arc<Self> {
        let scheduler = Scheduler::new(config.display_name());
        let vfs = VfsTree::new(config.server_id());
        let manager = ConnectionManager::new(config, factory, interact.prompt.clone());
        Arc::new(Self {
            workspace: workspace.into(),
            scheduler,
            manager,
            vfs: RwLock::new(vfs),
            ignore: std::sync::RwLock::new(Arc::new(ignore)),
            interact,
            confirm_batch: AtomicBool::new(confirm_batch),
        })
    }

    pub fn config(&self) -> ServerConfig {
        self.manager.config()
    }

    pub async fn set_config(&self, config: ServerConfig) {
        self.manager.set_config(config).await;
    }

    /// 重新加载工作区配置时更新忽略规则与批量确认开关
    pub fn set_options(&self, ignore: IgnoreMatcher, confirm_batch: bool) {
        *self.ignore.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(ignore);
        self.confirm_batch.store(confirm_batch, Ordering::Relaxed);
    }

    fn ignore(&self) -> Arc<IgnoreMatcher> {
        self.ignore
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<VfsEvent> {
        self.vfs.read().await.subscribe()
    }

    #[cfg(test)]
    pub(crate) async fn vfs_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, VfsTree> {
        self.vfs.write().await
    }

    fn comparator(&self) -> FileComparator {
        FileComparator::new(self.config().time_threshold)
    }

    /// 工作路径对应的本地路径
    pub fn local_path(&self, workpath: &str) -> PathBuf {
        let rel = normalize_workpath(workpath);
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            self.workspace.clone()
        } else {
            self.workspace.join(rel)
        }
    }

    /// 工作路径对应的远程路径
    pub fn remote_path(&self, workpath: &str) -> String {
        let config = self.config();
        let base = config.remote_path.trim_end_matches('/');
        let wp = normalize_workpath(workpath);
        match (base.is_empty(), wp.as_str()) {
            (true, _) => wp,
            (false, "/") => base.to_string(),
            (false, _) => format!("{}{}", base, wp),
        }
    }

    fn schedule<T, F, Fut>(&self, name: String, priority: i32, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Task>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let timeout = self.config().task_start_deadline();
        self.scheduler.task_with_timeout(name, priority, timeout, f)
    }

    /// 取消当前任务和所有排队任务
    pub fn cancel(&self) {
        self.scheduler.cancel();
    }

    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    // ============ 公开操作（每个一个任务） ============

    pub async fn list(self: &Arc<Self>, workpath: &str, opts: ListOptions) -> Result<Vec<NodeInfo>> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("list {}", workpath), PRIORITY_HIGH, move |task| async move {
            this.list_in(&task, &workpath, opts).await
        })
        .await
    }

    pub async fn stat(self: &Arc<Self>, workpath: &str, opts: ListOptions) -> Result<Option<NodeInfo>> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("stat {}", workpath), PRIORITY_HIGH, move |task| async move {
            this.stat_in(&task, &workpath, opts).await
        })
        .await
    }

    pub async fn upload(self: &Arc<Self>, workpath: &str, opts: TransferOptions) -> Result<Outcome> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("upload {}", workpath), PRIORITY_NORMAL, move |task| async move {
            this.upload_in(&task, &workpath, opts).await
        })
        .await
    }

    pub async fn download(self: &Arc<Self>, workpath: &str, opts: TransferOptions) -> Result<Outcome> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("download {}", workpath), PRIORITY_NORMAL, move |task| async move {
            this.download_in(&task, &workpath, opts).await
        })
        .await
    }

    pub async fn delete(self: &Arc<Self>, workpath: &str) -> Result<()> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("delete {}", workpath), PRIORITY_NORMAL, move |task| async move {
            this.delete_in(&task, &workpath).await
        })
        .await
    }

    pub async fn mkdir(self: &Arc<Self>, workpath: &str) -> Result<()> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("mkdir {}", workpath), PRIORITY_NORMAL, move |task| async move {
            this.mkdir_in(&task, &workpath).await
        })
        .await
    }

    pub async fn rename(self: &Arc<Self>, from: &str, to: &str) -> Result<()> {
        let this = self.clone();
        let from = normalize_workpath(from);
        let to = normalize_workpath(to);
        self.schedule(format!("rename {} {}", from, to), PRIORITY_NORMAL, move |task| async move {
            this.rename_in(&task, &from, &to).await
        })
        .await
    }

    /// 丢弃目录缓存并重新列出
    pub async fn refresh(self: &Arc<Self>, workpath: &str) -> Result<Vec<NodeInfo>> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("refresh {}", workpath), PRIORITY_NORMAL, move |task| async move {
            this.refresh_in(&task, &workpath).await
        })
        .await
    }

    pub async fn pwd(self: &Arc<Self>) -> Result<String> {
        let this = self.clone();
        self.schedule("pwd".to_string(), PRIORITY_HIGH, move |task| async move {
            this.manager.pwd(&task).await
        })
        .await
    }

    pub async fn readlink(self: &Arc<Self>, workpath: &str) -> Result<String> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("readlink {}", workpath), PRIORITY_HIGH, move |task| async move {
            let remote = this.remote_path(&workpath);
            this.manager.readlink(&task, &remote).await
        })
        .await
    }

    pub async fn upload_all(self: &Arc<Self>, workpath: &str) -> Result<TaskList> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("upload all {}", workpath), PRIORITY_NORMAL, move |task| async move {
            this.upload_all_in(&task, &workpath).await
        })
        .await
    }

    pub async fn download_all(self: &Arc<Self>, workpath: &str) -> Result<TaskList> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("download all {}", workpath), PRIORITY_NORMAL, move |task| async move {
            this.download_all_in(&task, &workpath).await
        })
        .await
    }

    pub async fn clean_all(self: &Arc<Self>, workpath: &str) -> Result<TaskList> {
        let this = self.clone();
        let workpath = normalize_workpath(workpath);
        self.schedule(format!("clean all {}", workpath), PRIORITY_NORMAL, move |task| async move {
            this.clean_all_in(&task, &workpath).await
        })
        .await
    }

    pub async fn exec_task_list(self: &Arc<Self>, list: TaskList) -> Result<BatchResult> {
        let this = self.clone();
        self.schedule(format!("batch ({} tasks)", list.len()), PRIORITY_NORMAL, move |task| async move {
            this.exec_task_list_in(&task, list).await
        })
        .await
    }

    /// 确认、执行、失败项重试
    pub async fn run_task_list(self: &Arc<Self>, list: TaskList) -> Result<BatchResult> {
        if list.is_empty() {
            self.interact.logger.message("Nothing to do");
            return Ok(BatchResult::default());
        }

        let mut list = list;
        if self.confirm_batch.load(Ordering::Relaxed) {
            let path = self.workspace.join(WORKSPACE_DIR).join(TASKS_FILE);
            list.save(&path)?;
            let question = format!(
                "{}: review or edit {} and press OK to continue",
                FileComparator::summarize(&list),
                path.display()
            );
            let answer = self
                .interact
                .confirm
                .confirm(&question, &[ConfirmAction::Ok])
                .await;
            let reloaded = match answer {
                Some(ConfirmAction::Ok) => TaskList::load(&path),
                _ => Err(SyncError::Cancelled),
            };
            let _ = tokio::fs::remove_file(&path).await;
            list = reloaded?;
        }

        loop {
            let result = self.exec_task_list(list).await?;
            if result.is_ok() {
                self.interact
                    .logger
                    .message(&format!("{} tasks completed", result.count));
                return Ok(result);
            }

            let question = format!(
                "{} of {} tasks failed",
                result.failed_tasks.len(),
                result.count
            );
            self.interact.logger.error(&question);
            match self
                .interact
                .confirm
                .confirm(&question, &[ConfirmAction::Retry])
                .await
            {
                Some(ConfirmAction::Retry) => list = result.failed_tasks.clone(),
                _ => return Ok(result),
            }
        }
    }

    // ============ 缓存文件 ============

    /// 把当前树写入共享缓存文件
    pub async fn save_cache(&self, path: &Path) -> Result<()> {
        let value = self.vfs.read().await.serialize();
        let mut cache = CacheFile::load(path);
        cache.set(self.config().server_id().host_uri(), value);
        cache.save(path)
    }

    /// 从共享缓存文件恢复，返回是否找到本服务器的数据
    pub async fn load_cache(&self, path: &Path) -> Result<bool> {
        let config = self.config();
        let cache = CacheFile::load(path);
        let Some(value) = cache.get(&config.server_id().host_uri()) else {
            return Ok(false);
        };
        match VfsTree::deserialize(config.server_id(), value, config.time_threshold) {
            Ok(tree) => {
                debug!("已恢复缓存: {} 个节点", tree.len());
                *self.vfs.write().await = tree;
                Ok(true)
            }
            Err(e) => {
                warn!("缓存数据无效，忽略: {}", e);
                Ok(false)
            }
        }
    }

    // ============ 任务内操作 ============

    /// 确保目录缓存可用，必要时列出远程
    async fn ensure_listed(&self, task: &Task, remote: &str, opts: ListOptions) -> Result<()> {
        if !opts.force_refresh {
            let ttl = if opts.do_not_refresh {
                None
            } else {
                Some(self.config().refresh_ttl())
            };
            let vfs = self.vfs.read().await;
            if vfs.get_node(remote).map_or(false, |dir| vfs.is_fresh(dir, ttl)) {
                debug!("使用缓存: {}", remote);
                return Ok(());
            }
        }

        let listing = self.manager.list(task, remote).await?;
        let mut vfs = self.vfs.write().await;
        // 空列表无法区分空目录和不存在的目录，只刷新已知目录
        if let Some(dir) = vfs.get_directory(remote, !listing.is_empty()) {
            vfs.refresh(dir, &listing);
        }
        Ok(())
    }

    async fn list_remote_in(&self, task: &Task, remote: &str, opts: ListOptions) -> Result<Vec<NodeInfo>> {
        self.ensure_listed(task, remote, opts).await?;
        let vfs = self.vfs.read().await;
        let Some(dir) = vfs.get_node(remote) else {
            return Ok(Vec::new());
        };
        Ok(vfs
            .children(dir)
            .into_iter()
            .filter_map(|id| vfs.info(id))
            .collect())
    }

    async fn stat_remote_in(&self, task: &Task, remote: &str, opts: ListOptions) -> Result<Option<NodeInfo>> {
        if crate::vfs::split_path(remote).next().is_none() {
            let vfs = self.vfs.read().await;
            return Ok(vfs.info(vfs.root()));
        }
        let (parent, _) = split_parent(remote);
        self.ensure_listed(task, parent, opts).await?;
        let vfs = self.vfs.read().await;
        Ok(vfs.get_node(remote).and_then(|id| vfs.info(id)))
    }

    pub async fn list_in(&self, task: &Task, workpath: &str, opts: ListOptions) -> Result<Vec<NodeInfo>> {
        self.list_remote_in(task, &self.remote_path(workpath), opts).await
    }

    pub async fn stat_in(&self, task: &Task, workpath: &str, opts: ListOptions) -> Result<Option<NodeInfo>> {
        self.stat_remote_in(task, &self.remote_path(workpath), opts).await
    }

    pub async fn refresh_in(&self, task: &Task, workpath: &str) -> Result<Vec<NodeInfo>> {
        let remote = self.remote_path(workpath);
        {
            let mut vfs = self.vfs.write().await;
            if let Some(dir) = vfs.get_directory(&remote, false) {
                vfs.invalidate(dir);
            }
        }
        self.list_remote_in(task, &remote, ListOptions::force()).await
    }

    pub async fn upload_in(&self, task: &Task, workpath: &str, opts: TransferOptions) -> Result<Outcome> {
        self.upload_as_in(task, workpath, workpath, opts).await
    }

    /// 把本地 `from` 上传到远程 `to`（均为工作路径）
    async fn upload_as_in(
        &self,
        task: &Task,
        from: &str,
        to: &str,
        opts: TransferOptions,
    ) -> Result<Outcome> {
        task.check_cancelled()?;
        let config = self.config();
        let local = self.local_path(from);
        let remote = self.remote_path(to);
        let entry = local_stat(&local)
            .await?
            .ok_or_else(|| SyncError::not_found(&local.display().to_string()))?;

        match entry.kind {
            FileType::Directory => {
                let node = self.stat_remote_in(task, &remote, ListOptions::default()).await?;
                if node.as_ref().map_or(false, NodeInfo::is_dir) {
                    return Ok(Outcome::Latest);
                }
                self.mkdir_chain_in(task, &remote).await?;
                self.interact.logger.message(&format!("mkdir: {}", to));
                return Ok(Outcome::Done);
            }
            FileType::SymLink => {
                self.interact
                    .logger
                    .message(&format!("skip symlink: {}", from));
                return Ok(Outcome::Skipped);
            }
            FileType::File => {}
        }

        let node = self.stat_remote_in(task, &remote, ListOptions::default()).await?;
        if let Some(node) = &node {
            if node.is_file() && self.comparator().is_upload_latest(entry.mtime, node) {
                self.interact.logger.message(&format!("latest: {}", to));
                return Ok(Outcome::Latest);
            }
            if node.remote_modified {
                let policy = opts
                    .when_remote_modified
                    .unwrap_or(config.when_remote_modified);
                let policy = if opts.batch { policy.for_batch() } else { policy };
                match policy {
                    ModifiedPolicy::Upload => {
                        info!("远程已修改，按配置覆盖: {}", to);
                    }
                    ModifiedPolicy::Ignore => {
                        self.interact
                            .logger
                            .message(&format!("remote modified, skipped: {}", to));
                        return Ok(Outcome::Skipped);
                    }
                    ModifiedPolicy::Error => {
                        return Err(SyncError::Modified {
                            path: to.to_string(),
                        });
                    }
                    ModifiedPolicy::Diff => {
                        let remote_copy = self.download_copy_in(task, &remote).await?;
                        return Ok(Outcome::Diff { local, remote_copy });
                    }
                }
            }
            if !node.is_file() {
                self.delete_remote_in(task, &remote).await?;
            }
        }

        match self.manager.upload(task, &local, &remote).await {
            Err(e) if is_request_mkdir(&e) => {
                let (parent, _) = split_parent(&remote);
                debug!("上级目录缺失，创建后重试: {}", parent);
                self.forget(parent).await;
                self.mkdir_chain_in(task, parent).await?;
                self.manager.upload(task, &local, &remote).await?;
            }
            other => other?,
        }

        let mut vfs = self.vfs.write().await;
        let (parent, name) = split_parent(&remote);
        if let Some(dir) = vfs.get_directory(parent, true) {
            vfs.set_item(
                dir,
                Node::file(name, entry.size, 0).with_lmtime(entry.mtime, config.time_threshold),
            );
        }
        drop(vfs);
        self.interact.logger.message(&format!("upload: {}", to));
        Ok(Outcome::Done)
    }

    pub async fn download_in(&self, task: &Task, workpath: &str, opts: TransferOptions) -> Result<Outcome> {
        self.download_as_in(task, workpath, workpath, opts).await
    }

    /// 把远程 `from` 下载到本地 `to`（均为工作路径）
    async fn download_as_in(
        &self,
        task: &Task,
        from: &str,
        to: &str,
        _opts: TransferOptions,
    ) -> Result<Outcome> {
        task.check_cancelled()?;
        let config = self.config();
        let remote = self.remote_path(from);
        let local = self.local_path(to);
        let node = self
            .stat_remote_in(task, &remote, ListOptions::default())
            .await?
            .ok_or_else(|| SyncError::not_found(&remote))?;

        match node.kind {
            FileType::Directory => {
                tokio::fs::create_dir_all(&local).await?;
                return Ok(Outcome::Done);
            }
            FileType::SymLink => {
                self.interact
                    .logger
                    .message(&format!("skip symlink: {}", from));
                return Ok(Outcome::Skipped);
            }
            FileType::File => {}
        }

        if let Some(entry) = local_stat(&local).await? {
            if self.comparator().is_download_latest(&entry, &node) {
                self.interact.logger.message(&format!("latest: {}", to));
                return Ok(Outcome::Latest);
            }
        }

        let stream = self.manager.download(task, &remote).await?;
        let written = task.with(write_stream(stream, &local)).await?;
        let mtime = local_stat(&local).await?.map(|e| e.mtime).unwrap_or(0);

        let mut vfs = self.vfs.write().await;
        if let Some(id) = vfs.get_node(&remote) {
            if let Some(n) = vfs.node_mut(id) {
                n.size = written;
                n.remote_modified = false;
                n.set_lmtime(mtime, config.time_threshold);
            }
        }
        drop(vfs);
        self.interact.logger.message(&format!("download: {}", to));
        Ok(Outcome::Done)
    }

    /// 把远程文件下载到临时文件，用于 diff
    async fn download_copy_in(&self, task: &Task, remote: &str) -> Result<PathBuf> {
        let target = std::env::temp_dir().join(remote_copy_name(remote));
        let stream = self.manager.download(task, remote).await?;
        task.with(write_stream(stream, &target)).await?;
        info!("远程副本已下载: {:?}", target);
        Ok(target)
    }

    pub async fn delete_in(&self, task: &Task, workpath: &str) -> Result<()> {
        let remote = self.remote_path(workpath);
        self.delete_remote_in(task, &remote).await?;
        self.interact.logger.message(&format!("delete: {}", workpath));
        Ok(())
    }

    /// 递归删除；目录先清空再 rmdir
    fn delete_remote_in<'a>(&'a self, task: &'a Task, remote: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            task.check_cancelled()?;
            let Some(node) = self
                .stat_remote_in(task, remote, ListOptions::default())
                .await?
            else {
                debug!("已不存在: {}", remote);
                self.forget(remote).await;
                return Ok(());
            };

            if node.is_dir() {
                self.empty_dir_in(task, remote, ListOptions::default()).await?;
                match self.manager.rmdir(task, remote).await {
                    Err(e) if e.code() == Some(ErrorCode::RequestRecursive) => {
                        // 缓存过期，强制重新列出后再清空一次
                        debug!("目录非空，重新列出: {}", remote);
                        self.empty_dir_in(task, remote, ListOptions::force()).await?;
                        ignore_not_found(self.manager.rmdir(task, remote).await)?;
                    }
                    other => ignore_not_found(other)?,
                }
            } else {
                ignore_not_found(self.manager.delete(task, remote).await)?;
            }

            self.forget(remote).await;
            Ok(())
        })
    }

    async fn empty_dir_in(&self, task: &Task, remote: &str, opts: ListOptions) -> Result<()> {
        let children = self.list_remote_in(task, remote, opts).await?;
        for child in children {
            self.delete_remote_in(task, &child.path).await?;
        }
        Ok(())
    }

    /// 从缓存中移除节点
    async fn forget(&self, remote: &str) {
        let (parent, name) = split_parent(remote);
        let mut vfs = self.vfs.write().await;
        if let Some(dir) = vfs.get_node(parent) {
            vfs.delete_item(dir, name);
        }
    }

    pub async fn mkdir_in(&self, task: &Task, workpath: &str) -> Result<()> {
        let remote = self.remote_path(workpath);
        self.mkdir_chain_in(task, &remote).await?;
        self.interact.logger.message(&format!("mkdir: {}", workpath));
        Ok(())
    }

    /// mkdir -p
    fn mkdir_chain_in<'a>(&'a self, task: &'a Task, remote: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            task.check_cancelled()?;
            if crate::vfs::split_path(remote).next().is_none() {
                return Ok(());
            }
            if self.vfs.read().await.file_type_of(remote) == Some(FileType::Directory) {
                return Ok(());
            }
            let existing = self.stat_remote_in(task, remote, ListOptions::default()).await?;
            match existing.as_ref().map(|n| n.kind) {
                Some(FileType::Directory) => return Ok(()),
                Some(_) => self.delete_remote_in(task, remote).await?,
                None => {}
            }

            match self.manager.mkdir(task, remote).await {
                Err(e) if is_request_mkdir(&e) => {
                    // 缓存认为上级存在但服务器上已经没有了
                    let (parent, _) = split_parent(remote);
                    self.forget(parent).await;
                    self.mkdir_chain_in(task, parent).await?;
                    self.manager.mkdir(task, remote).await?;
                }
                other => other?,
            }

            let _ = self.vfs.write().await.get_directory(remote, true);
            Ok(())
        })
    }

    pub async fn rename_in(&self, task: &Task, from: &str, to: &str) -> Result<()> {
        let source = self.remote_path(from);
        let target = self.remote_path(to);
        match self.manager.rename(task, &source, &target).await {
            Err(e) if is_request_mkdir(&e) => {
                let (parent, _) = split_parent(&target);
                self.forget(parent).await;
                self.mkdir_chain_in(task, parent).await?;
                self.manager.rename(task, &source, &target).await?;
            }
            other => other?,
        }

        let (from_parent, from_name) = split_parent(&source);
        let (to_parent, to_name) = split_parent(&target);
        let mut vfs = self.vfs.write().await;
        let moved = match (vfs.get_node(from_parent), vfs.get_directory(to_parent, true)) {
            (Some(a), Some(b)) => vfs.move_item(a, from_name, b, to_name).is_some(),
            _ => false,
        };
        if !moved {
            // 源不在缓存里，让目标目录下次重新列出
            if let Some(dir) = vfs.get_node(to_parent) {
                vfs.invalidate(dir);
            }
        }
        drop(vfs);
        self.interact
            .logger
            .message(&format!("rename: {} -> {}", from, to));
        Ok(())
    }

    // ============ 批量 ============

    pub async fn upload_all_in(&self, task: &Task, workpath: &str) -> Result<TaskList> {
        let mut list = TaskList::new();
        let local = self.local_path(workpath);
        let entry = local_stat(&local)
            .await?
            .ok_or_else(|| SyncError::not_found(&local.display().to_string()))?;

        if entry.kind == FileType::Directory {
            let remote = self.stat_in(task, workpath, ListOptions::default()).await?;
            let exists = remote.as_ref().map_or(false, NodeInfo::is_dir);
            if workpath != "/" && !exists {
                list.insert(workpath, TaskOp::Mkdir);
            }
            self.walk_upload(task, workpath, exists, &mut list).await?;
        } else {
            let remote = self.stat_in(task, workpath, ListOptions::default()).await?;
            if let Some(op) = self.comparator().upload_action(&entry, remote.as_ref()) {
                list.insert(workpath, op);
            }
        }
        Ok(list)
    }

    fn walk_upload<'a>(
        &'a self,
        task: &'a Task,
        workpath: &'a str,
        remote_exists: bool,
        list: &'a mut TaskList,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            task.check_cancelled()?;
            let cmp = self.comparator();
            let ignore = self.ignore();
            let locals = scan_dir(&self.local_path(workpath)).await?;
            let remotes: HashMap<String, NodeInfo> = if remote_exists {
                self.list_in(task, workpath, ListOptions::default())
                    .await?
                    .into_iter()
                    .map(|n| (n.name.clone(), n))
                    .collect()
            } else {
                HashMap::new()
            };

            for entry in locals {
                let child = join_workpath(workpath, &entry.name);
                if ignore.is_ignored(&child, entry.kind == FileType::Directory) {
                    continue;
                }
                let remote = remotes.get(&entry.name);
                if let Some(op) = cmp.upload_action(&entry, remote) {
                    list.insert(child.clone(), op);
                }
                if entry.kind == FileType::Directory {
                    let exists = remote.map_or(false, NodeInfo::is_dir);
                    self.walk_upload(task, &child, exists, list).await?;
                }
            }
            Ok(())
        })
    }

    pub async fn download_all_in(&self, task: &Task, workpath: &str) -> Result<TaskList> {
        let mut list = TaskList::new();
        let remote = self
            .stat_in(task, workpath, ListOptions::default())
            .await?
            .ok_or_else(|| SyncError::not_found(workpath))?;
        let local = local_stat(&self.local_path(workpath)).await?;

        if remote.is_dir() {
            if workpath != "/" {
                if let Some(op) = self.comparator().download_action(&remote, local.as_ref()) {
                    list.insert(workpath, op);
                }
            }
            self.walk_download(task, workpath, &mut list).await?;
        } else if let Some(op) = self.comparator().download_action(&remote, local.as_ref()) {
            list.insert(workpath, op);
        }
        Ok(list)
    }

    fn walk_download<'a>(
        &'a self,
        task: &'a Task,
        workpath: &'a str,
        list: &'a mut TaskList,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            task.check_cancelled()?;
            let cmp = self.comparator();
            let ignore = self.ignore();
            let remotes = self.list_in(task, workpath, ListOptions::default()).await?;
            let locals: HashMap<String, _> = scan_dir(&self.local_path(workpath))
                .await?
                .into_iter()
                .map(|e| (e.name.clone(), e))
                .collect();

            for node in remotes {
                let child = join_workpath(workpath, &node.name);
                if ignore.is_ignored(&child, node.is_dir()) {
                    continue;
                }
                if let Some(op) = cmp.download_action(&node, locals.get(&node.name)) {
                    list.insert(child.clone(), op);
                }
                if node.is_dir() {
                    self.walk_download(task, &child, list).await?;
                }
            }
            Ok(())
        })
    }

    pub async fn clean_all_in(&self, task: &Task, workpath: &str) -> Result<TaskList> {
        let mut list = TaskList::new();
        self.walk_clean(task, workpath, &mut list).await?;
        Ok(list)
    }

    fn walk_clean<'a>(
        &'a self,
        task: &'a Task,
        workpath: &'a str,
        list: &'a mut TaskList,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            task.check_cancelled()?;
            let cmp = self.comparator();
            let ignore = self.ignore();
            let remotes = self.list_in(task, workpath, ListOptions::default()).await?;
            let locals: HashMap<String, _> = scan_dir(&self.local_path(workpath))
                .await?
                .into_iter()
                .map(|e| (e.name.clone(), e))
                .collect();

            for node in remotes {
                let child = join_workpath(workpath, &node.name);
                if ignore.is_ignored(&child, node.is_dir()) {
                    continue;
                }
                let local = locals.get(&node.name);
                if let Some(op) = cmp.clean_action(&node, local) {
                    // 只记录缺失子树的顶层，删除时会递归
                    list.insert(child, op);
                } else if node.is_dir() && local.map_or(false, |l| l.kind == FileType::Directory) {
                    self.walk_clean(task, &child, list).await?;
                }
            }
            Ok(())
        })
    }

    pub async fn exec_task_list_in(&self, task: &Task, list: TaskList) -> Result<BatchResult> {
        let mut result = BatchResult::default();
        let opts = TransferOptions {
            batch: true,
            ..TransferOptions::default()
        };

        for (workpath, op) in list {
            task.check_cancelled()?;
            result.count += 1;
            debug!("执行 {}: {}", workpath, op);
            match self.exec_op_in(task, &workpath, &op, opts).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    self.interact
                        .logger
                        .error(&format!("{} {}: {}", op, workpath, e));
                    result.failed_tasks.insert(workpath.clone(), op);
                    result.errors.push((workpath, e));
                }
            }
        }
        Ok(result)
    }

    async fn exec_op_in(
        &self,
        task: &Task,
        workpath: &str,
        op: &TaskOp,
        opts: TransferOptions,
    ) -> Result<Outcome> {
        match op {
            TaskOp::Upload => self.upload_in(task, workpath, opts).await,
            TaskOp::Download => self.download_in(task, workpath, opts).await,
            TaskOp::Delete => self.delete_in(task, workpath).await.map(|_| Outcome::Done),
            TaskOp::Mkdir => self.mkdir_in(task, workpath).await.map(|_| Outcome::Done),
            TaskOp::UploadFrom(src) => self.upload_as_in(task, src, workpath, opts).await,
            TaskOp::UploadTo(dst) => self.upload_as_in(task, workpath, dst, opts).await,
            TaskOp::DownloadFrom(src) => self.download_as_in(task, src, workpath, opts).await,
            TaskOp::DownloadTo(dst) => self.download_as_in(task, workpath, dst, opts).await,
        }
    }
}

/// 把下载流写入本地文件，返回写入字节数
async fn write_stream(mut stream: ByteStream, target: &Path) -> Result<u64> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(target).await?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::interact::{Confirm, NoPrompt, TracingLogger};
    use crate::storage::mock::{MockFactory, MockRemote};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn setup_with(
        confirm_batch: bool,
        interact: Interact,
    ) -> (TempDir, Arc<MockRemote>, Arc<SyncCacher>) {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        let cacher = SyncCacher::with_factory(
            dir.path(),
            ServerConfig::default(),
            IgnoreMatcher::new(&WorkspaceConfig::default().ignore),
            confirm_batch,
            interact,
            Arc::new(MockFactory {
                remote: remote.clone(),
            }),
        );
        (dir, remote, cacher)
    }

    fn setup() -> (TempDir, Arc<MockRemote>, Arc<SyncCacher>) {
        setup_with(false, Interact::default())
    }

    fn touch_forward(path: &Path, secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    fn policy(policy: ModifiedPolicy, batch: bool) -> TransferOptions {
        TransferOptions {
            when_remote_modified: Some(policy),
            batch,
        }
    }

    #[test]
    fn test_path_mapping() {
        assert_eq!(normalize_workpath("a//b/./c/"), "/a/b/c");
        assert_eq!(normalize_workpath(""), "/");
        assert_eq!(join_workpath("/", "x"), "/x");
        assert_eq!(join_workpath("/a", "x"), "/a/x");
    }

    #[tokio::test]
    async fn test_upload_then_latest() {
        let (dir, remote, cacher) = setup();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let outcome = cacher.upload("/a.txt", TransferOptions::default()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(remote.file("/a.txt").unwrap(), b"hello");

        let outcome = cacher.upload("a.txt", TransferOptions::default()).await.unwrap();
        assert_eq!(outcome, Outcome::Latest);
        assert_eq!(remote.calls("upload"), 1);

        // 目录已经重新列出过，再次判断完全不访问网络
        let before = remote.network_calls();
        let outcome = cacher.upload("/a.txt", TransferOptions::default()).await.unwrap();
        assert_eq!(outcome, Outcome::Latest);
        assert_eq!(remote.network_calls(), before);
    }

    #[tokio::test]
    async fn test_remote_modified_policies() {
        let (dir, remote, cacher) = setup();
        let local = dir.path().join("a.txt");
        fs::write(&local, b"one").unwrap();
        cacher.upload("/a.txt", TransferOptions::default()).await.unwrap();

        remote.add_file("/a.txt", b"changed elsewhere");
        touch_forward(&local, 10);

        let err = cacher
            .upload("/a.txt", policy(ModifiedPolicy::Error, false))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Modified));

        let outcome = cacher
            .upload("/a.txt", policy(ModifiedPolicy::Ignore, false))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped);

        match cacher
            .upload("/a.txt", policy(ModifiedPolicy::Diff, false))
            .await
            .unwrap()
        {
            Outcome::Diff {
                local: diff_local,
                remote_copy,
            } => {
                assert_eq!(diff_local, local);
                assert_eq!(fs::read(&remote_copy).unwrap(), b"changed elsewhere");
                fs::remove_file(remote_copy).unwrap();
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // 批量执行中 diff 按 error 处理
        let err = cacher
            .upload("/a.txt", policy(ModifiedPolicy::Diff, true))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Modified));
        assert_eq!(remote.calls("upload"), 1);

        let outcome = cacher
            .upload("/a.txt", policy(ModifiedPolicy::Upload, false))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(remote.file("/a.txt").unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_upload_creates_missing_parents() {
        let (dir, remote, cacher) = setup();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("x/y/z.txt"), b"z").unwrap();

        let outcome = cacher.upload("/x/y/z.txt", TransferOptions::default()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(remote.exists("/x"));
        assert!(remote.exists("/x/y"));
        assert_eq!(remote.file("/x/y/z.txt").unwrap(), b"z");

        cacher.mkdir("/p/q/r").await.unwrap();
        assert!(remote.exists("/p/q/r"));
        // 已缓存的目录不再请求
        let before = remote.calls("mkdir");
        cacher.mkdir("/p/q/r").await.unwrap();
        assert_eq!(remote.calls("mkdir"), before);
    }

    #[tokio::test]
    async fn test_missing_parents_recreated_despite_cache() {
        let (dir, remote, cacher) = setup();
        remote.add_dir("/a");
        remote.add_dir("/a/b");
        for path in ["/", "/a", "/a/b"] {
            cacher.list(path, ListOptions::default()).await.unwrap();
        }
        // 缓存仍然新鲜，服务器上的整条目录链已被删除
        remote.remove("/a");

        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c.txt"), b"c").unwrap();
        let outcome = cacher.upload("/a/b/c.txt", TransferOptions::default()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(remote.exists("/a/b"));
        assert_eq!(remote.file("/a/b/c.txt").unwrap(), b"c");

        remote.remove("/a");
        cacher.mkdir("/a/b/d").await.unwrap();
        assert!(remote.exists("/a/b/d"));

        remote.remove("/a");
        remote.add_file("/x.txt", b"x");
        cacher.rename("/x.txt", "/a/b/y.txt").await.unwrap();
        assert_eq!(remote.file("/a/b/y.txt").unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_recursive_delete_with_stale_cache() {
        let (_dir, remote, cacher) = setup();
        remote.add_dir("/d");
        remote.add_dir("/d/e");
        remote.add_file("/d/e/f.txt", b"f");
        remote.add_file("/d/g.txt", b"g");
        remote.add_file("/keep.txt", b"k");

        let listed = cacher.list("/d", ListOptions::default()).await.unwrap();
        assert_eq!(listed.len(), 2);
        // 缓存之后远程新增了文件
        remote.add_file("/d/late.txt", b"late");

        cacher.delete("/d").await.unwrap();
        assert!(!remote.exists("/d"));
        assert!(!remote.exists("/d/late.txt"));
        assert!(remote.exists("/keep.txt"));

        let root = cacher.list("/", ListOptions::default()).await.unwrap();
        let names: Vec<_> = root.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["keep.txt"]);

        // 不存在的路径视为已删除
        cacher.delete("/nothing").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_cache_ttl() {
        let (_dir, remote, cacher) = setup();
        remote.add_file("/a.txt", b"a");

        cacher.list("/", ListOptions::default()).await.unwrap();
        cacher.list("/", ListOptions::default()).await.unwrap();
        assert_eq!(remote.calls("list"), 1);

        cacher.list("/", ListOptions::force()).await.unwrap();
        assert_eq!(remote.calls("list"), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        let opts = ListOptions {
            do_not_refresh: true,
            ..ListOptions::default()
        };
        cacher.list("/", opts).await.unwrap();
        assert_eq!(remote.calls("list"), 2);

        cacher.list("/", ListOptions::default()).await.unwrap();
        assert_eq!(remote.calls("list"), 3);
    }

    #[tokio::test]
    async fn test_listing_missing_directory_creates_nothing() {
        let (_dir, remote, cacher) = setup();
        assert!(cacher.list("/ghost", ListOptions::default()).await.unwrap().is_empty());
        assert!(cacher.vfs_mut().await.get_node("/ghost").is_none());
        assert!(cacher.stat("/ghost/x", ListOptions::default()).await.unwrap().is_none());
        assert!(!remote.exists("/ghost"));
    }

    #[tokio::test]
    async fn test_upload_all_builds_task_list() {
        let (dir, remote, cacher) = setup();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();
        fs::create_dir(dir.path().join(WORKSPACE_DIR)).unwrap();
        fs::write(dir.path().join(WORKSPACE_DIR).join("cache.json"), b"{}").unwrap();

        let list = cacher.upload_all("/").await.unwrap();
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            serde_json::json!({"/a.txt": "upload", "/sub": "mkdir", "/sub/c.txt": "upload"})
        );

        let result = cacher.run_task_list(list).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(result.count, 3);
        assert_eq!(remote.file("/sub/c.txt").unwrap(), b"c");
        assert!(!remote.exists("/.ftpsync"));

        assert!(cacher.upload_all("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_download_all_and_clean_all() {
        let (dir, remote, cacher) = setup();
        remote.add_dir("/r");
        remote.add_file("/r/x.txt", b"x");
        remote.add_file("/top.txt", b"t");

        let list = cacher.download_all("/").await.unwrap();
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            serde_json::json!({"/r": "download", "/r/x.txt": "download", "/top.txt": "download"})
        );
        cacher.run_task_list(list).await.unwrap();
        assert_eq!(fs::read(dir.path().join("r/x.txt")).unwrap(), b"x");

        let again = cacher.download("/r/x.txt", TransferOptions::default()).await.unwrap();
        assert_eq!(again, Outcome::Latest);
        assert_eq!(remote.calls("download"), 2);

        fs::remove_dir_all(dir.path().join("r")).unwrap();
        let list = cacher.clean_all("/").await.unwrap();
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            serde_json::json!({"/r": "delete"})
        );
        cacher.run_task_list(list).await.unwrap();
        assert!(!remote.exists("/r"));
        assert!(remote.exists("/top.txt"));
    }

    /// 第一次询问时创建缺失的本地文件，然后选择重试
    struct CreateOnRetry {
        path: PathBuf,
        asked: Mutex<usize>,
    }

    #[async_trait]
    impl Confirm for CreateOnRetry {
        async fn confirm(&self, _question: &str, actions: &[ConfirmAction]) -> Option<ConfirmAction> {
            *self.asked.lock().unwrap() += 1;
            if actions.contains(&ConfirmAction::Retry) {
                fs::write(&self.path, b"late").unwrap();
            }
            actions.first().copied()
        }
    }

    #[tokio::test]
    async fn test_batch_retries_failed_subset() {
        let workspace = tempfile::tempdir().unwrap();
        let confirm = Arc::new(CreateOnRetry {
            path: workspace.path().join("missing.txt"),
            asked: Mutex::new(0),
        });
        let interact = Interact {
            logger: Arc::new(TracingLogger),
            confirm: confirm.clone(),
            prompt: Arc::new(NoPrompt),
        };
        let remote = MockRemote::new();
        let cacher = SyncCacher::with_factory(
            workspace.path(),
            ServerConfig::default(),
            IgnoreMatcher::default(),
            true,
            interact,
            Arc::new(MockFactory {
                remote: remote.clone(),
            }),
        );
        fs::write(workspace.path().join("a.txt"), b"a").unwrap();

        let list: TaskList = [
            ("/a.txt".to_string(), TaskOp::Upload),
            ("/missing.txt".to_string(), TaskOp::Upload),
        ]
        .into_iter()
        .collect();
        let result = cacher.run_task_list(list).await.unwrap();

        // 一次批量确认，一次重试确认
        assert_eq!(*confirm.asked.lock().unwrap(), 2);
        assert!(result.is_ok());
        assert_eq!(result.count, 1);
        assert_eq!(remote.calls("upload"), 2);
        assert_eq!(remote.file("/missing.txt").unwrap(), b"late");
        assert!(!workspace.path().join(WORKSPACE_DIR).join(TASKS_FILE).exists());
    }

    #[tokio::test]
    async fn test_cache_file_roundtrip_keeps_lmtime() {
        let (dir, remote, cacher) = setup();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        cacher.upload("/a.txt", TransferOptions::default()).await.unwrap();

        let cache_path = dir.path().join(WORKSPACE_DIR).join("cache.json");
        cacher.save_cache(&cache_path).await.unwrap();

        let restored = SyncCacher::with_factory(
            dir.path(),
            ServerConfig::default(),
            IgnoreMatcher::default(),
            false,
            Interact::default(),
            Arc::new(MockFactory {
                remote: remote.clone(),
            }),
        );
        assert!(restored.load_cache(&cache_path).await.unwrap());
        let outcome = restored.upload("/a.txt", TransferOptions::default()).await.unwrap();
        assert_eq!(outcome, Outcome::Latest);
        assert_eq!(remote.calls("upload"), 1);

        let mut other = ServerConfig::default();
        other.host = "elsewhere".into();
        let unrelated = SyncCacher::with_factory(
            dir.path(),
            other,
            IgnoreMatcher::default(),
            false,
            Interact::default(),
            Arc::new(MockFactory { remote }),
        );
        assert!(!unrelated.load_cache(&cache_path).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_creates_target_parent() {
        let (_dir, remote, cacher) = setup();
        remote.add_file("/a.txt", b"a");
        cacher.list("/", ListOptions::default()).await.unwrap();

        cacher.rename("/a.txt", "/new/dir/b.txt").await.unwrap();
        assert_eq!(remote.file("/new/dir/b.txt").unwrap(), b"a");
        assert!(cacher.stat("/a.txt", ListOptions::default()).await.unwrap().is_none());
        let moved = cacher
            .stat("/new/dir/b.txt", ListOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.size, 1);
    }

    #[tokio::test]
    async fn test_remote_path_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        let mut config = ServerConfig::default();
        config.remote_path = "/srv/www/".into();
        let cacher = SyncCacher::with_factory(
            dir.path(),
            config,
            IgnoreMatcher::default(),
            false,
            Interact::default(),
            Arc::new(MockFactory {
                remote: remote.clone(),
            }),
        );
        assert_eq!(cacher.remote_path("/"), "/srv/www");
        assert_eq!(cacher.remote_path("a/b"), "/srv/www/a/b");
        assert_eq!(cacher.local_path("/a/b"), dir.path().join("a/b"));

        fs::write(dir.path().join("i.html"), b"<p>").unwrap();
        cacher.upload("/i.html", TransferOptions::default()).await.unwrap();
        assert_eq!(remote.file("/srv/www/i.html").unwrap(), b"<p>");
    }
}
