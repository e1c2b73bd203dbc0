//! 工作区：配置、每个服务器一个缓存器、共享缓存文件

use crate::config::{ServerConfig, WorkspaceConfig, WORKSPACE_DIR};
use crate::core::{IgnoreMatcher, SyncCacher};
use crate::events::AsyncEvent;
use crate::interact::Interact;
use crate::storage::{ConnectionFactory, ProtocolFactory};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// 缓存文件名
pub const CACHE_FILE: &str = "cache.json";

#[derive(Default)]
struct Loaded {
    config: Option<WorkspaceConfig>,
    servers: Vec<Arc<SyncCacher>>,
}

pub struct Workspace {
    root: PathBuf,
    interact: Interact,
    factory: Arc<dyn ConnectionFactory>,
    loaded: Mutex<Loaded>,
    /// 配置加载成功（包括重新加载）
    pub on_load_config: AsyncEvent<WorkspaceConfig>,
    /// 配置文件缺失或格式错误，参数为错误描述
    pub on_invalid_config: AsyncEvent<String>,
    pub on_unload: AsyncEvent<()>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, interact: Interact) -> Self {
        Self::with_factory(root, interact, Arc::new(ProtocolFactory))
    }

    pub fn with_factory(
        root: impl Into<PathBuf>,
        interact: Interact,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            root: root.into(),
            interact,
            factory,
            loaded: Mutex::new(Loaded::default()),
            on_load_config: AsyncEvent::new(),
            on_invalid_config: AsyncEvent::new(),
            on_unload: AsyncEvent::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Loaded> {
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_path(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR).join(CACHE_FILE)
    }

    pub fn config(&self) -> Option<WorkspaceConfig> {
        self.lock().config.clone()
    }

    /// 所有服务器，主服务器在前
    pub fn servers(&self) -> Vec<Arc<SyncCacher>> {
        self.lock().servers.clone()
    }

    pub fn main_server(&self) -> Option<Arc<SyncCacher>> {
        self.lock().servers.first().cloned()
    }

    /// 按名称或 host_uri 查找服务器
    pub fn server(&self, name: &str) -> Option<Arc<SyncCacher>> {
        self.lock()
            .servers
            .iter()
            .find(|s| {
                let config = s.config();
                config.name.as_deref() == Some(name) || config.server_id().host_uri() == name
            })
            .cloned()
    }

    /// 读取（或重新读取）配置文件
    ///
    /// 同一服务器身份的缓存器会保留下来，只更新配置；连接参数变化时由
    /// 连接管理器自行断开。
    pub async fn load(&self) -> Result<WorkspaceConfig> {
        let config = match WorkspaceConfig::load(&self.root) {
            Ok(config) => config,
            Err(e) => {
                warn!("配置无效: {:#}", e);
                self.on_invalid_config.fire(format!("{:#}", e)).await?;
                return Err(e);
            }
        };

        let mut previous = std::mem::take(&mut self.lock().servers);
        let ignore = IgnoreMatcher::new(&config.ignore);
        let cache_path = self.cache_path();
        let mut servers = Vec::new();

        for server in config.servers() {
            let id = server.server_id();
            // 每个旧缓存器最多沿用一次，身份相同的两个服务器各有自己的缓存器
            let reused = previous
                .iter()
                .position(|s| s.config().server_id() == id)
                .map(|i| previous.remove(i));
            let cacher = match reused {
                Some(cacher) => {
                    debug!("沿用服务器 {}", server.display_name());
                    cacher.set_config(server.clone()).await;
                    cacher.set_options(ignore.clone(), config.confirm_batch);
                    cacher
                }
                None => {
                    let cacher = self.create_cacher(server.clone(), ignore.clone(), &config);
                    if let Err(e) = cacher.load_cache(&cache_path).await {
                        warn!("读取缓存失败 {}: {}", server.display_name(), e);
                    }
                    cacher
                }
            };
            servers.push(cacher);
        }

        // 配置里已经没有的服务器
        for old in previous {
            info!("移除服务器 {}", old.config().display_name());
            old.cancel();
            old.disconnect().await;
        }

        {
            let mut loaded = self.lock();
            loaded.servers = servers;
            loaded.config = Some(config.clone());
        }
        info!("已加载工作区配置: {:?}", self.root);
        self.on_load_config.fire(config.clone()).await?;
        Ok(config)
    }

    fn create_cacher(
        &self,
        server: ServerConfig,
        ignore: IgnoreMatcher,
        config: &WorkspaceConfig,
    ) -> Arc<SyncCacher> {
        SyncCacher::with_factory(
            self.root.clone(),
            server,
            ignore,
            config.confirm_batch,
            self.interact.clone(),
            self.factory.clone(),
        )
    }

    /// 把所有服务器的树写入缓存文件
    pub async fn save_cache(&self) -> Result<()> {
        let path = self.cache_path();
        for server in self.servers() {
            server
                .save_cache(&path)
                .await
                .with_context(|| format!("无法写入缓存 {:?}", path))?;
        }
        Ok(())
    }

    /// 保存缓存、断开所有连接，按逆序通知监听者
    pub async fn unload(&self) -> Result<()> {
        if self.lock().config.is_none() {
            return Ok(());
        }
        if let Err(e) = self.save_cache().await {
            warn!("{:#}", e);
        }
        let servers = std::mem::take(&mut self.lock().servers);
        for server in &servers {
            server.cancel();
            server.disconnect().await;
        }
        self.lock().config = None;
        self.on_unload.rfire(()).await
    }

    /// 本地路径转工作路径，不在工作区内返回 `None`
    pub fn workpath_of(&self, local: &Path) -> Option<String> {
        let rel = local.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(format!("/{}", parts.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransferOptions;
    use crate::storage::mock::{MockFactory, MockRemote};
    use std::fs;

    fn write_config(root: &Path, json: &str) {
        let dir = root.join(WORKSPACE_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.json"), json).unwrap();
    }

    fn workspace(root: &Path, remote: &Arc<MockRemote>) -> Workspace {
        Workspace::with_factory(
            root,
            Interact::default(),
            Arc::new(MockFactory {
                remote: remote.clone(),
            }),
        )
    }

    #[tokio::test]
    async fn test_load_reload_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        let ws = workspace(dir.path(), &remote);

        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        ws.on_load_config.on(move |config: WorkspaceConfig| {
            let e = e.clone();
            async move {
                e.lock().unwrap().push(format!("load {}", config.main.host));
                Ok(())
            }
        });
        let e = events.clone();
        ws.on_invalid_config.on(move |_msg: String| {
            let e = e.clone();
            async move {
                e.lock().unwrap().push("invalid".to_string());
                Ok(())
            }
        });

        assert!(ws.load().await.is_err());

        write_config(
            dir.path(),
            r#"{"host": "a", "altServers": [{"name": "backup", "host": "b"}]}"#,
        );
        ws.load().await.unwrap();
        assert_eq!(ws.servers().len(), 2);
        assert!(ws.server("backup").is_some());
        let main = ws.main_server().unwrap();

        // 主服务器身份不变，缓存器沿用；备份服务器被移除
        write_config(dir.path(), r#"{"host": "a", "refreshTime": 5}"#);
        ws.load().await.unwrap();
        assert_eq!(ws.servers().len(), 1);
        assert!(Arc::ptr_eq(&main, &ws.main_server().unwrap()));
        assert_eq!(main.config().refresh_time, 5);
        assert!(ws.server("backup").is_none());

        assert_eq!(*events.lock().unwrap(), vec!["invalid", "load a", "load a"]);
    }

    #[tokio::test]
    async fn test_same_identity_servers_keep_separate_cachers() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        let ws = workspace(dir.path(), &remote);
        let json = r#"{"host": "a", "altServers": [{"name": "mirror", "host": "a", "remotePath": "/www"}]}"#;
        write_config(dir.path(), json);

        ws.load().await.unwrap();
        let first = ws.servers();
        assert!(!Arc::ptr_eq(&first[0], &first[1]));

        ws.load().await.unwrap();
        let second = ws.servers();
        assert_eq!(second.len(), 2);
        assert!(!Arc::ptr_eq(&second[0], &second[1]));
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert!(Arc::ptr_eq(&first[1], &second[1]));
        assert_eq!(second[1].config().remote_path, "/www");
    }

    #[tokio::test]
    async fn test_unload_saves_cache() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        write_config(dir.path(), r#"{"host": "a"}"#);
        fs::write(dir.path().join("x.txt"), b"x").unwrap();

        let ws = workspace(dir.path(), &remote);
        ws.load().await.unwrap();
        let main = ws.main_server().unwrap();
        main.upload("/x.txt", TransferOptions::default()).await.unwrap();

        let unloaded = Arc::new(Mutex::new(false));
        let u = unloaded.clone();
        ws.on_unload.on(move |_| {
            let u = u.clone();
            async move {
                *u.lock().unwrap() = true;
                Ok(())
            }
        });
        ws.unload().await.unwrap();
        assert!(*unloaded.lock().unwrap());
        assert!(ws.servers().is_empty());

        let cache: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(ws.cache_path()).unwrap()).unwrap();
        assert_eq!(cache["$version"], 1);
        assert_eq!(cache["ftp://anonymous@a:21"]["x.txt"]["size"], 1);
    }

    #[test]
    fn test_workpath_of() {
        let ws = Workspace::new("/home/me/site", Interact::default());
        assert_eq!(
            ws.workpath_of(Path::new("/home/me/site/a/b.txt")).as_deref(),
            Some("/a/b.txt")
        );
        assert_eq!(ws.workpath_of(Path::new("/home/me/site")).as_deref(), Some("/"));
        assert_eq!(ws.workpath_of(Path::new("/etc/passwd")), None);
    }
}
