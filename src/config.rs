//! 工作区与服务器配置

use crate::core::conflict::ModifiedPolicy;
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 工作区内部目录名（配置、缓存、日志都放在这里）
pub const WORKSPACE_DIR: &str = ".ftpsync";

/// 远程协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Sftp,
    /// 本地目录镜像，远程路径直接映射到本机文件系统
    File,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Sftp => "sftp",
            Protocol::File => "file",
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Ftp
    }
}

/// 服务器身份：(protocol, user, host, port)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub protocol: Protocol,
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl ServerId {
    /// 用作缓存文件里的 key
    pub fn host_uri(&self) -> String {
        format!(
            "{}://{}@{}:{}",
            self.protocol.as_str(),
            urlencoding::encode(&self.user),
            self.host,
            self.port
        )
    }
}

/// 单个服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// 与工作区根目录对应的远程目录
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    /// 目录列表缓存有效期（秒）
    #[serde(default = "default_refresh_time")]
    pub refresh_time: u64,
    /// 本地与远程时钟偏差容忍（毫秒）
    #[serde(default = "default_time_threshold")]
    pub time_threshold: i64,
    /// 命令无响应判定时长（毫秒）
    #[serde(default = "default_block_detecting_duration")]
    pub block_detecting_duration: u64,
    /// 空闲断开时长（毫秒）
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// 建立连接超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// 任务排队启动时限（毫秒），不设置表示无限等待
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_start_timeout: Option<u64>,
    /// 会话内记住用户输入的密码
    #[serde(default = "default_remember_password")]
    pub remember_password: bool,
    #[serde(default)]
    pub when_remote_modified: ModifiedPolicy,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_username() -> String {
    "anonymous".to_string()
}

fn default_remote_path() -> String {
    "/".to_string()
}

fn default_refresh_time() -> u64 {
    60
}

fn default_time_threshold() -> i64 {
    1000
}

fn default_block_detecting_duration() -> u64 {
    8000
}

fn default_connection_timeout() -> u64 {
    60_000
}

fn default_connect_timeout() -> u64 {
    15_000
}

fn default_remember_password() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: None,
            protocol: Protocol::default(),
            host: default_host(),
            port: None,
            username: default_username(),
            password: None,
            private_key: None,
            passphrase: None,
            remote_path: default_remote_path(),
            refresh_time: default_refresh_time(),
            time_threshold: default_time_threshold(),
            block_detecting_duration: default_block_detecting_duration(),
            connection_timeout: default_connection_timeout(),
            connect_timeout: default_connect_timeout(),
            task_start_timeout: None,
            remember_password: default_remember_password(),
            when_remote_modified: ModifiedPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn default_port(&self) -> u16 {
        match self.protocol {
            Protocol::Ftp => 21,
            Protocol::Sftp => 22,
            Protocol::File => 0,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.default_port())
    }

    pub fn server_id(&self) -> ServerId {
        ServerId {
            protocol: self.protocol,
            user: self.username.clone(),
            host: self.host.clone(),
            port: self.port(),
        }
    }

    /// 显示名称（日志用）
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.server_id().host_uri())
    }

    /// 连接指纹：协议、凭据、主机、端口任一变化都意味着需要重新连接
    pub fn fingerprint(&self) -> String {
        let material = serde_json::json!([
            self.protocol.as_str(),
            self.username,
            self.password,
            self.private_key,
            self.passphrase,
            self.host,
            self.port(),
        ]);
        let hash = blake3::hash(material.to_string().as_bytes());
        hash.to_hex()[..16].to_string()
    }

    /// 是否需要密码才能登录
    pub fn needs_password(&self) -> bool {
        match self.protocol {
            Protocol::Ftp => self.username != "anonymous",
            Protocol::Sftp => self.private_key.is_none(),
            Protocol::File => false,
        }
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_time)
    }

    pub fn block_detecting(&self) -> Duration {
        Duration::from_millis(self.block_detecting_duration)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    pub fn connect_deadline(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn task_start_deadline(&self) -> Option<Duration> {
        self.task_start_timeout.map(Duration::from_millis)
    }
}

/// 工作区配置：主服务器字段平铺在顶层
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    #[serde(flatten)]
    pub main: ServerConfig,
    #[serde(default)]
    pub alt_servers: Vec<ServerConfig>,
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    /// 批量操作执行前是否需要确认
    #[serde(default)]
    pub confirm_batch: bool,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_ignore() -> Vec<String> {
    vec![
        ".git/**".to_string(),
        format!("{}/**", WORKSPACE_DIR),
    ]
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            main: ServerConfig::default(),
            alt_servers: Vec::new(),
            ignore: default_ignore(),
            confirm_batch: false,
            log: LogConfig::default(),
        }
    }
}

impl WorkspaceConfig {
    pub fn config_path(workspace: &Path) -> PathBuf {
        workspace.join(WORKSPACE_DIR).join("config.json")
    }

    /// 从工作区加载配置
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = Self::config_path(workspace);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("无法读取配置文件 {:?}", path))?;
        Self::parse(&content).with_context(|| format!("配置文件格式错误 {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: WorkspaceConfig = serde_json::from_str(content)?;
        // 工作区目录总是忽略
        let own = format!("{}/**", WORKSPACE_DIR);
        if !config.ignore.contains(&own) {
            config.ignore.push(own);
        }
        Ok(config)
    }

    /// 保存配置
    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::config_path(workspace);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// 所有服务器，主服务器在前
    pub fn servers(&self) -> impl Iterator<Item = &ServerConfig> {
        std::iter::once(&self.main).chain(self.alt_servers.iter())
    }
}
