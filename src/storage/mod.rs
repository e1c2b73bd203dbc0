pub mod ftp;
pub mod local;
pub mod sftp;

#[cfg(test)]
pub(crate) mod mock;

use crate::config::{Protocol, ServerConfig};
use crate::error::{ErrorCode, Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub use ftp::FtpConnection;
pub use local::LocalConnection;
pub use sftp::SftpConnection;

/// 远程条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    SymLink,
}

impl FileType {
    /// `ls -l` 风格的类型字符
    pub fn symbol(&self) -> &'static str {
        match self {
            FileType::File => "-",
            FileType::Directory => "d",
            FileType::SymLink => "l",
        }
    }
}

/// 列表中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub kind: FileType,
    pub size: u64,
    /// 远程修改时间（毫秒）
    pub date: i64,
    pub link: Option<String>,
}

impl FileInfo {
    pub fn file(name: impl Into<String>, size: u64, date: i64) -> Self {
        Self {
            name: name.into(),
            kind: FileType::File,
            size,
            date,
            link: None,
        }
    }

    pub fn directory(name: impl Into<String>, date: i64) -> Self {
        Self {
            name: name.into(),
            kind: FileType::Directory,
            size: 0,
            date,
            link: None,
        }
    }
}

/// 下载得到的字节流
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// 远程连接抽象接口
///
/// 所有实现都把原生错误翻译为 [`ErrorCode`]。列出不存在的目录返回空列表。
#[async_trait]
pub trait Connection: Send + Sync {
    /// 建立连接并登录
    async fn connect(&self, password: Option<&str>) -> Result<()>;

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// 上传本地文件
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    async fn download(&self, remote: &str) -> Result<ByteStream>;

    /// 直接写入内存数据
    async fn write(&self, data: Bytes, remote: &str) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn rmdir(&self, path: &str) -> Result<()>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn readlink(&self, path: &str) -> Result<String>;

    async fn pwd(&self) -> Result<String>;

    /// 强制关闭底层套接字，不等待进行中的命令
    fn terminate(&self);

    /// 获取连接名称（用于日志）
    fn name(&self) -> &str;
}

/// 连接构造器，管理器通过它创建（和重建）连接
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Connection>>;
}

/// 按协议选择实现
#[derive(Debug, Default, Clone)]
pub struct ProtocolFactory;

impl ConnectionFactory for ProtocolFactory {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Connection>> {
        create_connection(config)
    }
}

/// 根据配置创建连接实例（尚未连接）
pub fn create_connection(config: &ServerConfig) -> Result<Arc<dyn Connection>> {
    match config.protocol {
        Protocol::Ftp => {
            tracing::debug!("创建 FTP 连接: {}:{}", config.host, config.port());
            Ok(Arc::new(FtpConnection::new(config)) as Arc<dyn Connection>)
        }
        Protocol::Sftp => {
            tracing::debug!("创建 SFTP 连接: {}:{}", config.host, config.port());
            Ok(Arc::new(SftpConnection::new(config)) as Arc<dyn Connection>)
        }
        Protocol::File => {
            tracing::debug!("创建本地连接");
            Ok(Arc::new(LocalConnection::new("/")) as Arc<dyn Connection>)
        }
    }
}

/// 未连接时调用命令：让管理器重连后重试
pub(crate) fn not_connected() -> SyncError {
    SyncError::protocol(ErrorCode::ReconnectAndRetryOnce, "not connected")
}

/// 阻塞线程的 join 错误
pub(crate) fn join_error(e: tokio::task::JoinError) -> SyncError {
    SyncError::Other(anyhow::Error::new(e))
}

pub(crate) fn system_time_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 远程路径的父目录与文件名
pub(crate) fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => (".", trimmed),
    }
}
