use super::{join_error, not_connected, split_parent, system_time_ms, ByteStream, Connection, FileInfo, FileType};
use crate::config::ServerConfig;
use crate::error::{ErrorCode, Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::io::Cursor;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use suppaftp::types::FileType as TransferType;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::{debug, info};

/// 出错的是哪类命令，决定 550 的含义
#[derive(Debug, Clone, Copy)]
enum Command {
    /// STOR / RNTO
    Store,
    Mkdir,
    Rmdir,
    Other,
}

/// 基于 suppaftp 同步客户端的 FTP 连接，命令在阻塞线程上执行
pub struct FtpConnection {
    host: String,
    port: u16,
    username: String,
    connect_timeout: Duration,
    name: String,
    stream: Arc<Mutex<Option<FtpStream>>>,
    /// 控制连接套接字的副本，用于从其他线程强制关闭
    socket: Mutex<Option<TcpStream>>,
}

impl FtpConnection {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port(),
            username: config.username.clone(),
            connect_timeout: config.connect_deadline(),
            name: format!("ftp://{}@{}:{}", config.username, config.host, config.port()),
            stream: Arc::new(Mutex::new(None)),
            socket: Mutex::new(None),
        }
    }

    /// 在阻塞线程上对当前会话执行命令
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let stream = self.stream.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = stream.lock().unwrap_or_else(PoisonError::into_inner);
            let ftp = guard.as_mut().ok_or_else(not_connected)?;
            f(ftp)
        })
        .await
        .map_err(join_error)?
    }
}

fn reply_code(err: &FtpError) -> Option<u32> {
    match err {
        FtpError::UnexpectedResponse(resp) => Some(resp.status.code()),
        _ => None,
    }
}

fn reply_text(err: &FtpError) -> String {
    match err {
        FtpError::UnexpectedResponse(resp) => {
            String::from_utf8_lossy(&resp.body).trim().to_string()
        }
        other => other.to_string(),
    }
}

/// FTP 应答码到错误码的映射
fn map_error(err: FtpError, command: Command) -> SyncError {
    let text = reply_text(&err);
    if let FtpError::ConnectionError(_) = err {
        return SyncError::protocol(ErrorCode::ReconnectAndRetryOnce, text);
    }
    let code = match (reply_code(&err), command) {
        (Some(530), _) => return SyncError::connection(ErrorCode::AuthFailed, text),
        (Some(550) | Some(553), Command::Store) => Some(ErrorCode::RequestMkdir),
        (Some(550), Command::Mkdir) => Some(ErrorCode::RequestRecursive),
        (Some(550), Command::Rmdir) if text.to_lowercase().contains("not empty") => {
            Some(ErrorCode::RequestRecursive)
        }
        (Some(550), _) => Some(ErrorCode::FileNotFound),
        (Some(421), _) => Some(ErrorCode::ReconnectAndRetryOnce),
        _ => None,
    };
    match code {
        Some(code) => SyncError::protocol(code, text),
        None => SyncError::remote(text),
    }
}

/// 解析一行 LIST 输出
fn parse_list_line(line: &str) -> Option<FileInfo> {
    let file = suppaftp::list::File::from_str(line).ok()?;
    let name = file.name().to_string();
    if name == "." || name == ".." {
        return None;
    }
    let kind = if file.is_symlink() {
        FileType::SymLink
    } else if file.is_directory() {
        FileType::Directory
    } else {
        FileType::File
    };
    Some(FileInfo {
        name,
        kind,
        size: if kind == FileType::Directory {
            0
        } else {
            file.size() as u64
        },
        date: system_time_ms(file.modified()),
        link: file
            .symlink()
            .map(|p| p.to_string_lossy().replace('\\', "/")),
    })
}

fn list_blocking(ftp: &mut FtpStream, path: &str) -> Result<Vec<FileInfo>> {
    match ftp.list(Some(path)) {
        Ok(lines) => Ok(lines.iter().filter_map(|l| parse_list_line(l)).collect()),
        // 目录不存在时返回空列表
        Err(e) if reply_code(&e) == Some(550) => Ok(Vec::new()),
        Err(e) => Err(map_error(e, Command::Other)),
    }
}

#[async_trait]
impl Connection for FtpConnection {
    async fn connect(&self, password: Option<&str>) -> Result<()> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.username.clone();
        let password = password.unwrap_or("").to_string();
        let timeout = self.connect_timeout;

        let (ftp, socket) = tokio::task::spawn_blocking(move || -> Result<(FtpStream, TcpStream)> {
            let refused = |msg: String| SyncError::connection(ErrorCode::ConnectionRefused, msg);
            let addr = (host.as_str(), port)
                .to_socket_addrs()
                .map_err(|e| refused(e.to_string()))?
                .next()
                .ok_or_else(|| refused(format!("cannot resolve {}", host)))?;
            let mut ftp =
                FtpStream::connect_timeout(addr, timeout).map_err(|e| refused(e.to_string()))?;
            ftp.login(user.as_str(), password.as_str())
                .map_err(|e| map_error(e, Command::Other))?;
            ftp.transfer_type(TransferType::Binary)
                .map_err(|e| map_error(e, Command::Other))?;
            let socket = ftp.get_ref().try_clone()?;
            Ok((ftp, socket))
        })
        .await
        .map_err(join_error)??;

        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(socket);
        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(ftp);
        info!("FTP 已连接: {}", self.name);
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = path.to_string();
        self.blocking(move |ftp| list_blocking(ftp, &path)).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let mut file = std::fs::File::open(local)?;
        let remote = remote.to_string();
        self.blocking(move |ftp| {
            ftp.put_file(remote, &mut file)
                .map(|_| ())
                .map_err(|e| map_error(e, Command::Store))
        })
        .await
    }

    async fn download(&self, remote: &str) -> Result<ByteStream> {
        let remote = remote.to_string();
        let data = self
            .blocking(move |ftp| {
                ftp.retr_as_buffer(&remote)
                    .map_err(|e| map_error(e, Command::Other))
            })
            .await?
            .into_inner();
        Ok(futures::stream::once(async move { Ok(Bytes::from(data)) }).boxed())
    }

    async fn write(&self, data: Bytes, remote: &str) -> Result<()> {
        let remote = remote.to_string();
        self.blocking(move |ftp| {
            ftp.put_file(remote, &mut Cursor::new(data))
                .map(|_| ())
                .map_err(|e| map_error(e, Command::Store))
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.blocking(move |ftp| ftp.rm(path).map_err(|e| map_error(e, Command::Other)))
            .await
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.blocking(move |ftp| ftp.rmdir(path).map_err(|e| map_error(e, Command::Rmdir)))
            .await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.blocking(move |ftp| ftp.mkdir(path).map_err(|e| map_error(e, Command::Mkdir)))
            .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = from.to_string();
        let to = to.to_string();
        // 分开发送 RNFR/RNTO：前者 550 是源不存在，后者是目标目录不存在
        self.blocking(move |ftp| {
            ftp.custom_command(format!("RNFR {}", from), &[Status::RequestFilePending])
                .map_err(|e| map_error(e, Command::Other))?;
            ftp.custom_command(format!("RNTO {}", to), &[Status::RequestedFileActionOk])
                .map_err(|e| map_error(e, Command::Store))?;
            Ok(())
        })
        .await
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        let (parent, name) = split_parent(path);
        let parent = parent.to_string();
        let entries = self
            .blocking(move |ftp| list_blocking(ftp, &parent))
            .await?;
        entries
            .into_iter()
            .find(|e| e.name == name)
            .and_then(|e| e.link)
            .ok_or_else(|| SyncError::not_found(path))
    }

    async fn pwd(&self) -> Result<String> {
        self.blocking(|ftp| ftp.pwd().map_err(|e| map_error(e, Command::Other)))
            .await
    }

    fn terminate(&self) {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(socket) = socket {
            debug!("强制关闭 FTP 连接: {}", self.name);
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
