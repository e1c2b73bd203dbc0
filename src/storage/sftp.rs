use super::{join_error, not_connected, ByteStream, Connection, FileInfo, FileType};
use crate::config::ServerConfig;
use crate::error::{ErrorCode, Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use ssh2::{Session, Sftp};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// SFTP 状态码：SSH_FX_NO_SUCH_FILE
const FX_NO_SUCH_FILE: i32 = 2;
/// SSH_FX_FAILURE，rmdir 非空目录时返回
const FX_FAILURE: i32 = 4;

/// 下载时每块大小
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
enum Command {
    Create,
    Mkdir,
    Rmdir,
    Other,
}

struct SftpSession {
    // 会话必须比 sftp 通道活得久
    _session: Session,
    sftp: Sftp,
}

/// 基于 ssh2 的 SFTP 连接
pub struct SftpConnection {
    host: String,
    port: u16,
    username: String,
    private_key: Option<PathBuf>,
    passphrase: Option<String>,
    connect_timeout: Duration,
    name: String,
    session: Arc<Mutex<Option<SftpSession>>>,
    socket: Mutex<Option<TcpStream>>,
}

impl SftpConnection {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port(),
            username: config.username.clone(),
            private_key: config.private_key.clone(),
            passphrase: config.passphrase.clone(),
            connect_timeout: config.connect_deadline(),
            name: format!("sftp://{}@{}:{}", config.username, config.host, config.port()),
            session: Arc::new(Mutex::new(None)),
            socket: Mutex::new(None),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let guard = session.lock().unwrap_or_else(PoisonError::into_inner);
            let inner = guard.as_ref().ok_or_else(not_connected)?;
            f(&inner.sftp)
        })
        .await
        .map_err(join_error)?
    }
}

/// ssh2 错误到错误码的映射
fn map_error(err: ssh2::Error, command: Command, path: &str) -> SyncError {
    let message = format!("{}: {}", path, err.message());
    let code = match (err.code(), command) {
        (ssh2::ErrorCode::SFTP(FX_NO_SUCH_FILE), Command::Create) => ErrorCode::RequestMkdir,
        (ssh2::ErrorCode::SFTP(FX_NO_SUCH_FILE), Command::Mkdir) => ErrorCode::RequestRecursive,
        (ssh2::ErrorCode::SFTP(FX_NO_SUCH_FILE), _) => ErrorCode::FileNotFound,
        (ssh2::ErrorCode::SFTP(FX_FAILURE), Command::Rmdir) => ErrorCode::RequestRecursive,
        (ssh2::ErrorCode::Session(_), _) => ErrorCode::ReconnectAndRetryOnce,
        _ => return SyncError::remote(message),
    };
    SyncError::protocol(code, message)
}

fn is_no_such_file(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::SFTP(FX_NO_SUCH_FILE))
}

fn to_file_info(path: &Path, stat: &ssh2::FileStat) -> Option<FileInfo> {
    let name = path.file_name()?.to_string_lossy().to_string();
    if name == "." || name == ".." {
        return None;
    }
    let kind = if stat.file_type().is_symlink() {
        FileType::SymLink
    } else if stat.is_dir() {
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
            stat.size.unwrap_or(0)
        },
        date: stat.mtime.map(|s| s as i64 * 1000).unwrap_or(0),
        link: None,
    })
}

#[async_trait]
impl Connection for SftpConnection {
    async fn connect(&self, password: Option<&str>) -> Result<()> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.username.clone();
        let password = password.map(str::to_string);
        let key = self.private_key.clone();
        let passphrase = self.passphrase.clone();
        let timeout = self.connect_timeout;

        let (inner, socket) = tokio::task::spawn_blocking(move || -> Result<(SftpSession, TcpStream)> {
            let refused = |msg: String| SyncError::connection(ErrorCode::ConnectionRefused, msg);
            let addr = (host.as_str(), port)
                .to_socket_addrs()
                .map_err(|e| refused(e.to_string()))?
                .next()
                .ok_or_else(|| refused(format!("cannot resolve {}", host)))?;
            let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| refused(e.to_string()))?;
            let socket = tcp.try_clone()?;

            let mut session = Session::new().map_err(|e| refused(e.to_string()))?;
            session.set_tcp_stream(tcp);
            session.handshake().map_err(|e| refused(e.to_string()))?;

            let auth = match &key {
                Some(key) => {
                    session.userauth_pubkey_file(&user, None, key, passphrase.as_deref())
                }
                None => session.userauth_password(&user, password.as_deref().unwrap_or("")),
            };
            if auth.is_err() || !session.authenticated() {
                let message = auth.err().map(|e| e.message().to_string()).unwrap_or_default();
                return Err(SyncError::connection(ErrorCode::AuthFailed, message));
            }

            let sftp = session
                .sftp()
                .map_err(|e| map_error(e, Command::Other, "sftp"))?;
            Ok((
                SftpSession {
                    _session: session,
                    sftp,
                },
                socket,
            ))
        })
        .await
        .map_err(join_error)??;

        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(socket);
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(inner);
        info!("SFTP 已连接: {}", self.name);
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = path.to_string();
        self.blocking(move |sftp| {
            let entries = match sftp.readdir(Path::new(&path)) {
                Ok(entries) => entries,
                Err(e) if is_no_such_file(&e) => return Ok(Vec::new()),
                Err(e) => return Err(map_error(e, Command::Other, &path)),
            };
            let mut files = Vec::new();
            for (entry, stat) in entries {
                if let Some(mut info) = to_file_info(&entry, &stat) {
                    if info.kind == FileType::SymLink {
                        info.link = sftp
                            .readlink(&entry)
                            .ok()
                            .map(|p| p.to_string_lossy().to_string());
                    }
                    files.push(info);
                }
            }
            Ok(files)
        })
        .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let mut source = std::fs::File::open(local)?;
        let remote = remote.to_string();
        self.blocking(move |sftp| {
            let mut target = sftp
                .create(Path::new(&remote))
                .map_err(|e| map_error(e, Command::Create, &remote))?;
            std::io::copy(&mut source, &mut target)?;
            Ok(())
        })
        .await
    }

    async fn download(&self, remote: &str) -> Result<ByteStream> {
        let remote = remote.to_string();
        let data = self
            .blocking(move |sftp| {
                let mut file = sftp
                    .open(Path::new(&remote))
                    .map_err(|e| map_error(e, Command::Other, &remote))?;
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
            })
            .await?;
        let data = Bytes::from(data);
        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(CHUNK_SIZE)
            .map(|start| Ok(data.slice(start..(start + CHUNK_SIZE).min(data.len()))))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn write(&self, data: Bytes, remote: &str) -> Result<()> {
        let remote = remote.to_string();
        self.blocking(move |sftp| {
            let mut target = sftp
                .create(Path::new(&remote))
                .map_err(|e| map_error(e, Command::Create, &remote))?;
            target.write_all(&data)?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.blocking(move |sftp| {
            sftp.unlink(Path::new(&path))
                .map_err(|e| map_error(e, Command::Other, &path))
        })
        .await
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.blocking(move |sftp| {
            sftp.rmdir(Path::new(&path))
                .map_err(|e| map_error(e, Command::Rmdir, &path))
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.blocking(move |sftp| {
            sftp.mkdir(Path::new(&path), 0o755)
                .map_err(|e| map_error(e, Command::Mkdir, &path))
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = from.to_string();
        let to = to.to_string();
        self.blocking(move |sftp| {
            if let Err(e) = sftp.lstat(Path::new(&from)) {
                return Err(map_error(e, Command::Other, &from));
            }
            // 源存在时，NO_SUCH_FILE 说明目标目录缺失
            sftp.rename(Path::new(&from), Path::new(&to), None)
                .map_err(|e| map_error(e, Command::Create, &to))
        })
        .await
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        let path = path.to_string();
        self.blocking(move |sftp| {
            sftp.readlink(Path::new(&path))
                .map(|p| p.to_string_lossy().to_string())
                .map_err(|e| map_error(e, Command::Other, &path))
        })
        .await
    }

    async fn pwd(&self) -> Result<String> {
        self.blocking(|sftp| {
            sftp.realpath(Path::new("."))
                .map(|p| p.to_string_lossy().to_string())
                .map_err(|e| map_error(e, Command::Other, "."))
        })
        .await
    }

    fn terminate(&self) {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(socket) = socket {
            debug!("强制关闭 SFTP 连接: {}", self.name);
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
