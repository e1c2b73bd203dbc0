use super::{system_time_ms, ByteStream, Connection, FileInfo, FileType};
use crate::error::{ErrorCode, Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::io::ReaderStream;

/// `file` 协议：远程路径直接映射到本机目录
pub struct LocalConnection {
    base_path: PathBuf,
    name: String,
}

impl LocalConnection {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base_path = base.into();
        let name = format!("file:{}", base_path.display());
        Self { base_path, name }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    fn parent_exists(path: &Path) -> bool {
        path.parent().map_or(true, Path::exists)
    }
}

/// 把本地 I/O 错误翻译成协议错误码；`missing` 为路径不存在时使用的错误码
fn map_io(err: io::Error, path: &str, missing: ErrorCode) -> SyncError {
    match err.kind() {
        io::ErrorKind::NotFound => SyncError::protocol(missing, path.to_string()),
        _ => SyncError::Io(err),
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn connect(&self, _password: Option<&str>) -> Result<()> {
        match fs::metadata(&self.base_path).await {
            Ok(m) if m.is_dir() => Ok(()),
            _ => Err(SyncError::connection(
                ErrorCode::ConnectionRefused,
                format!("directory not found: {}", self.base_path.display()),
            )),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let dir = self.resolve_path(path);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(metadata) = fs::symlink_metadata(entry.path()).await else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().to_string();
            let date = metadata.modified().map(system_time_ms).unwrap_or(0);

            let info = if metadata.file_type().is_symlink() {
                let link = fs::read_link(entry.path())
                    .await
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"));
                FileInfo {
                    name,
                    kind: FileType::SymLink,
                    size: 0,
                    date,
                    link,
                }
            } else if metadata.is_dir() {
                FileInfo::directory(name, date)
            } else {
                FileInfo::file(name, metadata.len(), date)
            };
            files.push(info);
        }
        Ok(files)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let target = self.resolve_path(remote);
        if !Self::parent_exists(&target) {
            return Err(SyncError::protocol(ErrorCode::RequestMkdir, remote.to_string()));
        }
        fs::copy(local, &target)
            .await
            .map_err(|e| map_io(e, remote, ErrorCode::FileNotFound))?;
        Ok(())
    }

    async fn download(&self, remote: &str) -> Result<ByteStream> {
        let file = fs::File::open(self.resolve_path(remote))
            .await
            .map_err(|e| map_io(e, remote, ErrorCode::FileNotFound))?;
        Ok(ReaderStream::new(file).map_err(SyncError::Io).boxed())
    }

    async fn write(&self, data: Bytes, remote: &str) -> Result<()> {
        let target = self.resolve_path(remote);
        if !Self::parent_exists(&target) {
            return Err(SyncError::protocol(ErrorCode::RequestMkdir, remote.to_string()));
        }
        fs::write(&target, data).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve_path(path))
            .await
            .map_err(|e| map_io(e, path, ErrorCode::FileNotFound))
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let dir = self.resolve_path(path);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| map_io(e, path, ErrorCode::FileNotFound))?;
        if entries.next_entry().await?.is_some() {
            return Err(SyncError::protocol(
                ErrorCode::RequestRecursive,
                format!("directory not empty: {}", path),
            ));
        }
        fs::remove_dir(&dir)
            .await
            .map_err(|e| map_io(e, path, ErrorCode::FileNotFound))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let dir = self.resolve_path(path);
        match fs::create_dir(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
            Err(e) => Err(map_io(e, path, ErrorCode::RequestRecursive)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve_path(from);
        let target = self.resolve_path(to);
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return Err(SyncError::not_found(from));
        }
        if !Self::parent_exists(&target) {
            return Err(SyncError::protocol(ErrorCode::RequestMkdir, to.to_string()));
        }
        fs::rename(&source, &target).await?;
        Ok(())
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        let target = fs::read_link(self.resolve_path(path))
            .await
            .map_err(|e| map_io(e, path, ErrorCode::FileNotFound))?;
        Ok(target.to_string_lossy().replace('\\', "/"))
    }

    async fn pwd(&self) -> Result<String> {
        Ok("/".to_string())
    }

    fn terminate(&self) {}

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_taxonomy() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnection::new(dir.path());
        conn.connect(None).await.unwrap();

        assert!(conn.list("/missing").await.unwrap().is_empty());

        let err = conn.write(Bytes::from_static(b"x"), "/a/b/c.txt").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::RequestMkdir));

        let err = conn.mkdir("/a/b").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::RequestRecursive));

        conn.mkdir("/a").await.unwrap();
        conn.write(Bytes::from_static(b"hello"), "/a/f.txt").await.unwrap();
        let err = conn.rmdir("/a").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::RequestRecursive));

        let err = conn.delete("/nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_and_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("f.txt"), b"12345").unwrap();
        let conn = LocalConnection::new(dir.path());

        let mut list = conn.list("/").await.unwrap();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "f.txt");
        assert_eq!(list[0].size, 5);
        assert!(list[0].date > 0);
        assert_eq!(list[1].kind, FileType::Directory);

        let chunks: Vec<Bytes> = conn.download("/f.txt").await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"12345");
    }

    #[test]
    fn test_connect_refused_without_base() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let conn = LocalConnection::new("/definitely/not/here");
        let err = rt.block_on(conn.connect(None)).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConnectionRefused));
    }
}
