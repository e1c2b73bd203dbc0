//! 测试用内存远程：模拟错误码、挂起或重置、统计调用次数

use super::{system_time_ms, ByteStream, Connection, ConnectionFactory, FileInfo};
use crate::config::ServerConfig;
use crate::error::{ErrorCode, Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

#[derive(Debug, Clone)]
enum Entry {
    Dir { date: i64 },
    File { data: Vec<u8>, date: i64 },
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    password: Option<String>,
    hang: usize,
    reset: usize,
    calls: HashMap<&'static str, usize>,
}

#[derive(Default)]
pub(crate) struct MockRemote {
    state: Mutex<State>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{}", trimmed)
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn now_ms() -> i64 {
    system_time_ms(SystemTime::now())
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 需要这个密码才能登录
    pub fn require_password(&self, password: &str) {
        self.lock().password = Some(password.to_string());
    }

    pub fn add_dir(&self, path: &str) {
        self.lock()
            .entries
            .insert(normalize(path), Entry::Dir { date: now_ms() });
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.lock().entries.insert(
            normalize(path),
            Entry::File {
                data: data.to_vec(),
                date: now_ms(),
            },
        );
    }

    /// 绕过缓存器直接删除，连同子项
    pub fn remove(&self, path: &str) {
        let path = normalize(path);
        let prefix = format!("{}/", path);
        self.lock()
            .entries
            .retain(|k, _| *k != path && !k.starts_with(&prefix));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().entries.get(&normalize(path)) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        path == "/" || self.lock().entries.contains_key(&path)
    }

    /// 接下来 `n` 次非 connect 调用永远不返回
    pub fn hang_next(&self, n: usize) {
        self.lock().hang = n;
    }

    /// 接下来 `n` 次非 connect 调用返回连接被重置
    pub fn reset_next(&self, n: usize) {
        self.lock().reset = n;
    }

    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// 除 connect 外的调用总数
    pub fn network_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(op, _)| **op != "connect")
            .map(|(_, n)| n)
            .sum()
    }

    fn is_dir(state: &State, path: &str) -> bool {
        path == "/" || matches!(state.entries.get(path), Some(Entry::Dir { .. }))
    }

    fn has_children(state: &State, path: &str) -> bool {
        state.entries.keys().any(|k| k != path && parent_of(k) == path)
    }
}

pub(crate) struct MockConnection {
    remote: Arc<MockRemote>,
    connected: AtomicBool,
}

impl MockConnection {
    pub fn new(remote: Arc<MockRemote>) -> Self {
        Self {
            remote,
            connected: AtomicBool::new(false),
        }
    }

    /// 计数，按需挂起，检查连接状态
    async fn enter(&self, op: &'static str) -> Result<()> {
        let (hang, reset) = {
            let mut state = self.remote.lock();
            *state.calls.entry(op).or_default() += 1;
            if state.hang > 0 {
                state.hang -= 1;
                (true, false)
            } else if state.reset > 0 {
                state.reset -= 1;
                (false, true)
            } else {
                (false, false)
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if reset {
            return Err(SyncError::protocol(
                ErrorCode::ReconnectAndRetryOnce,
                format!("{}: connection reset", op),
            ));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(super::not_connected());
        }
        Ok(())
    }

    fn store(&self, data: Vec<u8>, remote: &str) -> Result<()> {
        let path = normalize(remote);
        let mut state = self.remote.lock();
        if !MockRemote::is_dir(&state, &parent_of(&path)) {
            return Err(SyncError::protocol(ErrorCode::RequestMkdir, path));
        }
        state.entries.insert(
            path,
            Entry::File {
                data,
                date: now_ms(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn connect(&self, password: Option<&str>) -> Result<()> {
        let required = {
            let mut state = self.remote.lock();
            *state.calls.entry("connect").or_default() += 1;
            state.password.clone()
        };
        if let Some(required) = required {
            if password != Some(required.as_str()) {
                return Err(SyncError::connection(ErrorCode::AuthFailed, "530 Login incorrect"));
            }
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.enter("list").await?;
        let dir = normalize(path);
        let state = self.remote.lock();
        Ok(state
            .entries
            .iter()
            .filter(|(k, _)| **k != dir && parent_of(k) == dir)
            .map(|(k, entry)| {
                let name = k.rsplit('/').next().unwrap_or_default().to_string();
                match entry {
                    Entry::Dir { date } => FileInfo::directory(name, *date),
                    Entry::File { data, date } => FileInfo::file(name, data.len() as u64, *date),
                }
            })
            .collect())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.enter("upload").await?;
        let data = std::fs::read(local)?;
        self.store(data, remote)
    }

    async fn download(&self, remote: &str) -> Result<ByteStream> {
        self.enter("download").await?;
        let data = self.remote.file(remote).ok_or_else(|| SyncError::not_found(remote))?;
        Ok(futures::stream::once(async move { Ok(Bytes::from(data)) }).boxed())
    }

    async fn write(&self, data: Bytes, remote: &str) -> Result<()> {
        self.enter("write").await?;
        self.store(data.to_vec(), remote)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.enter("delete").await?;
        let path = normalize(path);
        let mut state = self.remote.lock();
        let is_dir = state
            .entries
            .get(&path)
            .map(|e| matches!(e, Entry::Dir { .. }));
        match is_dir {
            Some(false) => {
                state.entries.remove(&path);
                Ok(())
            }
            Some(true) => Err(SyncError::remote(format!("is a directory: {}", path))),
            None => Err(SyncError::not_found(&path)),
        }
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.enter("rmdir").await?;
        let path = normalize(path);
        let mut state = self.remote.lock();
        if !matches!(state.entries.get(&path), Some(Entry::Dir { .. })) {
            return Err(SyncError::not_found(&path));
        }
        if MockRemote::has_children(&state, &path) {
            return Err(SyncError::protocol(ErrorCode::RequestRecursive, path));
        }
        state.entries.remove(&path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.enter("mkdir").await?;
        let path = normalize(path);
        let mut state = self.remote.lock();
        if !MockRemote::is_dir(&state, &parent_of(&path)) {
            return Err(SyncError::protocol(ErrorCode::RequestRecursive, path));
        }
        state
            .entries
            .entry(path)
            .or_insert(Entry::Dir { date: now_ms() });
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.enter("rename").await?;
        let from = normalize(from);
        let to = normalize(to);
        let mut state = self.remote.lock();
        if !state.entries.contains_key(&from) {
            return Err(SyncError::not_found(&from));
        }
        if !MockRemote::is_dir(&state, &parent_of(&to)) {
            return Err(SyncError::protocol(ErrorCode::RequestMkdir, to));
        }
        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .entries
            .keys()
            .filter(|k| **k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(entry) = state.entries.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                state.entries.insert(new_key, entry);
            }
        }
        Ok(())
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        self.enter("readlink").await?;
        Err(SyncError::not_found(path))
    }

    async fn pwd(&self) -> Result<String> {
        self.enter("pwd").await?;
        Ok("/".to_string())
    }

    fn terminate(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 每次创建共享同一个远程的新连接
pub(crate) struct MockFactory {
    pub remote: Arc<MockRemote>,
}

impl ConnectionFactory for MockFactory {
    fn create(&self, _config: &ServerConfig) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(MockConnection::new(self.remote.clone())))
    }
}
