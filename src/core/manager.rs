//! 连接管理：每个服务器最多一条活动连接

use super::scheduler::Task;
use crate::config::ServerConfig;
use crate::error::{ErrorCode, Result, SyncError};
use crate::interact::PasswordPrompt;
use crate::storage::{ByteStream, Connection, ConnectionFactory, FileInfo};
use bytes::Bytes;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ConnState {
    conn: Option<Arc<dyn Connection>>,
    /// 建立当前连接时的配置指纹
    fingerprint: Option<String>,
    /// 会话内记住的用户输入密码
    cached_password: Option<String>,
}

pub struct ConnectionManager {
    config: Mutex<ServerConfig>,
    factory: Arc<dyn ConnectionFactory>,
    prompt: Arc<dyn PasswordPrompt>,
    state: tokio::sync::Mutex<ConnState>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<ConnectionManager>,
}

fn is_retryable(err: &SyncError) -> bool {
    matches!(
        err.code(),
        Some(ErrorCode::Blocked) | Some(ErrorCode::ReconnectAndRetryOnce)
    )
}

impl ConnectionManager {
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn ConnectionFactory>,
        prompt: Arc<dyn PasswordPrompt>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config: Mutex::new(config),
            factory,
            prompt,
            state: tokio::sync::Mutex::new(ConnState::default()),
            idle_timer: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub fn config(&self) -> ServerConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 更新配置；连接参数变化时先断开旧连接
    pub async fn set_config(&self, config: ServerConfig) {
        let fingerprint = config.fingerprint();
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;

        let mut state = self.state.lock().await;
        if state.fingerprint.as_deref().map_or(false, |f| f != fingerprint) {
            info!("连接配置已变化，断开旧连接");
            if let Some(conn) = state.conn.take() {
                conn.terminate();
            }
            state.fingerprint = None;
            state.cached_password = None;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.conn.is_some()
    }

    /// 主动断开
    pub async fn disconnect(&self) {
        self.cancel_idle_timer();
        self.teardown().await;
    }

    async fn teardown(&self) {
        let mut state = self.state.lock().await;
        if let Some(conn) = state.conn.take() {
            info!("断开连接: {}", conn.name());
            conn.terminate();
        }
        state.fingerprint = None;
    }

    /// 仅当 `conn` 仍是当前连接时才丢弃
    async fn discard(&self, conn: &Arc<dyn Connection>) {
        conn.terminate();
        let mut state = self.state.lock().await;
        if state.conn.as_ref().map_or(false, |c| Arc::ptr_eq(c, conn)) {
            state.conn = None;
            state.fingerprint = None;
        }
    }

    fn cancel_idle_timer(&self) {
        let old = self
            .idle_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(old) = old {
            old.abort();
        }
    }

    /// 重新开始空闲计时
    fn arm_idle_timer(&self) {
        let timeout = self.config().idle_timeout();
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = weak.upgrade() {
                debug!("连接空闲超时");
                manager.teardown().await;
            }
        });
        let old = self
            .idle_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(old) = old {
            old.abort();
        }
    }

    /// 当前连接，没有则建立
    async fn connection(&self) -> Result<Arc<dyn Connection>> {
        let mut state = self.state.lock().await;
        if let Some(conn) = &state.conn {
            return Ok(conn.clone());
        }
        let config = self.config();
        let conn = self.establish(&config, &mut state).await?;
        state.conn = Some(conn.clone());
        state.fingerprint = Some(config.fingerprint());
        Ok(conn)
    }

    /// 建立新连接，处理密码输入与认证失败重试
    async fn establish(
        &self,
        config: &ServerConfig,
        state: &mut ConnState,
    ) -> Result<Arc<dyn Connection>> {
        loop {
            let mut prompted = false;
            let password = if let Some(p) = &config.password {
                Some(p.clone())
            } else if let Some(p) = &state.cached_password {
                Some(p.clone())
            } else if config.needs_password() {
                let placeholder = format!("Password for {}", config.display_name());
                match self.prompt.prompt(&placeholder).await {
                    Some(p) => {
                        prompted = true;
                        Some(p)
                    }
                    None => return Err(SyncError::Cancelled),
                }
            } else {
                None
            };

            let conn = self.factory.create(config)?;
            info!("连接 {} ...", conn.name());
            let result =
                tokio::time::timeout(config.connect_deadline(), conn.connect(password.as_deref()))
                    .await;
            match result {
                Err(_) => {
                    conn.terminate();
                    return Err(SyncError::connection(
                        ErrorCode::Blocked,
                        format!("connect to {} timed out", config.display_name()),
                    ));
                }
                Ok(Ok(())) => {
                    if prompted && config.remember_password {
                        state.cached_password = password;
                    }
                    return Ok(conn);
                }
                Ok(Err(e))
                    if e.code() == Some(ErrorCode::AuthFailed)
                        && config.password.is_none()
                        && config.needs_password() =>
                {
                    warn!("认证失败，重新输入密码: {}", config.display_name());
                    state.cached_password = None;
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// 执行远程操作
    ///
    /// 操作必须在 block 检测时长内完成，否则强制断开、重连并重试一次。
    /// `RECONNECT_AND_RETRY_ONCE` 同样重连重试一次。
    pub async fn run<T, F, Fut>(&self, task: &Task, label: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        task.check_cancelled()?;
        let block = self.config().block_detecting();
        let mut retried = false;

        self.cancel_idle_timer();
        let _rearm = scopeguard::guard((), |_| self.arm_idle_timer());

        loop {
            let conn = task.with(self.connection()).await?;
            // 任务取消时 future 会被直接丢弃，借此中断进行中的阻塞调用
            let _terminate = scopeguard::guard(conn.clone(), |conn| {
                if task.is_cancelled() {
                    conn.terminate();
                }
            });

            let attempt = async {
                match tokio::time::timeout(block, op(conn.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::connection(
                        ErrorCode::Blocked,
                        format!("`{}` did not respond", label),
                    )),
                }
            };
            match task.with(attempt).await {
                Err(e) if is_retryable(&e) => {
                    self.discard(&conn).await;
                    if retried {
                        warn!("{} 重试后仍失败: {}", label, e);
                        return Err(e);
                    }
                    warn!("{} 失败 ({})，重连后重试", label, e);
                    retried = true;
                }
                other => return other,
            }
        }
    }

    pub async fn list(&self, task: &Task, path: &str) -> Result<Vec<FileInfo>> {
        self.run(task, &format!("list {}", path), move |c| async move {
            c.list(path).await
        })
        .await
    }

    pub async fn upload(&self, task: &Task, local: &Path, remote: &str) -> Result<()> {
        self.run(task, &format!("upload {}", remote), move |c| async move {
            c.upload(local, remote).await
        })
        .await
    }

    pub async fn download(&self, task: &Task, remote: &str) -> Result<ByteStream> {
        self.run(task, &format!("download {}", remote), move |c| async move {
            c.download(remote).await
        })
        .await
    }

    pub async fn write(&self, task: &Task, data: Bytes, remote: &str) -> Result<()> {
        self.run(task, &format!("write {}", remote), move |c| {
            let data = data.clone();
            async move { c.write(data, remote).await }
        })
        .await
    }

    pub async fn delete(&self, task: &Task, path: &str) -> Result<()> {
        self.run(task, &format!("delete {}", path), move |c| async move {
            c.delete(path).await
        })
        .await
    }

    pub async fn rmdir(&self, task: &Task, path: &str) -> Result<()> {
        self.run(task, &format!("rmdir {}", path), move |c| async move {
            c.rmdir(path).await
        })
        .await
    }

    pub async fn mkdir(&self, task: &Task, path: &str) -> Result<()> {
        self.run(task, &format!("mkdir {}", path), move |c| async move {
            c.mkdir(path).await
        })
        .await
    }

    pub async fn rename(&self, task: &Task, from: &str, to: &str) -> Result<()> {
        self.run(task, &format!("rename {} {}", from, to), move |c| async move {
            c.rename(from, to).await
        })
        .await
    }

    pub async fn readlink(&self, task: &Task, path: &str) -> Result<String> {
        self.run(task, &format!("readlink {}", path), move |c| async move {
            c.readlink(path).await
        })
        .await
    }

    pub async fn pwd(&self, task: &Task) -> Result<String> {
        self.run(task, "pwd", |c| async move { c.pwd().await }).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(timer) = self
            .idle_timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        if let Some(conn) = self.state.get_mut().conn.take() {
            conn.terminate();
        }
    }
}
