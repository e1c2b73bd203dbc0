//! 单线程优先级任务调度
//!
//! 每个调度器同一时刻只运行一个任务。提交是同步的：任务立即进入队列，
//! 返回的 [`TaskHandle`] 在任务结束（或被取消、超时拒绝）时完成。

use crate::error::{Result, SyncError};
use futures::future::BoxFuture;
use scopeguard::ScopeGuard;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub const PRIORITY_IDLE: i32 = 0;
pub const PRIORITY_NORMAL: i32 = 1000;
pub const PRIORITY_HIGH: i32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Wait,
    Started,
    Done,
}

type CancelListener = Box<dyn FnOnce() + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 调度中的一个任务
pub struct Task {
    name: String,
    priority: i32,
    token: CancellationToken,
    state: Mutex<TaskState>,
    listeners: Mutex<Vec<CancelListener>>,
    /// 未运行就被拒绝时的原因（超时）
    rejection: Mutex<Option<SyncError>>,
}

impl Task {
    fn new(name: String, priority: i32) -> Self {
        Self {
            name,
            priority,
            token: CancellationToken::new(),
            state: Mutex::new(TaskState::Wait),
            listeners: Mutex::new(Vec::new()),
            rejection: Mutex::new(None),
        }
    }

    /// 不经过调度器的独立任务，只用于取消控制
    pub fn detached(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name.into(), PRIORITY_NORMAL))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    fn set_state(&self, state: TaskState) {
        *lock(&self.state) = state;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 注册取消回调；已取消时立即调用
    pub fn on_cancel(&self, listener: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            listener();
            return;
        }
        lock(&self.listeners).push(Box::new(listener));
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// 取消任务并触发所有回调
    pub fn cancel(&self) {
        if self.is_cancelled() {
            return;
        }
        self.token.cancel();
        let listeners: Vec<_> = lock(&self.listeners).drain(..).collect();
        for listener in listeners {
            listener();
        }
    }

    /// 与取消竞争：任务取消时立即返回 `Cancelled`，不等待 `fut`
    pub async fn with<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SyncError::Cancelled),
            result = fut => result,
        }
    }

    fn reject(&self, reason: SyncError) {
        *lock(&self.rejection) = Some(reason);
    }

    fn take_rejection(&self) -> Option<SyncError> {
        lock(&self.rejection).take()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// 提交任务得到的句柄，await 得到任务结果
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
    task: Arc<Task>,
}

impl<T> TaskHandle<T> {
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// 只取消这一个任务
    pub fn cancel(&self) {
        self.task.cancel();
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // 任务未运行就被丢弃
            Poll::Ready(Err(_)) => Poll::Ready(Err(this
                .task
                .take_rejection()
                .unwrap_or(SyncError::Cancelled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

type RunFn = Box<dyn FnOnce(Arc<Task>) -> BoxFuture<'static, ()> + Send>;

struct Queued {
    task: Arc<Task>,
    run: RunFn,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Queued>,
    current: Option<Arc<Task>>,
    worker_running: bool,
}

struct Inner {
    name: String,
    state: Mutex<State>,
}

/// 优先级任务调度器
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 提交任务
    pub fn task<T, F, Fut>(&self, name: impl Into<String>, priority: i32, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Task>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit(name.into(), priority, None, f)
    }

    /// 提交任务，若 `timeout` 内仍未开始则以 `Busy` 拒绝
    pub fn task_with_timeout<T, F, Fut>(
        &self,
        name: impl Into<String>,
        priority: i32,
        timeout: Option<Duration>,
        f: F,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Task>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit(name.into(), priority, timeout, f)
    }

    fn submit<T, F, Fut>(
        &self,
        name: String,
        priority: i32,
        timeout: Option<Duration>,
        f: F,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Task>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let task = Arc::new(Task::new(name, priority));
        let (tx, rx) = oneshot::channel();
        let run: RunFn = Box::new(move |task: Arc<Task>| {
            Box::pin(async move {
                let result = task.with(f(task.clone())).await;
                if let Err(SyncError::Cancelled) = &result {
                    debug!("任务已取消: {}", task.name());
                }
                let _ = tx.send(result);
            })
        });

        let spawn_worker = {
            let mut state = lock(&self.inner.state);
            // 插到第一个优先级更低的任务之前，同优先级保持先进先出
            let pos = state
                .queue
                .iter()
                .position(|q| q.task.priority < priority)
                .unwrap_or(state.queue.len());
            state.queue.insert(
                pos,
                Queued {
                    task: task.clone(),
                    run,
                },
            );
            !std::mem::replace(&mut state.worker_running, true)
        };
        if spawn_worker {
            tokio::spawn(Self::worker(self.inner.clone()));
        }

        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(&self.inner);
            let waiting = task.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                Self::expire(weak, waiting);
            });
        }

        TaskHandle { rx, task }
    }

    /// 超时仍在排队的任务以 `Busy` 拒绝
    fn expire(weak: Weak<Inner>, task: Arc<Task>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let removed = {
            let mut state = lock(&inner.state);
            let Some(pos) = state.queue.iter().position(|q| Arc::ptr_eq(&q.task, &task)) else {
                return;
            };
            let running = state
                .current
                .as_ref()
                .map(|t| t.name().to_string())
                .unwrap_or_default();
            error!(
                "[{}] 任务 {} 等待超时，正在运行: {}",
                inner.name,
                task.name(),
                running
            );
            task.reject(SyncError::Busy {
                task: task.name().to_string(),
                running,
            });
            state.queue.remove(pos)
        };
        drop(removed);
    }

    fn worker(inner: Arc<Inner>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            // 队列跑空时解除；任务 panic 后 tokio 丢弃本 future，由新的 worker 接着跑剩下的队列
            let guard = scopeguard::guard(inner, |inner| {
                let runtime = tokio::runtime::Handle::try_current().ok();
                let respawn = {
                    let mut state = lock(&inner.state);
                    if let Some(task) = state.current.take() {
                        error!("[{}] 任务异常中止: {}", inner.name, task.name());
                        task.set_state(TaskState::Done);
                    }
                    state.worker_running = runtime.is_some() && !state.queue.is_empty();
                    state.worker_running
                };
                if let (true, Some(runtime)) = (respawn, runtime) {
                    runtime.spawn(Self::worker(inner));
                }
            });

            loop {
                let next = {
                    let mut state = lock(&guard.state);
                    match state.queue.pop_front() {
                        Some(next) => {
                            next.task.set_state(TaskState::Started);
                            state.current = Some(next.task.clone());
                            next
                        }
                        None => {
                            state.worker_running = false;
                            state.current = None;
                            break;
                        }
                    }
                };

                let Queued { task, run } = next;
                debug!("[{}] 开始任务: {}", guard.name, task.name());
                run(task.clone()).await;
                task.set_state(TaskState::Done);
                lock(&guard.state).current = None;
            }
            let _ = ScopeGuard::into_inner(guard);
        })
    }

    /// 取消正在运行的任务并丢弃整个队列
    pub fn cancel(&self) {
        let (current, dropped) = {
            let mut state = lock(&self.inner.state);
            let dropped: Vec<Queued> = state.queue.drain(..).collect();
            (state.current.clone(), dropped)
        };
        if !dropped.is_empty() || current.is_some() {
            debug!(
                "[{}] 取消全部任务，丢弃 {} 个排队任务",
                self.inner.name,
                dropped.len()
            );
        }
        for queued in &dropped {
            queued.task.cancel();
        }
        drop(dropped);
        if let Some(current) = current {
            current.cancel();
        }
    }

    pub fn current_task_name(&self) -> Option<String> {
        lock(&self.inner.state)
            .current
            .as_ref()
            .map(|t| t.name().to_string())
    }

    /// 排队中（未开始）的任务数
    pub fn pending(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = lock(&self.inner.state);
        state.current.is_none() && state.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_priority_order() {
        let scheduler = Scheduler::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (name, priority) in [("A", PRIORITY_NORMAL), ("B", PRIORITY_HIGH), ("C", PRIORITY_NORMAL)] {
            let log = log.clone();
            handles.push(scheduler.task(name, priority, move |task| async move {
                log.lock().unwrap().push(task.name().to_string());
                Ok(())
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec!["B", "A", "C"]);
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_cancel_drops_queue() {
        let scheduler = Scheduler::new("test");
        let (started_tx, started_rx) = oneshot::channel();
        let a = scheduler.task("A", PRIORITY_NORMAL, move |_| async move {
            let _ = started_tx.send(());
            std::future::pending::<Result<()>>().await
        });
        started_rx.await.unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let b = scheduler.task("B", PRIORITY_HIGH, move |_| async move {
            r.store(true, Ordering::SeqCst);
            Ok(())
        });
        let r = ran.clone();
        let c = scheduler.task("C", PRIORITY_NORMAL, move |_| async move {
            r.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.current_task_name().as_deref(), Some("A"));

        scheduler.cancel();
        assert!(a.await.unwrap_err().is_cancelled());
        assert!(b.await.unwrap_err().is_cancelled());
        assert!(c.await.unwrap_err().is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_when_not_started_in_time() {
        let scheduler = Scheduler::new("test");
        let _a = scheduler.task("upload big.bin", PRIORITY_NORMAL, |_| async {
            std::future::pending::<Result<()>>().await
        });
        let b = scheduler.task_with_timeout(
            "list /",
            PRIORITY_NORMAL,
            Some(Duration::from_millis(100)),
            |_| async { Ok(()) },
        );

        match b.await {
            Err(SyncError::Busy { task, running }) => {
                assert_eq!(task, "list /");
                assert_eq!(running, "upload big.bin");
            }
            other => panic!("expected Busy, got {:?}", other.map(|_| ())),
        }
        assert_eq!(scheduler.pending(), 0);
        scheduler.cancel();
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stall_queue() {
        let scheduler = Scheduler::new("test");
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let gate = scheduler.task("gate", PRIORITY_HIGH, move |_| async move {
            let _ = release_rx.await;
            Ok(())
        });
        let boom = scheduler.task("boom", PRIORITY_NORMAL, |_| async {
            if true {
                panic!("task failed");
            }
            Ok(())
        });
        let after = scheduler.task("after", PRIORITY_NORMAL, |_| async { Ok(7) });
        release_tx.send(()).unwrap();

        gate.await.unwrap();
        assert!(boom.await.unwrap_err().is_cancelled());
        assert_eq!(after.await.unwrap(), 7);
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_with_and_listeners() {
        let scheduler = Scheduler::new("test");
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let (started_tx, started_rx) = oneshot::channel();
        let handle = scheduler.task("A", PRIORITY_IDLE, move |task| async move {
            task.on_cancel(move || f.store(true, Ordering::SeqCst));
            let _ = started_tx.send(());
            // 即使内部 future 永不完成也会因取消而返回
            task.with(std::future::pending::<Result<()>>()).await
        });
        started_rx.await.unwrap();
        handle.cancel();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(fired.load(Ordering::SeqCst));

        let task = Task::new("late".into(), PRIORITY_NORMAL);
        task.cancel();
        let hit = Arc::new(AtomicBool::new(false));
        let h = hit.clone();
        task.on_cancel(move || h.store(true, Ordering::SeqCst));
        assert!(hit.load(Ordering::SeqCst));
        assert!(task.check_cancelled().is_err());
    }
}
