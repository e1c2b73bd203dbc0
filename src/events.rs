//! 有序异步事件
//!
//! 每次触发都会按顺序 await 所有监听者，全部完成后才返回。

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

type Listener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct AsyncEvent<T> {
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T: Clone + Send + 'static> AsyncEvent<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// 注册监听者
    pub fn on<F, Fut>(&self, listener: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let listener: Listener<T> = Arc::new(move |value| Box::pin(listener(value)));
        self.lock().push(listener);
    }

    /// 按注册顺序触发
    pub async fn fire(&self, value: T) -> anyhow::Result<()> {
        let listeners = self.lock().clone();
        for listener in listeners {
            listener(value.clone()).await?;
        }
        Ok(())
    }

    /// 按注册的逆序触发（用于拆除）
    pub async fn rfire(&self, value: T) -> anyhow::Result<()> {
        let listeners = self.lock().clone();
        for listener in listeners.into_iter().rev() {
            listener(value.clone()).await?;
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener<T>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Default for AsyncEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fire_awaits_in_order() {
        let event = AsyncEvent::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        event.on(move |v| {
            let l = l.clone();
            async move {
                // 第一个监听者更慢，仍然先完成
                tokio::time::sleep(Duration::from_millis(20)).await;
                l.lock().unwrap().push(format!("a{}", v));
                Ok(())
            }
        });
        let l = log.clone();
        event.on(move |v| {
            let l = l.clone();
            async move {
                l.lock().unwrap().push(format!("b{}", v));
                Ok(())
            }
        });

        event.fire(1).await.unwrap();
        event.rfire(2).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "b2", "a2"]);
    }

    #[tokio::test]
    async fn test_error_stops_firing() {
        let event = AsyncEvent::<()>::new();
        let hits = Arc::new(Mutex::new(0));
        event.on(|_| async { Err(anyhow::anyhow!("bad config")) });
        let h = hits.clone();
        event.on(move |_| {
            let h = h.clone();
            async move {
                *h.lock().unwrap() += 1;
                Ok(())
            }
        });

        assert!(event.fire(()).await.is_err());
        assert_eq!(*hits.lock().unwrap(), 0);
        assert_eq!(event.len(), 2);
    }
}
