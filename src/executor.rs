//! 同步调用桥
//!
//! 事件处理只在事件循环内以 `.await` 方式进行；宿主的同步调用 (列出会话、发送消息等)
//! 通过 [`Executor::block_on`] 投递到事件循环并阻塞等待结果。
//! 在事件循环 (或任何 tokio 运行时) 内部发起阻塞调用会被拒绝。

use crate::error::{BridgeError, BridgeResult};
use std::future::Future;
use std::sync::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

#[derive(Default)]
pub struct Executor {
    /// 当前事件循环的句柄 (Polling 状态下存在)
    current: Mutex<Option<Handle>>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, handle: Handle) {
        *self.slot() = Some(handle);
    }

    pub fn detach(&self) {
        *self.slot() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Handle>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 阻塞执行异步操作
    ///
    /// 事件循环运行中时任务在循环上执行；未运行时使用一次性的单线程运行时。
    pub fn block_on<F, T>(&self, fut: F) -> BridgeResult<T>
    where
        F: Future<Output = BridgeResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(BridgeError::Scheduler(
                "blocking bridge call issued from inside the event loop".into(),
            ));
        }

        let handle = self.slot().clone();
        match handle {
            Some(handle) => {
                let (tx, rx) = oneshot::channel();
                handle.spawn(async move {
                    let _ = tx.send(fut.await);
                });
                rx.blocking_recv().map_err(|_| {
                    BridgeError::Scheduler("event loop stopped before the call completed".into())
                })?
            }
            None => {
                let runtime = Builder::new_current_thread().enable_all().build()?;
                runtime.block_on(fut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_block_on_without_loop_uses_temporary_runtime() {
        let executor = Executor::new();
        let value = executor
            .block_on(async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_block_on_runs_on_attached_loop() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bridge-loop")
            .enable_all()
            .build()
            .unwrap();
        let executor = Executor::new();
        executor.attach(runtime.handle().clone());

        let thread = executor
            .block_on(async { Ok(std::thread::current().name().map(String::from)) })
            .unwrap();
        assert_eq!(thread.as_deref(), Some("bridge-loop"));

        executor.detach();
        assert!(!executor.is_attached());
    }

    #[tokio::test]
    async fn test_block_on_inside_loop_is_rejected() {
        let executor = Executor::new();
        let err = executor.block_on(async { Ok(()) }).unwrap_err();
        assert!(matches!(err, BridgeError::Scheduler(_)));
    }

    #[test]
    fn test_stopped_loop_reports_scheduler_fault() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let executor = Executor::new();
        executor.attach(runtime.handle().clone());
        drop(runtime);

        let err = executor.block_on(async { Ok(()) }).unwrap_err();
        assert!(matches!(err, BridgeError::Scheduler(_)));
    }
}
