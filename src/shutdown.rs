use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// 后台循环的关闭信号与句柄管理
pub struct ShutdownManager {
    /// 关闭信号发送器，关闭后置空
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_shutdown: Arc<RwLock<bool>>,
    /// 已注册的后台循环
    handles: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_tx: Arc::new(RwLock::new(Some(shutdown_tx))),
            is_shutdown: Arc::new(RwLock::new(false)),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 订阅关闭信号
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        let shutdown_tx = self.shutdown_tx.read().await;
        if let Some(ref tx) = *shutdown_tx {
            tx.subscribe()
        } else {
            // 已经关闭，返回一个立即触发的接收器
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            rx
        }
    }

    /// 登记一个后台循环，`join` 时等待它退出
    pub async fn register(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.handles.lock().await.push((name.into(), handle));
    }

    /// 触发关闭，重复调用无副作用
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.is_shutdown.write().await;
        if *is_shutdown {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        *is_shutdown = true;

        let mut shutdown_tx = self.shutdown_tx.write().await;
        if let Some(tx) = shutdown_tx.take() {
            debug!("发送关闭信号给 {} 个订阅者", tx.receiver_count());
            let _ = tx.send(());
        }
        info!("关闭信号已发送");
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.is_shutdown.read().await
    }

    /// 等待已登记的后台循环退出，超时后中止剩余的循环
    ///
    /// 返回超时被中止的循环名称。
    pub async fn join(&self, timeout: Duration) -> Vec<String> {
        let handles = std::mem::take(&mut *self.handles.lock().await);
        let deadline = Instant::now() + timeout;
        let mut aborted = Vec::new();

        for (name, mut handle) in handles {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(component = %name, "后台循环已退出"),
                Ok(Err(e)) => warn!(component = %name, error = %e, "后台循环异常退出"),
                Err(_) => {
                    warn!(component = %name, "后台循环未在超时内退出，强制中止");
                    handle.abort();
                    aborted.push(name);
                }
            }
        }
        aborted
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownManager {
    fn clone(&self) -> Self {
        Self {
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            is_shutdown: Arc::clone(&self.is_shutdown),
            handles: Arc::clone(&self.handles),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_manager_basic() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown().await);

        let mut rx = manager.subscribe().await;
        manager.shutdown().await;

        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
        assert!(manager.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let manager = ShutdownManager::new();
        let mut rx1 = manager.subscribe().await;
        let mut rx2 = manager.subscribe().await;

        manager.shutdown().await;

        assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
        assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;

        // 关闭之后订阅应立即收到信号
        let mut rx = manager.subscribe().await;
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn test_double_shutdown() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_join_waits_for_cooperative_loops() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe().await;
        manager
            .register(
                "cooperative",
                tokio::spawn(async move {
                    let _ = rx.recv().await;
                }),
            )
            .await;

        manager.shutdown().await;
        assert!(manager.join(Duration::from_secs(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_join_aborts_stuck_loops() {
        let manager = ShutdownManager::new();
        manager
            .register("stuck", tokio::spawn(std::future::pending::<()>()))
            .await;

        manager.shutdown().await;
        let aborted = manager.join(Duration::from_millis(50)).await;
        assert_eq!(aborted, vec!["stuck".to_string()]);
    }
}
