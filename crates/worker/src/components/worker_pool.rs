use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 固定大小的工作池
///
/// 每个被认领的执行占用一个许可，写回结果后归还。空闲许可数就是本轮最多能认领的行数，
/// 池本身不排队。
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.size.saturating_sub(self.free_slots())
    }

    /// 没有空闲槽位时返回 `None`，不等待
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// 在超时内等待所有许可归还，返回是否已空闲
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.size).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.semaphore.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                drop(permits);
                true
            }
            _ => false,
        }
    }
}
