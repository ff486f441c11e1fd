use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use scheduler_domain::{Execution, ExecutionKey};
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// 本进程正在运行的一次执行
///
/// `version` 保存本进程最近一次成功写入后的版本号。心跳写入和完成写入都在持有这把锁的
/// 情况下进行，因此完成写入总是基于最新一次心跳的版本。
#[derive(Debug)]
pub struct CurrentlyExecuting {
    execution: Execution,
    started_at: DateTime<Utc>,
    version: Mutex<i64>,
    lease_lost: AtomicBool,
    finished: AtomicBool,
}

impl CurrentlyExecuting {
    pub fn new(execution: Execution, started_at: DateTime<Utc>) -> Self {
        let version = execution.version;
        Self {
            execution,
            started_at,
            version: Mutex::new(version),
            lease_lost: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> ExecutionKey {
        self.execution.key()
    }

    /// 认领时的执行记录
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn lock_version(&self) -> MutexGuard<'_, i64> {
        self.version.lock().await
    }

    pub async fn current_version(&self) -> i64 {
        *self.version.lock().await
    }

    /// 心跳发现版本不匹配：该行已被其他进程接管或改写
    pub fn mark_lease_lost(&self) {
        self.lease_lost.store(true, Ordering::SeqCst);
    }

    pub fn is_lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// 完成写入已尝试，之后的心跳应跳过
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// 对外暴露的只读快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutingSnapshot {
    pub key: ExecutionKey,
    pub execution_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub version: i64,
    pub lease_lost: bool,
}

/// "本进程持有的执行"登记表，只在分派开始和完成写入时修改，由心跳读取
#[derive(Debug, Default)]
pub struct CurrentlyExecutingMap {
    entries: RwLock<HashMap<ExecutionKey, Arc<CurrentlyExecuting>>>,
}

impl CurrentlyExecutingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        execution: Execution,
        started_at: DateTime<Utc>,
    ) -> Arc<CurrentlyExecuting> {
        let entry = Arc::new(CurrentlyExecuting::new(execution, started_at));
        self.entries.write().await.insert(entry.key(), entry.clone());
        entry
    }

    pub async fn remove(&self, key: &ExecutionKey) -> Option<Arc<CurrentlyExecuting>> {
        self.entries.write().await.remove(key)
    }

    pub async fn contains(&self, key: &ExecutionKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn entries(&self) -> Vec<Arc<CurrentlyExecuting>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 按执行键排序的快照
    pub async fn snapshot(&self) -> Vec<ExecutingSnapshot> {
        let mut snapshots = Vec::new();
        for entry in self.entries().await {
            snapshots.push(ExecutingSnapshot {
                key: entry.key(),
                execution_time: entry.execution().execution_time,
                started_at: entry.started_at(),
                version: entry.current_version().await,
                lease_lost: entry.is_lease_lost(),
            });
        }
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}
