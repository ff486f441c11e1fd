//! 测试替身：处理器与存储包装
//!
//! 处理器都可以克隆，克隆体共享计数，测试保留一份用于断言，另一份通过 `handler()` 注册到任务上。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    Execution, ExecutionContext, ExecutionHandler, ExecutionKey, ExecutionStore, HandlerResult,
    RescheduleUpdate, TaskError, TaskInstance,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tokio::sync::Notify;

/// 一次处理器调用的记录
#[derive(Debug, Clone)]
pub struct Invocation {
    pub instance: TaskInstance,
    pub scheduled_time: DateTime<Utc>,
    pub scheduler_name: String,
}

/// 记录每次调用并返回成功
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Arc<dyn ExecutionHandler> {
        Arc::new(self.clone())
    }

    pub fn count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn instances(&self) -> Vec<TaskInstance> {
        self.invocations()
            .into_iter()
            .map(|invocation| invocation.instance)
            .collect()
    }
}

#[async_trait]
impl ExecutionHandler for RecordingHandler {
    async fn execute(&self, instance: &TaskInstance, context: &ExecutionContext) -> HandlerResult {
        self.invocations.lock().unwrap().push(Invocation {
            instance: instance.clone(),
            scheduled_time: context.scheduled_time(),
            scheduler_name: context.scheduler_name.clone(),
        });
        Ok(None)
    }
}

/// 前 `failures` 次调用失败，之后成功
#[derive(Debug, Clone)]
pub struct FailingHandler {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FailingHandler {
    pub fn always() -> Self {
        Self::times(usize::MAX)
    }

    pub fn times(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn handler(&self) -> Arc<dyn ExecutionHandler> {
        Arc::new(self.clone())
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionHandler for FailingHandler {
    async fn execute(&self, _instance: &TaskInstance, _context: &ExecutionContext) -> HandlerResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(TaskError::new(format!("simulated failure #{}", call + 1)));
        }
        Ok(None)
    }
}

/// 阻塞直到 `release()`，用于模拟长时间运行的处理器
#[derive(Debug, Clone, Default)]
pub struct BlockingHandler {
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
    release: Arc<Notify>,
}

impl BlockingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Arc<dyn ExecutionHandler> {
        Arc::new(self.clone())
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// 放行所有正在等待以及之后到来的调用
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// 等待至少 `count` 个调用开始
    pub async fn wait_started(&self, count: usize, timeout: Duration) -> bool {
        crate::helpers::TestEnv::wait_until(|| self.started() >= count, timeout).await
    }
}

#[async_trait]
impl ExecutionHandler for BlockingHandler {
    async fn execute(&self, _instance: &TaskInstance, _context: &ExecutionContext) -> HandlerResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        loop {
            // 先创建 Notified 再检查标志，避免错过 notify_waiters
            let notified = self.release.notified();
            if self.released.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

/// 模拟另一个进程：在调用方拉取之后、认领之前抢先认领前 `steal` 行
pub struct RacingStore {
    inner: Arc<dyn ExecutionStore>,
    rival: String,
    steal: usize,
    stolen: AtomicUsize,
}

impl RacingStore {
    pub fn new(inner: Arc<dyn ExecutionStore>, rival: &str, steal: usize) -> Self {
        Self {
            inner,
            rival: rival.to_string(),
            steal,
            stolen: AtomicUsize::new(0),
        }
    }

    pub fn stolen(&self) -> usize {
        self.stolen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionStore for RacingStore {
    async fn insert(&self, execution: &Execution) -> SchedulerResult<bool> {
        self.inner.insert(execution).await
    }

    async fn fetch_due_excluding(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        excluded_task_names: &[String],
    ) -> SchedulerResult<Vec<Execution>> {
        let due = self
            .inner
            .fetch_due_excluding(now, limit, excluded_task_names)
            .await?;
        for execution in due.iter().take(self.steal) {
            if self
                .inner
                .try_claim(&execution.key(), execution.version, &self.rival, now)
                .await?
            {
                self.stolen.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(due)
    }

    async fn try_claim(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.inner.try_claim(key, expected_version, owner, now).await
    }

    async fn update_heartbeat(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.inner.update_heartbeat(key, expected_version, now).await
    }

    async fn reschedule(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        update: &RescheduleUpdate,
    ) -> SchedulerResult<bool> {
        self.inner.reschedule(key, expected_version, update).await
    }

    async fn remove(&self, key: &ExecutionKey, expected_version: i64) -> SchedulerResult<bool> {
        self.inner.remove(key, expected_version).await
    }

    async fn fetch_stale(&self, stale_before: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        self.inner.fetch_stale(stale_before).await
    }

    async fn remove_unresolved(
        &self,
        older_than: DateTime<Utc>,
        known_task_names: &[String],
    ) -> SchedulerResult<u64> {
        self.inner.remove_unresolved(older_than, known_task_names).await
    }

    async fn get(&self, key: &ExecutionKey) -> SchedulerResult<Option<Execution>> {
        self.inner.get(key).await
    }

    async fn get_scheduled_executions(&self) -> SchedulerResult<Vec<Execution>> {
        self.inner.get_scheduled_executions().await
    }
}

/// 可以切换为不可用的存储，不可用时所有操作返回数据库错误；
/// 也可以只让指定执行的写入失败
pub struct FlakyStore {
    inner: Arc<dyn ExecutionStore>,
    available: AtomicBool,
    failed_calls: AtomicUsize,
    failing_writes: Mutex<HashSet<ExecutionKey>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ExecutionStore>) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
            failed_calls: AtomicUsize::new(0),
            failing_writes: Mutex::new(HashSet::new()),
        }
    }

    /// 之后对该执行的改期和删除都返回数据库错误
    pub fn fail_writes_for(&self, key: ExecutionKey) {
        self.failing_writes.lock().unwrap().insert(key);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn failed_calls(&self) -> usize {
        self.failed_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> SchedulerResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            Err(SchedulerError::DatabaseOperation(
                "simulated store outage".to_string(),
            ))
        }
    }

    fn check_write(&self, key: &ExecutionKey) -> SchedulerResult<()> {
        self.check()?;
        if self.failing_writes.lock().unwrap().contains(key) {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(SchedulerError::DatabaseOperation(format!(
                "simulated write failure for {key}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn insert(&self, execution: &Execution) -> SchedulerResult<bool> {
        self.check()?;
        self.inner.insert(execution).await
    }

    async fn fetch_due_excluding(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        excluded_task_names: &[String],
    ) -> SchedulerResult<Vec<Execution>> {
        self.check()?;
        self.inner
            .fetch_due_excluding(now, limit, excluded_task_names)
            .await
    }

    async fn try_claim(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.check()?;
        self.inner.try_claim(key, expected_version, owner, now).await
    }

    async fn update_heartbeat(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.check()?;
        self.inner.update_heartbeat(key, expected_version, now).await
    }

    async fn reschedule(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        update: &RescheduleUpdate,
    ) -> SchedulerResult<bool> {
        self.check_write(key)?;
        self.inner.reschedule(key, expected_version, update).await
    }

    async fn remove(&self, key: &ExecutionKey, expected_version: i64) -> SchedulerResult<bool> {
        self.check_write(key)?;
        self.inner.remove(key, expected_version).await
    }

    async fn fetch_stale(&self, stale_before: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        self.check()?;
        self.inner.fetch_stale(stale_before).await
    }

    async fn remove_unresolved(
        &self,
        older_than: DateTime<Utc>,
        known_task_names: &[String],
    ) -> SchedulerResult<u64> {
        self.check()?;
        self.inner.remove_unresolved(older_than, known_task_names).await
    }

    async fn get(&self, key: &ExecutionKey) -> SchedulerResult<Option<Execution>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn get_scheduled_executions(&self) -> SchedulerResult<Vec<Execution>> {
        self.check()?;
        self.inner.get_scheduled_executions().await
    }
}
