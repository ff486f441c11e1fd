use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use scheduler_domain::{Execution, ExecutionKey, ExecutionStore, RescheduleUpdate};
use scheduler_errors::SchedulerResult;

/// 进程内执行存储
///
/// 每个操作都在同一把锁内完成，与数据库的条件更新语义一致。
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: Mutex<BTreeMap<ExecutionKey, Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.executions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.lock().await.is_empty()
    }

    /// 直接写入记录，测试中用于构造任意状态
    pub async fn put(&self, execution: Execution) {
        self.executions
            .lock()
            .await
            .insert(execution.key(), execution);
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, execution: &Execution) -> SchedulerResult<bool> {
        let mut executions = self.executions.lock().await;
        let key = execution.key();
        if executions.contains_key(&key) {
            return Ok(false);
        }
        executions.insert(key, execution.clone());
        Ok(true)
    }

    async fn fetch_due_excluding(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        excluded_task_names: &[String],
    ) -> SchedulerResult<Vec<Execution>> {
        let executions = self.executions.lock().await;
        let mut due: Vec<Execution> = executions
            .values()
            .filter(|e| e.is_due(now))
            .filter(|e| !excluded_task_names.iter().any(|name| name == e.task_name()))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.execution_time
                .cmp(&b.execution_time)
                .then_with(|| a.key().cmp(&b.key()))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn try_claim(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut executions = self.executions.lock().await;
        match executions.get_mut(key) {
            Some(execution) if execution.version == expected_version && !execution.picked => {
                *execution = execution.picked_by_owner(owner, now);
                Ok(true)
            }
            _ => {
                debug!(key = %key, expected_version, "领取条件不满足");
                Ok(false)
            }
        }
    }

    async fn update_heartbeat(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut executions = self.executions.lock().await;
        match executions.get_mut(key) {
            Some(execution) if execution.version == expected_version && execution.picked => {
                execution.last_heartbeat = Some(now);
                execution.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        update: &RescheduleUpdate,
    ) -> SchedulerResult<bool> {
        let mut executions = self.executions.lock().await;
        match executions.get_mut(key) {
            Some(execution) if execution.version == expected_version => {
                update.apply_to(execution);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, key: &ExecutionKey, expected_version: i64) -> SchedulerResult<bool> {
        let mut executions = self.executions.lock().await;
        match executions.get(key) {
            Some(execution) if execution.version == expected_version => {
                executions.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fetch_stale(&self, stale_before: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        let executions = self.executions.lock().await;
        Ok(executions
            .values()
            .filter(|e| e.is_stale(stale_before))
            .cloned()
            .collect())
    }

    async fn remove_unresolved(
        &self,
        older_than: DateTime<Utc>,
        known_task_names: &[String],
    ) -> SchedulerResult<u64> {
        let known: HashSet<&str> = known_task_names.iter().map(String::as_str).collect();
        let mut executions = self.executions.lock().await;
        let before = executions.len();
        executions.retain(|_, e| {
            e.picked || known.contains(e.task_name()) || e.execution_time >= older_than
        });
        Ok((before - executions.len()) as u64)
    }

    async fn get(&self, key: &ExecutionKey) -> SchedulerResult<Option<Execution>> {
        Ok(self.executions.lock().await.get(key).cloned())
    }

    async fn get_scheduled_executions(&self) -> SchedulerResult<Vec<Execution>> {
        let executions = self.executions.lock().await;
        let mut all: Vec<Execution> = executions.values().cloned().collect();
        all.sort_by(|a, b| a.execution_time.cmp(&b.execution_time));
        Ok(all)
    }
}
