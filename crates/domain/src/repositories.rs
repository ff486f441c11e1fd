//! 执行存储抽象
//!
//! 所有状态转换都是以 `version` 为条件的单次写入，返回 `false` 表示条件不满足。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{Execution, ExecutionKey};
use crate::value_objects::RescheduleUpdate;
use scheduler_errors::SchedulerResult;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// 插入新执行；实例键已存在时返回 `false`
    async fn insert(&self, execution: &Execution) -> SchedulerResult<bool>;

    /// `execution_time <= now` 且未被领取，按执行时间和实例键升序
    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> SchedulerResult<Vec<Execution>> {
        self.fetch_due_excluding(now, limit, &[]).await
    }

    /// 同 `fetch_due`，但不返回 `excluded_task_names` 中的任务，
    /// 避免无法解析的任务长期占满拉取配额
    async fn fetch_due_excluding(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        excluded_task_names: &[String],
    ) -> SchedulerResult<Vec<Execution>>;

    /// 原子领取：版本一致且未被领取时置 `picked`，版本加一
    async fn try_claim(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn update_heartbeat(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn reschedule(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        update: &RescheduleUpdate,
    ) -> SchedulerResult<bool>;

    async fn remove(&self, key: &ExecutionKey, expected_version: i64) -> SchedulerResult<bool>;

    /// 已领取且最后心跳早于 `stale_before` 的执行
    async fn fetch_stale(&self, stale_before: DateTime<Utc>) -> SchedulerResult<Vec<Execution>>;

    /// 删除任务名不在 `known_task_names` 中且执行时间早于 `older_than` 的未领取执行
    async fn remove_unresolved(
        &self,
        older_than: DateTime<Utc>,
        known_task_names: &[String],
    ) -> SchedulerResult<u64>;

    async fn get(&self, key: &ExecutionKey) -> SchedulerResult<Option<Execution>>;

    async fn get_scheduled_executions(&self) -> SchedulerResult<Vec<Execution>>;
}
