use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use scheduler_domain::{Execution, ExecutionKey, ExecutionStore, RescheduleUpdate};
use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::database::mapping::{MappingHelpers, EXECUTION_COLUMNS};
use crate::database::schema::{sqlite_schema, TableName};

pub struct SqliteExecutionStore {
    pool: SqlitePool,
    table: TableName,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            table: TableName::default(),
        }
    }

    pub fn with_table(pool: SqlitePool, table: TableName) -> Self {
        Self { pool, table }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建表和索引（幂等）
    pub async fn create_schema(&self) -> SchedulerResult<()> {
        for statement in sqlite_schema(&self.table) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;
        }
        debug!("SQLite执行表已就绪: {}", self.table);
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    #[instrument(skip(self, execution), fields(key = %execution.key()))]
    async fn insert(&self, execution: &Execution) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            INSERT INTO {} ({EXECUTION_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (task_name, task_instance) DO NOTHING
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(execution.task_name())
            .bind(execution.instance_id())
            .bind(execution.task_instance.data.as_deref())
            .bind(MappingHelpers::to_millis(execution.execution_time))
            .bind(execution.picked as i64)
            .bind(execution.picked_by.as_deref())
            .bind(MappingHelpers::opt_to_millis(execution.last_heartbeat))
            .bind(execution.consecutive_failures)
            .bind(MappingHelpers::opt_to_millis(execution.last_success))
            .bind(MappingHelpers::opt_to_millis(execution.last_failure))
            .bind(execution.version)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn fetch_due_excluding(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        excluded_task_names: &[String],
    ) -> SchedulerResult<Vec<Execution>> {
        let mut sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM {} WHERE picked = 0 AND execution_time <= ?",
            self.table
        );
        if !excluded_task_names.is_empty() {
            let placeholders = vec!["?"; excluded_task_names.len()].join(", ");
            sql.push_str(&format!(" AND task_name NOT IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY execution_time ASC, task_name ASC, task_instance ASC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(MappingHelpers::to_millis(now));
        for name in excluded_task_names {
            query = query.bind(name.as_str());
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(MappingHelpers::sqlite_row_to_execution).collect()
    }

    #[instrument(skip(self, key, now), fields(key = %key))]
    async fn try_claim(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET picked = 1, picked_by = ?, last_heartbeat = ?, version = version + 1
            WHERE task_name = ? AND task_instance = ? AND version = ? AND picked = 0
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(owner)
            .bind(MappingHelpers::to_millis(now))
            .bind(&key.task_name)
            .bind(&key.instance_id)
            .bind(expected_version)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, key, now), fields(key = %key))]
    async fn update_heartbeat(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET last_heartbeat = ?, version = version + 1
            WHERE task_name = ? AND task_instance = ? AND version = ? AND picked = 1
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(MappingHelpers::to_millis(now))
            .bind(&key.task_name)
            .bind(&key.instance_id)
            .bind(expected_version)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, key, update), fields(key = %key))]
    async fn reschedule(
        &self,
        key: &ExecutionKey,
        expected_version: i64,
        update: &RescheduleUpdate,
    ) -> SchedulerResult<bool> {
        // 未设置的字段通过 COALESCE 保留原值
        let pick_clause = if update.clear_picked {
            "picked = 0, picked_by = NULL, last_heartbeat = NULL,"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE {}
            SET {pick_clause}
                execution_time = ?,
                task_data = COALESCE(?, task_data),
                last_success = COALESCE(?, last_success),
                last_failure = COALESCE(?, last_failure),
                consecutive_failures = COALESCE(?, consecutive_failures),
                version = version + 1
            WHERE task_name = ? AND task_instance = ? AND version = ?
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(MappingHelpers::to_millis(update.next_time))
            .bind(update.new_data.as_deref())
            .bind(MappingHelpers::opt_to_millis(update.last_success))
            .bind(MappingHelpers::opt_to_millis(update.last_failure))
            .bind(update.consecutive_failures)
            .bind(&key.task_name)
            .bind(&key.instance_id)
            .bind(expected_version)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn remove(&self, key: &ExecutionKey, expected_version: i64) -> SchedulerResult<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE task_name = ? AND task_instance = ? AND version = ?",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(&key.task_name)
            .bind(&key.instance_id)
            .bind(expected_version)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn fetch_stale(&self, stale_before: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        let sql = format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM {}
            WHERE picked = 1 AND last_heartbeat < ?
            ORDER BY last_heartbeat ASC
            "#,
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(MappingHelpers::to_millis(stale_before))
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(MappingHelpers::sqlite_row_to_execution).collect()
    }

    #[instrument(skip(self, known_task_names))]
    async fn remove_unresolved(
        &self,
        older_than: DateTime<Utc>,
        known_task_names: &[String],
    ) -> SchedulerResult<u64> {
        let mut sql = format!(
            "DELETE FROM {} WHERE picked = 0 AND execution_time < ?",
            self.table
        );
        if !known_task_names.is_empty() {
            let placeholders = vec!["?"; known_task_names.len()].join(", ");
            sql.push_str(&format!(" AND task_name NOT IN ({placeholders})"));
        }

        let mut query = sqlx::query(&sql).bind(MappingHelpers::to_millis(older_than));
        for name in known_task_names {
            query = query.bind(name.as_str());
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn get(&self, key: &ExecutionKey) -> SchedulerResult<Option<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM {} WHERE task_name = ? AND task_instance = ?",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(&key.task_name)
            .bind(&key.instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref()
            .map(MappingHelpers::sqlite_row_to_execution)
            .transpose()
    }

    async fn get_scheduled_executions(&self) -> SchedulerResult<Vec<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM {} ORDER BY execution_time ASC, task_name ASC, task_instance ASC",
            self.table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(MappingHelpers::sqlite_row_to_execution).collect()
    }
}
