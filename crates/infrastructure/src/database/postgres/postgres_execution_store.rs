use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};

use scheduler_domain::{Execution, ExecutionKey, ExecutionStore, RescheduleUpdate};
use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::database::mapping::{MappingHelpers, EXECUTION_COLUMNS};
use crate::database::schema::{postgres_schema, TableName};

pub struct PostgresExecutionStore {
    pool: PgPool,
    table: TableName,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: TableName::default(),
        }
    }

    pub fn with_table(pool: PgPool, table: TableName) -> Self {
        Self { pool, table }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 创建表和索引（幂等）
    pub async fn create_schema(&self) -> SchedulerResult<()> {
        for statement in postgres_schema(&self.table) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;
        }
        debug!("PostgreSQL执行表已就绪: {}", self.table);
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, execution), fields(key = %execution.key()))]
    async fn insert(&self, execution: &Execution) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            INSERT INTO {} ({EXECUTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (task_name, task_instance) DO NOTHING
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(execution.task_name())
            .bind(execution.instance_id())
            .bind(execution.task_instance.data.as_deref())
            .bind(MappingHelpers::to_millis(execution.execution_time))
            .bind(execution.picked)
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
        let sql = format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM {}
            WHERE picked = FALSE AND execution_time <= $1 AND task_name <> ALL($2)
            ORDER BY execution_time ASC, task_name ASC, task_instance ASC
            LIMIT $3
            "#,
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(MappingHelpers::to_millis(now))
            .bind(excluded_task_names.to_vec())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(MappingHelpers::pg_row_to_execution).collect()
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
            SET picked = TRUE, picked_by = $1, last_heartbeat = $2, version = version + 1
            WHERE task_name = $3 AND task_instance = $4 AND version = $5 AND picked = FALSE
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
            SET last_heartbeat = $1, version = version + 1
            WHERE task_name = $2 AND task_instance = $3 AND version = $4 AND picked = TRUE
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
            "picked = FALSE, picked_by = NULL, last_heartbeat = NULL,"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE {}
            SET {pick_clause}
                execution_time = $1,
                task_data = COALESCE($2, task_data),
                last_success = COALESCE($3, last_success),
                last_failure = COALESCE($4, last_failure),
                consecutive_failures = COALESCE($5, consecutive_failures),
                version = version + 1
            WHERE task_name = $6 AND task_instance = $7 AND version = $8
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
            "DELETE FROM {} WHERE task_name = $1 AND task_instance = $2 AND version = $3",
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
            WHERE picked = TRUE AND last_heartbeat < $1
            ORDER BY last_heartbeat ASC
            "#,
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(MappingHelpers::to_millis(stale_before))
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(MappingHelpers::pg_row_to_execution).collect()
    }

    #[instrument(skip(self, known_task_names))]
    async fn remove_unresolved(
        &self,
        older_than: DateTime<Utc>,
        known_task_names: &[String],
    ) -> SchedulerResult<u64> {
        let sql = format!(
            r#"
            DELETE FROM {}
            WHERE picked = FALSE AND execution_time < $1 AND task_name <> ALL($2)
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(MappingHelpers::to_millis(older_than))
            .bind(known_task_names.to_vec())
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn get(&self, key: &ExecutionKey) -> SchedulerResult<Option<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM {} WHERE task_name = $1 AND task_instance = $2",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(&key.task_name)
            .bind(&key.instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref()
            .map(MappingHelpers::pg_row_to_execution)
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

        rows.iter().map(MappingHelpers::pg_row_to_execution).collect()
    }
}
