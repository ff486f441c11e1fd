use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, sqlite::SqliteRow, Row};

use scheduler_domain::{Execution, TaskInstance};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 查询执行记录时使用的列
pub const EXECUTION_COLUMNS: &str = "task_name, task_instance, task_data, execution_time, picked, \
     picked_by, last_heartbeat, consecutive_failures, last_success, last_failure, version";

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn to_millis(time: DateTime<Utc>) -> i64 {
        time.timestamp_millis()
    }

    pub fn opt_to_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
        time.map(Self::to_millis)
    }

    pub fn from_millis(millis: i64, column: &str) -> SchedulerResult<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            SchedulerError::DatabaseOperation(format!("列 {column} 的时间戳超出范围: {millis}"))
        })
    }

    pub fn opt_from_millis(
        millis: Option<i64>,
        column: &str,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        millis.map(|m| Self::from_millis(m, column)).transpose()
    }

    pub fn sqlite_row_to_execution(row: &SqliteRow) -> SchedulerResult<Execution> {
        let instance = TaskInstance::new(
            row.try_get::<String, _>("task_name")?,
            row.try_get::<String, _>("task_instance")?,
        )
        .with_raw_data(row.try_get("task_data")?);

        Ok(Execution {
            task_instance: instance,
            execution_time: Self::from_millis(row.try_get("execution_time")?, "execution_time")?,
            picked: row.try_get::<i64, _>("picked")? != 0,
            picked_by: row.try_get("picked_by")?,
            last_heartbeat: Self::opt_from_millis(row.try_get("last_heartbeat")?, "last_heartbeat")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            last_success: Self::opt_from_millis(row.try_get("last_success")?, "last_success")?,
            last_failure: Self::opt_from_millis(row.try_get("last_failure")?, "last_failure")?,
            version: row.try_get("version")?,
        })
    }

    pub fn pg_row_to_execution(row: &PgRow) -> SchedulerResult<Execution> {
        let instance = TaskInstance::new(
            row.try_get::<String, _>("task_name")?,
            row.try_get::<String, _>("task_instance")?,
        )
        .with_raw_data(row.try_get("task_data")?);

        Ok(Execution {
            task_instance: instance,
            execution_time: Self::from_millis(row.try_get("execution_time")?, "execution_time")?,
            picked: row.try_get("picked")?,
            picked_by: row.try_get("picked_by")?,
            last_heartbeat: Self::opt_from_millis(row.try_get("last_heartbeat")?, "last_heartbeat")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            last_success: Self::opt_from_millis(row.try_get("last_success")?, "last_success")?,
            last_failure: Self::opt_from_millis(row.try_get("last_failure")?, "last_failure")?,
            version: row.try_get("version")?,
        })
    }
}
