//! 执行表的DDL
//!
//! 时间字段统一存为UTC毫秒时间戳（BIGINT），到期与超时比较在两种数据库上都是整数比较。

use std::fmt;

use scheduler_core::is_valid_identifier;
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 经过校验、可以直接拼进SQL的表名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub const DEFAULT: &'static str = "scheduled_tasks";

    pub fn new(name: impl Into<String>) -> SchedulerResult<Self> {
        let name = name.into();
        if !is_valid_identifier(&name) {
            return Err(SchedulerError::config_error(format!("无效的表名: {name}")));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn sqlite_schema(table: &TableName) -> Vec<String> {
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                task_name TEXT NOT NULL,
                task_instance TEXT NOT NULL,
                task_data BLOB,
                execution_time INTEGER NOT NULL,
                picked INTEGER NOT NULL DEFAULT 0,
                picked_by TEXT,
                last_heartbeat INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_success INTEGER,
                last_failure INTEGER,
                version INTEGER NOT NULL,
                PRIMARY KEY (task_name, task_instance)
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_due_idx ON {table} (picked, execution_time)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_heartbeat_idx ON {table} (picked, last_heartbeat)"
        ),
    ]
}

pub fn postgres_schema(table: &TableName) -> Vec<String> {
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                task_name TEXT NOT NULL,
                task_instance TEXT NOT NULL,
                task_data BYTEA,
                execution_time BIGINT NOT NULL,
                picked BOOLEAN NOT NULL DEFAULT FALSE,
                picked_by TEXT,
                last_heartbeat BIGINT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_success BIGINT,
                last_failure BIGINT,
                version BIGINT NOT NULL,
                PRIMARY KEY (task_name, task_instance)
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_due_idx ON {table} (picked, execution_time)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_heartbeat_idx ON {table} (picked, last_heartbeat)"
        ),
    ]
}
