use thiserror::Error;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("执行实例已存在: {key}")]
    AlreadyExists { key: String },
    #[error("执行实例未找到: {key}")]
    ExecutionNotFound { key: String },
    #[error("执行实例正在运行中: {key}")]
    ExecutionPicked { key: String },
    #[error("执行实例已被并发修改: {key}")]
    ConcurrentModification { key: String },
    #[error("任务数据类型不匹配: {key} - {message}")]
    DataTypeMismatch { key: String, message: String },
    #[error("无效的调度表达式: {0}")]
    InvalidSchedule(String),
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("未注册的任务: {name}")]
    UnknownTask { name: String },
    #[error("重复注册的任务: {name}")]
    DuplicateTask { name: String },
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("调度器已启动")]
    AlreadyStarted,
    #[error("调度器未启动")]
    NotStarted,
    #[error("关闭超时: {in_flight} 个执行仍在运行")]
    ShutdownTimeout { in_flight: usize },
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn already_exists(key: impl ToString) -> Self {
        Self::AlreadyExists {
            key: key.to_string(),
        }
    }
    pub fn execution_not_found(key: impl ToString) -> Self {
        Self::ExecutionNotFound {
            key: key.to_string(),
        }
    }
    pub fn execution_picked(key: impl ToString) -> Self {
        Self::ExecutionPicked {
            key: key.to_string(),
        }
    }
    pub fn concurrent_modification(key: impl ToString) -> Self {
        Self::ConcurrentModification {
            key: key.to_string(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    /// 存储层暂时不可用，下一个周期重试即可
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::DatabaseOperation(_)
        )
    }
    /// 调用方可以通过重新读取后重试来解决的冲突
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SchedulerError::AlreadyExists { .. }
                | SchedulerError::ExecutionPicked { .. }
                | SchedulerError::ConcurrentModification { .. }
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
