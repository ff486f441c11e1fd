use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use scheduler_errors::{SchedulerError, SchedulerResult};

/// 执行实例的自然键 (task_name, instance_id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub task_name: String,
    pub instance_id: String,
}

impl ExecutionKey {
    pub fn new(task_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_name, self.instance_id)
    }
}

/// 序列化任务数据，调用方与处理器约定数据类型
pub fn encode_data<T: Serialize + ?Sized>(data: &T) -> SchedulerResult<Vec<u8>> {
    Ok(serde_json::to_vec(data)?)
}

/// 一个可调度的任务实例，携带不透明的序列化数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task_name: String,
    pub id: String,
    pub data: Option<Vec<u8>>,
}

impl TaskInstance {
    pub fn new(task_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            id: id.into(),
            data: None,
        }
    }

    /// 附加类型化数据
    pub fn with_data<T: Serialize + ?Sized>(mut self, data: &T) -> SchedulerResult<Self> {
        self.data = Some(encode_data(data)?);
        Ok(self)
    }

    pub fn with_raw_data(mut self, data: Option<Vec<u8>>) -> Self {
        self.data = data;
        self
    }

    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(self.task_name.clone(), self.id.clone())
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// 按调用方期望的类型读取数据；没有数据时按 `null` 解析，
    /// 因此 `()` 与 `Option<T>` 总能读取成功
    pub fn data_as<T: DeserializeOwned>(&self) -> SchedulerResult<T> {
        let bytes = self.data.as_deref().unwrap_or(b"null");
        serde_json::from_slice(bytes).map_err(|e| SchedulerError::DataTypeMismatch {
            key: self.key().to_string(),
            message: e.to_string(),
        })
    }
}

/// 持久化的执行记录，`version` 是唯一的并发控制手段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub task_instance: TaskInstance,
    pub execution_time: DateTime<Utc>,
    pub picked: bool,
    pub picked_by: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Execution {
    pub const INITIAL_VERSION: i64 = 1;

    pub fn new(task_instance: TaskInstance, execution_time: DateTime<Utc>) -> Self {
        Self {
            task_instance,
            execution_time,
            picked: false,
            picked_by: None,
            last_heartbeat: None,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            version: Self::INITIAL_VERSION,
        }
    }

    pub fn key(&self) -> ExecutionKey {
        self.task_instance.key()
    }

    pub fn task_name(&self) -> &str {
        &self.task_instance.task_name
    }

    pub fn instance_id(&self) -> &str {
        &self.task_instance.id
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.picked && self.execution_time <= now
    }

    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.picked
            && self
                .last_heartbeat
                .map(|heartbeat| heartbeat < stale_before)
                .unwrap_or(false)
    }

    /// 认领成功后记录在存储中的样子
    pub fn picked_by_owner(&self, owner: &str, now: DateTime<Utc>) -> Execution {
        Execution {
            picked: true,
            picked_by: Some(owner.to_string()),
            last_heartbeat: Some(now),
            version: self.version + 1,
            ..self.clone()
        }
    }
}

/// 提供给调用方的只读视图
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledExecution {
    execution: Execution,
}

impl ScheduledExecution {
    pub fn key(&self) -> ExecutionKey {
        self.execution.key()
    }

    pub fn task_instance(&self) -> &TaskInstance {
        &self.execution.task_instance
    }

    pub fn execution_time(&self) -> DateTime<Utc> {
        self.execution.execution_time
    }

    pub fn is_picked(&self) -> bool {
        self.execution.picked
    }

    pub fn picked_by(&self) -> Option<&str> {
        self.execution.picked_by.as_deref()
    }

    pub fn consecutive_failures(&self) -> i32 {
        self.execution.consecutive_failures
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.execution.last_success
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.execution.last_failure
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> SchedulerResult<T> {
        self.execution.task_instance.data_as()
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }
}

impl From<Execution> for ScheduledExecution {
    fn from(execution: Execution) -> Self {
        Self { execution }
    }
}
