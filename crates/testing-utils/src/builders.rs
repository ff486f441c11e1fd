//! 测试数据构造器

use chrono::{DateTime, TimeZone, Utc};
use scheduler_domain::{Execution, TaskInstance};
use serde::Serialize;

/// 测试用的固定起始时间
pub fn test_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Builder for creating test Execution entities
pub struct ExecutionBuilder {
    execution: Execution,
}

impl ExecutionBuilder {
    pub fn new(task_name: &str, instance_id: &str) -> Self {
        Self {
            execution: Execution::new(TaskInstance::new(task_name, instance_id), test_time()),
        }
    }

    pub fn with_execution_time(mut self, at: DateTime<Utc>) -> Self {
        self.execution.execution_time = at;
        self
    }

    pub fn with_data<T: Serialize + ?Sized>(mut self, data: &T) -> Self {
        self.execution.task_instance = self
            .execution
            .task_instance
            .with_data(data)
            .expect("test data must serialize");
        self
    }

    /// 处于被 `owner` 领取状态，版本与真实认领后一致
    pub fn picked_by(mut self, owner: &str, heartbeat: DateTime<Utc>) -> Self {
        self.execution = self.execution.picked_by_owner(owner, heartbeat);
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.execution.version = version;
        self
    }

    pub fn with_consecutive_failures(mut self, failures: i32) -> Self {
        self.execution.consecutive_failures = failures;
        self
    }

    pub fn build(self) -> Execution {
        self.execution
    }
}
