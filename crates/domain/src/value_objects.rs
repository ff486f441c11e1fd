use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entities::{encode_data, Execution};
use scheduler_errors::SchedulerResult;

/// 处理器一次调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Ok,
    Failed { cause: String },
}

/// 处理器调用结束后交给完成/失败策略的上下文
#[derive(Debug, Clone)]
pub struct ExecutionComplete {
    pub execution: Execution,
    pub time_done: DateTime<Utc>,
    pub result: ExecutionResult,
}

impl ExecutionComplete {
    pub fn success(execution: Execution, time_done: DateTime<Utc>) -> Self {
        Self {
            execution,
            time_done,
            result: ExecutionResult::Ok,
        }
    }

    pub fn failure(execution: Execution, time_done: DateTime<Utc>, cause: impl Into<String>) -> Self {
        Self {
            execution,
            time_done,
            result: ExecutionResult::Failed {
                cause: cause.into(),
            },
        }
    }
}

/// 成功后的下一状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionDecision {
    /// 删除记录，仅适用于一次性任务
    Remove,
    /// 原地改写执行时间，`new_data` 为空时保留原数据
    Reschedule {
        next_time: DateTime<Utc>,
        new_data: Option<Vec<u8>>,
    },
}

impl CompletionDecision {
    pub fn reschedule(next_time: DateTime<Utc>) -> Self {
        Self::Reschedule {
            next_time,
            new_data: None,
        }
    }

    pub fn reschedule_with_data<T: Serialize + ?Sized>(
        next_time: DateTime<Utc>,
        data: &T,
    ) -> SchedulerResult<Self> {
        Ok(Self::Reschedule {
            next_time,
            new_data: Some(encode_data(data)?),
        })
    }
}

/// 失败后的下一状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Reschedule { next_time: DateTime<Utc> },
    Remove,
}

/// 死亡执行的恢复方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadExecutionDecision {
    Revive { at: DateTime<Utc> },
    Remove,
}

/// 条件改写的内容；`None` 字段保持存储中的原值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleUpdate {
    pub next_time: DateTime<Utc>,
    pub new_data: Option<Vec<u8>>,
    pub clear_picked: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: Option<i32>,
}

impl RescheduleUpdate {
    pub fn after_success(
        next_time: DateTime<Utc>,
        new_data: Option<Vec<u8>>,
        time_done: DateTime<Utc>,
    ) -> Self {
        Self {
            next_time,
            new_data,
            clear_picked: true,
            last_success: Some(time_done),
            last_failure: None,
            consecutive_failures: Some(0),
        }
    }

    pub fn after_failure(
        next_time: DateTime<Utc>,
        time_done: DateTime<Utc>,
        consecutive_failures: i32,
    ) -> Self {
        Self {
            next_time,
            new_data: None,
            clear_picked: true,
            last_success: None,
            last_failure: Some(time_done),
            consecutive_failures: Some(consecutive_failures),
        }
    }

    pub fn revive(at: DateTime<Utc>) -> Self {
        Self {
            next_time: at,
            new_data: None,
            clear_picked: true,
            last_success: None,
            last_failure: None,
            consecutive_failures: None,
        }
    }

    /// 管理员手动改期，不触碰领取状态
    pub fn manual(next_time: DateTime<Utc>, new_data: Option<Vec<u8>>) -> Self {
        Self {
            next_time,
            new_data,
            clear_picked: false,
            last_success: None,
            last_failure: None,
            consecutive_failures: None,
        }
    }

    /// 在内存中应用改写，供内存存储与测试使用
    pub fn apply_to(&self, execution: &mut Execution) {
        execution.execution_time = self.next_time;
        if let Some(data) = &self.new_data {
            execution.task_instance.data = Some(data.clone());
        }
        if self.clear_picked {
            execution.picked = false;
            execution.picked_by = None;
            execution.last_heartbeat = None;
        }
        if let Some(last_success) = self.last_success {
            execution.last_success = Some(last_success);
        }
        if let Some(last_failure) = self.last_failure {
            execution.last_failure = Some(last_failure);
        }
        if let Some(failures) = self.consecutive_failures {
            execution.consecutive_failures = failures;
        }
        execution.version += 1;
    }
}

/// 调度器的生命周期状态，处理器可以据此协作式地提前结束
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    started: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// 只有第一次调用返回 `true`
    pub fn try_start(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TaskInstance;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
    }

    fn picked_execution() -> Execution {
        let mut execution = Execution::new(TaskInstance::new("t", "i"), at(0));
        execution.consecutive_failures = 2;
        execution.picked_by_owner("node-a", at(1))
    }

    #[test]
    fn test_after_success_resets_failures_and_clears_pick() {
        let mut execution = picked_execution();
        let version = execution.version;
        RescheduleUpdate::after_success(at(10), None, at(2)).apply_to(&mut execution);

        assert_eq!(execution.execution_time, at(10));
        assert!(!execution.picked);
        assert!(execution.picked_by.is_none());
        assert!(execution.last_heartbeat.is_none());
        assert_eq!(execution.consecutive_failures, 0);
        assert_eq!(execution.last_success, Some(at(2)));
        assert_eq!(execution.version, version + 1);
    }

    #[test]
    fn test_after_failure_keeps_data_and_records_failure() {
        let mut execution = picked_execution();
        execution.task_instance.data = Some(b"1".to_vec());
        RescheduleUpdate::after_failure(at(5), at(2), 3).apply_to(&mut execution);

        assert_eq!(execution.task_instance.data, Some(b"1".to_vec()));
        assert_eq!(execution.consecutive_failures, 3);
        assert_eq!(execution.last_failure, Some(at(2)));
        assert!(execution.last_success.is_none());
        assert!(!execution.picked);
    }

    #[test]
    fn test_manual_update_replaces_data() {
        let mut execution = Execution::new(TaskInstance::new("t", "i"), at(0));
        RescheduleUpdate::manual(at(30), Some(b"2".to_vec())).apply_to(&mut execution);
        assert_eq!(execution.execution_time, at(30));
        assert_eq!(execution.task_instance.data, Some(b"2".to_vec()));
    }

    #[test]
    fn test_reschedule_with_data_encodes_payload() {
        let decision = CompletionDecision::reschedule_with_data(at(1), &7u32).unwrap();
        assert_eq!(
            decision,
            CompletionDecision::Reschedule {
                next_time: at(1),
                new_data: Some(b"7".to_vec()),
            }
        );
    }

    #[test]
    fn test_scheduler_state_flags() {
        let state = SchedulerState::new();
        let shared = state.clone();
        assert!(!shared.is_started());
        assert!(state.try_start());
        assert!(!shared.try_start());
        state.set_shutting_down();
        assert!(shared.is_started());
        assert!(shared.is_shutting_down());
    }
}
