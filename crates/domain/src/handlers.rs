//! 每个任务可插拔的完成、失败与死亡执行策略。
//!
//! 策略只计算下一状态，写回存储由执行引擎负责。

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::entities::Execution;
use crate::schedule::Schedule;
use crate::value_objects::{
    CompletionDecision, DeadExecutionDecision, ExecutionComplete, FailureDecision,
};

pub trait CompletionHandler: Send + Sync + fmt::Debug {
    fn complete(&self, complete: &ExecutionComplete) -> CompletionDecision;
}

pub trait FailureHandler: Send + Sync + fmt::Debug {
    fn on_failure(&self, complete: &ExecutionComplete) -> FailureDecision;
}

pub trait DeadExecutionHandler: Send + Sync + fmt::Debug {
    fn on_dead(&self, execution: &Execution, now: DateTime<Utc>) -> DeadExecutionDecision;
}

/// 一次性任务默认：成功即删除
#[derive(Debug, Default, Clone, Copy)]
pub struct OnCompleteRemove;

impl CompletionHandler for OnCompleteRemove {
    fn complete(&self, _complete: &ExecutionComplete) -> CompletionDecision {
        CompletionDecision::Remove
    }
}

/// 周期任务默认：按调度策略原地改期
#[derive(Debug, Clone)]
pub struct OnCompleteReschedule {
    schedule: Arc<dyn Schedule>,
    new_data: Option<Vec<u8>>,
}

impl OnCompleteReschedule {
    pub fn new(schedule: Arc<dyn Schedule>) -> Self {
        Self {
            schedule,
            new_data: None,
        }
    }

    pub fn with_data(schedule: Arc<dyn Schedule>, new_data: Vec<u8>) -> Self {
        Self {
            schedule,
            new_data: Some(new_data),
        }
    }
}

impl CompletionHandler for OnCompleteReschedule {
    fn complete(&self, complete: &ExecutionComplete) -> CompletionDecision {
        CompletionDecision::Reschedule {
            next_time: self.schedule.next_execution_time(complete),
            new_data: self.new_data.clone(),
        }
    }
}

/// 一次性任务默认：固定延迟后重试
#[derive(Debug, Clone, Copy)]
pub struct OnFailureRetryLater {
    delay: Duration,
}

impl OnFailureRetryLater {
    pub const DEFAULT_DELAY_MINUTES: i64 = 5;

    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for OnFailureRetryLater {
    fn default() -> Self {
        Self::new(Duration::minutes(Self::DEFAULT_DELAY_MINUTES))
    }
}

impl FailureHandler for OnFailureRetryLater {
    fn on_failure(&self, complete: &ExecutionComplete) -> FailureDecision {
        FailureDecision::Reschedule {
            next_time: complete.time_done + self.delay,
        }
    }
}

/// 周期任务默认：忽略失败，按调度策略继续
#[derive(Debug, Clone)]
pub struct OnFailureReschedule {
    schedule: Arc<dyn Schedule>,
}

impl OnFailureReschedule {
    pub fn new(schedule: Arc<dyn Schedule>) -> Self {
        Self { schedule }
    }
}

impl FailureHandler for OnFailureReschedule {
    fn on_failure(&self, complete: &ExecutionComplete) -> FailureDecision {
        FailureDecision::Reschedule {
            next_time: self.schedule.next_execution_time(complete),
        }
    }
}

/// 按连续失败次数指数退避
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoffFailureHandler {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoffFailureHandler {
    /// 未设置上限时的最大等待时间
    pub const DEFAULT_MAX_DELAY_DAYS: i64 = 30;

    pub fn new(initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// 第 `previous_failures + 1` 次失败后的等待时间，不超过上限
    pub fn delay_for(&self, previous_failures: i32) -> Duration {
        let cap = self
            .max_delay
            .unwrap_or_else(|| Duration::days(Self::DEFAULT_MAX_DELAY_DAYS));
        let factor = self.multiplier.max(1.0).powi(previous_failures.max(0));
        let millis = self.initial_delay.num_milliseconds() as f64 * factor;
        if !millis.is_finite() || millis >= cap.num_milliseconds() as f64 {
            return cap;
        }
        Duration::try_milliseconds(millis as i64).unwrap_or(cap)
    }
}

impl FailureHandler for ExponentialBackoffFailureHandler {
    fn on_failure(&self, complete: &ExecutionComplete) -> FailureDecision {
        let delay = self.delay_for(complete.execution.consecutive_failures);
        FailureDecision::Reschedule {
            next_time: complete
                .time_done
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// 超过最大重试次数后删除记录，否则交给内层策略
#[derive(Debug, Clone)]
pub struct MaxRetriesFailureHandler {
    max_retries: u32,
    inner: Arc<dyn FailureHandler>,
}

impl MaxRetriesFailureHandler {
    pub fn new(max_retries: u32, inner: Arc<dyn FailureHandler>) -> Self {
        Self { max_retries, inner }
    }
}

impl FailureHandler for MaxRetriesFailureHandler {
    fn on_failure(&self, complete: &ExecutionComplete) -> FailureDecision {
        let failures = complete.execution.consecutive_failures.max(0) as u32 + 1;
        if failures > self.max_retries {
            FailureDecision::Remove
        } else {
            self.inner.on_failure(complete)
        }
    }
}

/// 默认：清除领取状态，立即可被任意存活进程重新领取
#[derive(Debug, Default, Clone, Copy)]
pub struct ReviveDeadExecution;

impl DeadExecutionHandler for ReviveDeadExecution {
    fn on_dead(&self, _execution: &Execution, now: DateTime<Utc>) -> DeadExecutionDecision {
        DeadExecutionDecision::Revive { at: now }
    }
}

/// 严格策略：永久失败，删除记录不再重试
#[derive(Debug, Default, Clone, Copy)]
pub struct CancelDeadExecution;

impl DeadExecutionHandler for CancelDeadExecution {
    fn on_dead(&self, _execution: &Execution, _now: DateTime<Utc>) -> DeadExecutionDecision {
        DeadExecutionDecision::Remove
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TaskInstance;
    use crate::schedule::FixedDelay;
    use chrono::TimeZone;

    fn done() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn failed_with(previous_failures: i32) -> ExecutionComplete {
        let mut execution = Execution::new(TaskInstance::new("t", "i"), done());
        execution.consecutive_failures = previous_failures;
        ExecutionComplete::failure(execution, done(), "boom")
    }

    #[test]
    fn test_on_complete_remove() {
        let complete = ExecutionComplete::success(
            Execution::new(TaskInstance::new("t", "i"), done()),
            done(),
        );
        assert_eq!(OnCompleteRemove.complete(&complete), CompletionDecision::Remove);
    }

    #[test]
    fn test_on_complete_reschedule_uses_schedule() {
        let handler = OnCompleteReschedule::new(Arc::new(FixedDelay::of_seconds(5)));
        let complete = ExecutionComplete::success(
            Execution::new(TaskInstance::new("t", "i"), done()),
            done(),
        );
        assert_eq!(
            handler.complete(&complete),
            CompletionDecision::reschedule(done() + Duration::seconds(5))
        );
    }

    #[test]
    fn test_retry_later() {
        let handler = OnFailureRetryLater::new(Duration::seconds(10));
        assert_eq!(
            handler.on_failure(&failed_with(0)),
            FailureDecision::Reschedule {
                next_time: done() + Duration::seconds(10)
            }
        );
        assert_eq!(
            OnFailureRetryLater::default().on_failure(&failed_with(0)),
            FailureDecision::Reschedule {
                next_time: done() + Duration::minutes(5)
            }
        );
    }

    #[test]
    fn test_exponential_backoff_escalates_and_caps() {
        let handler = ExponentialBackoffFailureHandler::new(Duration::seconds(1), 2.0)
            .with_max_delay(Duration::seconds(5));
        assert_eq!(handler.delay_for(0), Duration::seconds(1));
        assert_eq!(handler.delay_for(1), Duration::seconds(2));
        assert_eq!(handler.delay_for(2), Duration::seconds(4));
        assert_eq!(handler.delay_for(3), Duration::seconds(5));
        assert_eq!(
            handler.on_failure(&failed_with(2)),
            FailureDecision::Reschedule {
                next_time: done() + Duration::seconds(4)
            }
        );
    }

    #[test]
    fn test_exponential_backoff_without_cap_uses_default_limit() {
        let handler = ExponentialBackoffFailureHandler::new(Duration::seconds(1), 1e9);
        let limit = Duration::days(ExponentialBackoffFailureHandler::DEFAULT_MAX_DELAY_DAYS);
        assert_eq!(handler.delay_for(2), limit);
        assert_eq!(handler.delay_for(i32::MAX), limit);
        assert_eq!(
            handler.on_failure(&failed_with(2)),
            FailureDecision::Reschedule {
                next_time: done() + limit
            }
        );
    }

    #[test]
    fn test_max_retries_removes_after_limit() {
        let handler = MaxRetriesFailureHandler::new(
            2,
            Arc::new(OnFailureRetryLater::new(Duration::seconds(1))),
        );
        assert!(matches!(
            handler.on_failure(&failed_with(0)),
            FailureDecision::Reschedule { .. }
        ));
        assert!(matches!(
            handler.on_failure(&failed_with(1)),
            FailureDecision::Reschedule { .. }
        ));
        assert_eq!(handler.on_failure(&failed_with(2)), FailureDecision::Remove);
    }

    #[test]
    fn test_dead_execution_handlers() {
        let execution = Execution::new(TaskInstance::new("t", "i"), done());
        assert_eq!(
            ReviveDeadExecution.on_dead(&execution, done()),
            DeadExecutionDecision::Revive { at: done() }
        );
        assert_eq!(
            CancelDeadExecution.on_dead(&execution, done()),
            DeadExecutionDecision::Remove
        );
    }
}
