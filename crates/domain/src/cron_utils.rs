use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronExpression;
use tracing::warn;

use crate::schedule::Schedule;
use crate::value_objects::ExecutionComplete;
use scheduler_errors::{SchedulerError, SchedulerResult};

/// CRON表达式调度（秒级，6或7个字段）
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: CronExpression,
}

impl CronSchedule {
    /// 创建新的CRON调度
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let schedule =
            CronExpression::from_str(cron_expr).map_err(|e| SchedulerError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            expression: cron_expr.to_string(),
            schedule,
        })
    }

    /// 获取下一次执行时间
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

}

impl Schedule for CronSchedule {
    fn next_execution_time(&self, complete: &ExecutionComplete) -> DateTime<Utc> {
        match self.next_after(complete.time_done) {
            Some(next) => next,
            None => {
                // 表达式不会再触发，推迟到最远的时间点
                warn!(
                    "CRON表达式 {} 在 {} 之后没有执行时间",
                    self.expression,
                    complete.time_done.format("%Y-%m-%d %H:%M:%S UTC")
                );
                DateTime::<Utc>::MAX_UTC
            }
        }
    }

    fn initial_execution_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.next_after(now).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
