use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::cron_utils::CronSchedule;
use crate::value_objects::ExecutionComplete;
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 周期任务的下一次执行时间策略
pub trait Schedule: Send + Sync + fmt::Debug {
    fn next_execution_time(&self, complete: &ExecutionComplete) -> DateTime<Utc>;

    /// 启动时首次调度的时间
    fn initial_execution_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now
    }
}

/// 上次结束后固定间隔再执行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn of(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn of_seconds(seconds: i64) -> Self {
        Self::of(Duration::seconds(seconds))
    }

    pub fn of_millis(millis: i64) -> Self {
        Self::of(Duration::milliseconds(millis))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Schedule for FixedDelay {
    fn next_execution_time(&self, complete: &ExecutionComplete) -> DateTime<Utc> {
        complete.time_done + self.delay
    }
}

/// 每天在固定的UTC时刻执行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Daily {
    times: Vec<NaiveTime>,
}

impl Daily {
    pub fn at(times: impl IntoIterator<Item = NaiveTime>) -> SchedulerResult<Self> {
        let mut times: Vec<NaiveTime> = times.into_iter().collect();
        if times.is_empty() {
            return Err(SchedulerError::InvalidSchedule(
                "DAILY 至少需要一个时间点".to_string(),
            ));
        }
        times.sort();
        times.dedup();
        Ok(Self { times })
    }

    /// 严格晚于 `after` 的下一个时间点
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let date = after.date_naive();
        let time = after.time();
        if let Some(next) = self.times.iter().find(|t| **t > time) {
            return date.and_time(*next).and_utc();
        }
        let tomorrow = date.succ_opt().unwrap_or(date);
        tomorrow.and_time(self.times[0]).and_utc()
    }
}

impl Schedule for Daily {
    fn next_execution_time(&self, complete: &ExecutionComplete) -> DateTime<Utc> {
        self.next_after(complete.time_done)
    }

    fn initial_execution_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.next_after(now)
    }
}

/// 解析配置中的调度表达式:
/// `FIXED_DELAY|30s`、`DAILY|12:00,18:30`、`CRON|0 */5 * * * *`
pub fn parse_schedule(expr: &str) -> SchedulerResult<Arc<dyn Schedule>> {
    let (kind, body) = expr
        .split_once('|')
        .ok_or_else(|| SchedulerError::InvalidSchedule(expr.to_string()))?;

    match kind.trim().to_ascii_uppercase().as_str() {
        "FIXED_DELAY" => Ok(Arc::new(FixedDelay::of(parse_duration(body.trim())?))),
        "DAILY" => {
            let times = body
                .split(',')
                .map(|t| {
                    NaiveTime::parse_from_str(t.trim(), "%H:%M")
                        .map_err(|e| SchedulerError::InvalidSchedule(format!("{t}: {e}")))
                })
                .collect::<SchedulerResult<Vec<_>>>()?;
            Ok(Arc::new(Daily::at(times)?))
        }
        "CRON" => Ok(Arc::new(CronSchedule::new(body.trim())?)),
        _ => Err(SchedulerError::InvalidSchedule(expr.to_string())),
    }
}

fn parse_duration(text: &str) -> SchedulerResult<Duration> {
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("缺少时间单位: {text}")))?;
    let (amount, unit) = text.split_at(split);
    let amount: i64 = amount
        .parse()
        .map_err(|_| SchedulerError::InvalidSchedule(format!("无效的时长: {text}")))?;

    let duration = match unit {
        "ms" => Duration::try_milliseconds(amount),
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        _ => {
            return Err(SchedulerError::InvalidSchedule(format!(
                "不支持的时间单位: {unit}"
            )))
        }
    }
    .ok_or_else(|| SchedulerError::InvalidSchedule(format!("时长超出范围: {text}")))?;
    if duration <= Duration::zero() {
        return Err(SchedulerError::InvalidSchedule(format!("时长必须大于0: {text}")));
    }
    Ok(duration)
}
