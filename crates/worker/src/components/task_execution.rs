use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use scheduler_domain::{
    Clock, CompletionDecision, Execution, ExecutionComplete, ExecutionContext, ExecutionKey,
    ExecutionStore, FailureDecision, FailureHandler, OnFailureRetryLater, RescheduleUpdate,
    SchedulerState, Task, TaskKind,
};
use scheduler_errors::SchedulerResult;
use scheduler_infrastructure::MetricsCollector;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::currently_executing::{CurrentlyExecuting, CurrentlyExecutingMap};

enum HandlerOutcome {
    Succeeded(Option<CompletionDecision>),
    Failed(String),
}

/// 调用处理器并把结果写回存储
///
/// 每次写回都以认领或最近一次心跳之后的版本为条件；条件不成立说明执行已被接管，
/// 结果被丢弃而不是重试。
pub struct ExecutionRunner {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    executing: Arc<CurrentlyExecutingMap>,
    metrics: MetricsCollector,
    scheduler_name: String,
    state: SchedulerState,
}

impl ExecutionRunner {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        executing: Arc<CurrentlyExecutingMap>,
        metrics: MetricsCollector,
        scheduler_name: impl Into<String>,
        state: SchedulerState,
    ) -> Self {
        Self {
            store,
            clock,
            executing,
            metrics,
            scheduler_name: scheduler_name.into(),
            state,
        }
    }

    pub fn executing(&self) -> &Arc<CurrentlyExecutingMap> {
        &self.executing
    }

    pub fn scheduler_name(&self) -> &str {
        &self.scheduler_name
    }

    /// 登记已认领的执行并在工作池槽位上运行，许可在写回结果后归还
    pub async fn dispatch(
        self: &Arc<Self>,
        task: Arc<Task>,
        claimed: Execution,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<()> {
        let entry = self.executing.register(claimed, self.clock.now()).await;
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.run(task, entry).await;
            drop(permit);
        })
    }

    async fn run(&self, task: Arc<Task>, entry: Arc<CurrentlyExecuting>) {
        let execution = entry.execution().clone();
        let key = execution.key();
        debug!(
            task_name = %key.task_name,
            instance_id = %key.instance_id,
            version = execution.version,
            "开始执行"
        );

        self.metrics.execution_started();
        let started = Instant::now();
        let outcome = self.invoke(&task, &execution).await;
        let time_done = self.clock.now();
        self.metrics.record_execution(
            task.name(),
            matches!(outcome, HandlerOutcome::Succeeded(_)),
            started.elapsed().as_secs_f64(),
        );

        self.complete(&task, &entry, outcome, time_done).await;
        self.executing.remove(&key).await;
        self.metrics.execution_finished();
    }

    /// 处理器在独立任务中运行，panic 通过 `JoinError` 转为失败
    async fn invoke(&self, task: &Task, execution: &Execution) -> HandlerOutcome {
        let handler = task.handler().clone();
        let instance = execution.task_instance.clone();
        let context = ExecutionContext {
            execution: execution.clone(),
            scheduler_name: self.scheduler_name.clone(),
            state: self.state.clone(),
        };

        let joined = tokio::spawn(async move { handler.execute(&instance, &context).await }).await;
        match joined {
            Ok(Ok(decision)) => HandlerOutcome::Succeeded(decision),
            Ok(Err(e)) => HandlerOutcome::Failed(e.cause()),
            Err(e) => HandlerOutcome::Failed(join_error_cause(e)),
        }
    }

    async fn complete(
        &self,
        task: &Task,
        entry: &CurrentlyExecuting,
        outcome: HandlerOutcome,
        time_done: DateTime<Utc>,
    ) {
        let key = entry.key();
        let mut version = entry.lock_version().await;
        entry.mark_finished();

        if entry.is_lease_lost() {
            warn!(
                task_name = %key.task_name,
                instance_id = %key.instance_id,
                version = *version,
                "执行租约已丢失，丢弃执行结果"
            );
            self.metrics.record_stale_write_discarded();
            return;
        }

        let mut execution = entry.execution().clone();
        execution.version = *version;

        let written = match outcome {
            HandlerOutcome::Succeeded(custom) => {
                let complete = ExecutionComplete::success(execution, time_done);
                let decision = match custom {
                    Some(CompletionDecision::Remove) if task.kind() == TaskKind::Recurring => {
                        warn!(task_name = %key.task_name, "周期任务不能删除自身执行，改用完成策略");
                        evaluate_policy(&key, "完成策略", || {
                            task.completion_handler().complete(&complete)
                        })
                    }
                    Some(decision) => Some(decision),
                    None => evaluate_policy(&key, "完成策略", || {
                        task.completion_handler().complete(&complete)
                    }),
                };
                match decision {
                    Some(decision) => self.apply_completion(&complete, decision, *version).await,
                    None => {
                        let failures = complete.execution.consecutive_failures + 1;
                        let fallback = OnFailureRetryLater::default().on_failure(&complete);
                        self.apply_failure(&complete, fallback, failures, *version)
                            .await
                    }
                }
            }
            HandlerOutcome::Failed(cause) => {
                let failures = execution.consecutive_failures + 1;
                warn!(
                    task_name = %key.task_name,
                    instance_id = %key.instance_id,
                    consecutive_failures = failures,
                    cause = %cause,
                    "任务执行失败"
                );
                let complete = ExecutionComplete::failure(execution, time_done, cause);
                let decision = evaluate_policy(&key, "失败策略", || {
                    task.failure_handler().on_failure(&complete)
                })
                .unwrap_or_else(|| OnFailureRetryLater::default().on_failure(&complete));
                self.apply_failure(&complete, decision, failures, *version).await
            }
        };

        match written {
            Ok(true) => *version += 1,
            Ok(false) => {
                warn!(
                    task_name = %key.task_name,
                    instance_id = %key.instance_id,
                    version = *version,
                    "写回结果时版本不匹配，执行已被接管，丢弃结果"
                );
                self.metrics.record_stale_write_discarded();
            }
            Err(e) => {
                error!(
                    task_name = %key.task_name,
                    instance_id = %key.instance_id,
                    error = %e,
                    "写回执行结果失败，等待死亡执行检测恢复"
                );
            }
        }
    }

    async fn apply_completion(
        &self,
        complete: &ExecutionComplete,
        decision: CompletionDecision,
        version: i64,
    ) -> SchedulerResult<bool> {
        let key = complete.execution.key();
        match decision {
            CompletionDecision::Remove => {
                debug!(execution = %key, "执行完成，删除记录");
                self.store.remove(&key, version).await
            }
            CompletionDecision::Reschedule {
                next_time,
                new_data,
            } => {
                debug!(execution = %key, next_time = %next_time, "执行完成，改期");
                let update = RescheduleUpdate::after_success(next_time, new_data, complete.time_done);
                self.store.reschedule(&key, version, &update).await
            }
        }
    }

    async fn apply_failure(
        &self,
        complete: &ExecutionComplete,
        decision: FailureDecision,
        consecutive_failures: i32,
        version: i64,
    ) -> SchedulerResult<bool> {
        let key = complete.execution.key();
        match decision {
            FailureDecision::Reschedule { next_time } => {
                debug!(execution = %key, next_time = %next_time, "失败后改期重试");
                let update =
                    RescheduleUpdate::after_failure(next_time, complete.time_done, consecutive_failures);
                self.store.reschedule(&key, version, &update).await
            }
            FailureDecision::Remove => {
                info!(
                    execution = %key,
                    consecutive_failures = consecutive_failures,
                    "失败策略决定不再重试，删除记录"
                );
                self.store.remove(&key, version).await
            }
        }
    }
}

/// 策略中的 panic 被记录后返回 `None`，调用方改用默认失败策略，执行仍有状态转换
fn evaluate_policy<T>(
    key: &ExecutionKey,
    policy_name: &str,
    policy: impl FnOnce() -> T,
) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(policy)) {
        Ok(decision) => Some(decision),
        Err(payload) => {
            error!(
                task_name = %key.task_name,
                instance_id = %key.instance_id,
                policy = policy_name,
                cause = %panic_message(payload.as_ref()),
                "策略panic，按默认失败策略稍后重试"
            );
            None
        }
    }
}

fn join_error_cause(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("处理器被取消: {err}");
    }
    format!("处理器panic: {}", panic_message(err.into_panic().as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::WorkerPool;
    use chrono::{Duration, TimeZone};
    use scheduler_domain::{
        CompletionHandler, ExponentialBackoffFailureHandler, FixedDelay, HandlerResult,
        SettableClock, TaskError, TaskInstance, Tasks,
    };
    use scheduler_infrastructure::InMemoryExecutionStore;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryExecutionStore>,
        clock: SettableClock,
        runner: Arc<ExecutionRunner>,
        pool: WorkerPool,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryExecutionStore::new());
        let clock = SettableClock::new(start());
        let runner = Arc::new(ExecutionRunner::new(
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(CurrentlyExecutingMap::new()),
            MetricsCollector::new(),
            "node-a",
            SchedulerState::new(),
        ));
        Fixture {
            store,
            clock,
            runner,
            pool: WorkerPool::new(2),
        }
    }

    impl Fixture {
        async fn claim(&self, instance: TaskInstance) -> Execution {
            self.claim_execution(Execution::new(instance, start())).await
        }

        async fn claim_execution(&self, execution: Execution) -> Execution {
            let key = execution.key();
            self.store.insert(&execution).await.unwrap();
            assert!(self
                .store
                .try_claim(&key, execution.version, "node-a", start())
                .await
                .unwrap());
            self.store.get(&key).await.unwrap().unwrap()
        }

        async fn run(&self, task: Task, claimed: Execution) {
            let permit = self.pool.try_acquire().unwrap();
            self.runner
                .dispatch(Arc::new(task), claimed, permit)
                .await
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_one_time_success_removes_row() {
        let f = fixture();
        let claimed = f.claim(TaskInstance::new("once", "1")).await;
        let task = Tasks::one_time("once").execute_fn(|_, _| async { HandlerResult::Ok(None) });

        f.run(task, claimed.clone()).await;

        assert!(f.store.get(&claimed.key()).await.unwrap().is_none());
        assert!(f.runner.executing().is_empty().await);
        assert_eq!(f.pool.free_slots(), 2);
    }

    #[tokio::test]
    async fn test_recurring_success_reschedules_in_place() {
        let f = fixture();
        let claimed = f.claim(TaskInstance::new("tick", "recurring")).await;
        let task = Tasks::recurring("tick", Arc::new(FixedDelay::of_seconds(5)))
            .execute_fn(|_, _| async { HandlerResult::Ok(None) });
        f.clock.advance(Duration::seconds(1));

        f.run(task, claimed.clone()).await;

        let stored = f.store.get(&claimed.key()).await.unwrap().unwrap();
        assert!(!stored.picked);
        assert_eq!(stored.execution_time, start() + Duration::seconds(6));
        assert_eq!(stored.consecutive_failures, 0);
        assert_eq!(stored.last_success, Some(start() + Duration::seconds(1)));
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn test_failure_retries_later() {
        let f = fixture();
        let claimed = f.claim(TaskInstance::new("once", "1")).await;
        let task = Tasks::one_time("once")
            .on_failure_retry_later(Duration::seconds(10))
            .execute_fn(|_, _| async { HandlerResult::Err(TaskError::new("boom")) });

        f.run(task, claimed.clone()).await;

        let stored = f.store.get(&claimed.key()).await.unwrap().unwrap();
        assert!(!stored.picked);
        assert_eq!(stored.consecutive_failures, 1);
        assert_eq!(stored.last_failure, Some(start()));
        assert_eq!(stored.execution_time, start() + Duration::seconds(10));
    }

    #[tokio::test]
    async fn test_panic_is_routed_to_failure_policy() {
        let f = fixture();
        let claimed = f.claim(TaskInstance::new("once", "1")).await;
        let task = Tasks::one_time("once").execute_fn(|_, _| async {
            if true {
                panic!("handler exploded");
            }
            HandlerResult::Ok(None)
        });

        f.run(task, claimed.clone()).await;

        let stored = f.store.get(&claimed.key()).await.unwrap().unwrap();
        assert_eq!(stored.consecutive_failures, 1);
        assert!(!stored.picked);
        assert_eq!(f.pool.free_slots(), 2);
    }

    #[tokio::test]
    async fn test_custom_decision_replaces_data() {
        let f = fixture();
        let claimed = f
            .claim(TaskInstance::new("counter", "c").with_data(&1u32).unwrap())
            .await;
        let task = Tasks::custom("counter").execute_fn(|instance, context| async move {
            let n: u32 = instance.data_as()?;
            let next = context.scheduled_time() + Duration::minutes(1);
            HandlerResult::Ok(Some(CompletionDecision::reschedule_with_data(next, &(n + 1))?))
        });

        f.run(task, claimed.clone()).await;

        let stored = f.store.get(&claimed.key()).await.unwrap().unwrap();
        assert_eq!(stored.task_instance.data_as::<u32>().unwrap(), 2);
        assert_eq!(stored.execution_time, start() + Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_stale_version_write_is_discarded() {
        let f = fixture();
        let claimed = f.claim(TaskInstance::new("once", "1")).await;
        // 另一个进程在处理器运行期间复活并改写了该行
        f.store
            .reschedule(&claimed.key(), 2, &RescheduleUpdate::revive(start()))
            .await
            .unwrap();
        let task = Tasks::one_time("once").execute_fn(|_, _| async { HandlerResult::Ok(None) });

        f.run(task, claimed.clone()).await;

        let stored = f.store.get(&claimed.key()).await.unwrap().unwrap();
        assert_eq!(stored.version, 3);
        assert!(!stored.picked);
    }

    #[tokio::test]
    async fn test_lease_lost_skips_write() {
        let f = fixture();
        let claimed = f.claim(TaskInstance::new("once", "1")).await;
        let entry = f.runner.executing().register(claimed.clone(), start()).await;
        entry.mark_lease_lost();
        let task = Arc::new(
            Tasks::one_time("once").execute_fn(|_, _| async { HandlerResult::Ok(None) }),
        );

        f.runner.run(task, entry).await;

        let stored = f.store.get(&claimed.key()).await.unwrap().unwrap();
        assert!(stored.picked);
        assert_eq!(stored.version, 2);
    }

    #[derive(Debug)]
    struct ExplodingCompletion;

    impl CompletionHandler for ExplodingCompletion {
        fn complete(&self, _complete: &ExecutionComplete) -> CompletionDecision {
            panic!("completion policy exploded");
        }
    }

    #[tokio::test]
    async fn test_huge_backoff_still_reschedules() {
        let f = fixture();
        let mut execution = Execution::new(TaskInstance::new("once", "1"), start());
        execution.consecutive_failures = 2;
        let claimed = f.claim_execution(execution).await;
        let task = Tasks::one_time("once")
            .on_failure(Arc::new(ExponentialBackoffFailureHandler::new(
                Duration::seconds(1),
                1e9,
            )))
            .execute_fn(|_, _| async { HandlerResult::Err(TaskError::new("boom")) });

        f.run(task, claimed.clone()).await;

        let stored = f.store.get(&claimed.key()).await.unwrap().unwrap();
        assert!(!stored.picked);
        assert_eq!(stored.consecutive_failures, 3);
        assert_eq!(
            stored.execution_time,
            start() + Duration::days(ExponentialBackoffFailureHandler::DEFAULT_MAX_DELAY_DAYS)
        );
        assert!(f.runner.executing().is_empty().await);
        assert_eq!(f.pool.free_slots(), 2);
    }

    #[tokio::test]
    async fn test_panicking_completion_policy_falls_back_to_retry() {
        let f = fixture();
        let claimed = f.claim(TaskInstance::new("once", "1")).await;
        let task = Tasks::one_time("once")
            .on_complete(Arc::new(ExplodingCompletion))
            .execute_fn(|_, _| async { HandlerResult::Ok(None) });

        f.run(task, claimed.clone()).await;

        let stored = f.store.get(&claimed.key()).await.unwrap().unwrap();
        assert!(!stored.picked);
        assert_eq!(stored.consecutive_failures, 1);
        assert_eq!(stored.last_failure, Some(start()));
        assert_eq!(
            stored.execution_time,
            start() + Duration::minutes(OnFailureRetryLater::DEFAULT_DELAY_MINUTES)
        );
        assert!(f.runner.executing().is_empty().await);
        assert_eq!(f.pool.free_slots(), 2);
    }
}
