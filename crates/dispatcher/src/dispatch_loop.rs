use std::sync::Arc;
use std::time::Duration;

use scheduler_core::SchedulerSettings;
use scheduler_domain::{Clock, ExecutionStore, TaskRegistry};
use scheduler_errors::SchedulerResult;
use scheduler_infrastructure::MetricsCollector;
use scheduler_worker::{ExecutionRunner, WorkerPool};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// 认领与分派循环配置
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// 轮询间隔
    pub polling_interval: Duration,
    /// 单轮最多拉取的行数，运行时还会被空闲槽位数限制
    pub polling_limit: usize,
}

impl DispatchConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            polling_interval: settings.polling_interval,
            polling_limit: settings.polling_limit,
        }
    }
}

/// 一轮认领的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub limit: usize,
    pub fetched: usize,
    pub claimed: usize,
    pub conflicts: usize,
    pub unresolved: usize,
}

impl DispatchReport {
    /// 拉满了一整批且有行被认领，说明可能还有积压
    pub fn is_full_batch(&self) -> bool {
        self.limit > 0 && self.fetched == self.limit && self.claimed > 0
    }
}

/// 认领与分派循环
///
/// 每轮最多拉取 `min(polling_limit, 空闲槽位)` 行，逐行尝试条件认领，认领成功的交给工作池。
/// 竞争失败的行直接放弃，留给下一轮。
pub struct DispatchLoop {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<TaskRegistry>,
    runner: Arc<ExecutionRunner>,
    pool: WorkerPool,
    config: DispatchConfig,
    metrics: MetricsCollector,
    wake: Arc<Notify>,
}

impl DispatchLoop {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<TaskRegistry>,
        runner: Arc<ExecutionRunner>,
        pool: WorkerPool,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
            runner,
            pool,
            config,
            metrics: MetricsCollector::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// 与调用方共享的立即调度信号
    pub fn with_wake_signal(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn wake_signal(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// 执行一轮认领与分派
    pub async fn run_due_executions(&self) -> SchedulerResult<DispatchReport> {
        let mut report = DispatchReport {
            limit: self.config.polling_limit.min(self.pool.free_slots()),
            ..Default::default()
        };
        if report.limit == 0 {
            debug!("没有空闲的工作槽位，跳过本轮拉取");
            return Ok(report);
        }

        let now = self.clock.now();
        let owner = self.runner.scheduler_name().to_string();
        let unresolved = self.registry.unresolved_names();
        let due = self
            .store
            .fetch_due_excluding(now, report.limit, &unresolved)
            .await?;
        report.fetched = due.len();

        for candidate in due {
            let Some(task) = self.registry.resolve(candidate.task_name()) else {
                self.registry.record_unresolved(candidate.task_name());
                report.unresolved += 1;
                continue;
            };
            let Some(permit) = self.pool.try_acquire() else {
                debug!("工作槽位已用完，剩余候选留给下一轮");
                break;
            };

            let key = candidate.key();
            if self
                .store
                .try_claim(&key, candidate.version, &owner, now)
                .await?
            {
                let claimed = candidate.picked_by_owner(&owner, now);
                self.runner.dispatch(task, claimed, permit).await;
                report.claimed += 1;
            } else {
                debug!(execution = %key, version = candidate.version, "认领竞争失败，跳过");
                self.metrics.record_claim_conflict();
                report.conflicts += 1;
            }
        }

        if report.fetched > 0 {
            debug!(
                fetched = report.fetched,
                claimed = report.claimed,
                conflicts = report.conflicts,
                "本轮认领完成"
            );
        }
        Ok(report)
    }

    /// 连续执行认领，直到批次不满或出错
    async fn drain(&self) {
        loop {
            match self.run_due_executions().await {
                Ok(report) if report.is_full_batch() && self.pool.free_slots() > 0 => continue,
                Ok(_) => break,
                Err(e) => {
                    error!(error = %e, "拉取到期执行失败，等待下一轮");
                    break;
                }
            }
        }
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut polling_interval = interval(self.config.polling_interval);
        polling_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            info!(
                interval = ?self.config.polling_interval,
                polling_limit = self.config.polling_limit,
                "认领循环已启动"
            );
            loop {
                tokio::select! {
                    _ = polling_interval.tick() => {}
                    _ = self.wake.notified() => {
                        debug!("收到立即调度信号");
                    }
                    _ = shutdown_rx.recv() => {
                        info!("认领循环收到关闭信号");
                        break;
                    }
                }
                self.drain().await;
            }
        })
    }
}
