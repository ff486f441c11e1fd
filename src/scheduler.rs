//! 调度器门面：组装工作池、认领循环、心跳、死亡执行检测与清理，并提供手动调度接口

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerConfig, SchedulerSettings};
use scheduler_dispatcher::{
    CleanupConfig, CleanupService, DeadExecutionDetector, DeadExecutionDetectorConfig,
    DeadExecutionReport, DispatchConfig, DispatchLoop, DispatchReport,
};
use scheduler_domain::{
    Clock, Execution, ExecutionKey, ExecutionStore, RescheduleUpdate, ScheduledExecution,
    SchedulerState, SystemClock, Task, TaskInstance, TaskRegistry,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::MetricsCollector;
use scheduler_worker::{
    CurrentlyExecutingMap, ExecutingSnapshot, ExecutionRunner, HeartbeatManager, HeartbeatReport,
    WorkerPool,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownManager;

/// 调度器构建器
pub struct SchedulerBuilder {
    store: Arc<dyn ExecutionStore>,
    tasks: Vec<Task>,
    settings: SchedulerSettings,
    /// 显式设置的拉取上限；未设置时跟随 `threads * 3`
    polling_limit: Option<usize>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
}

impl SchedulerBuilder {
    fn new(store: Arc<dyn ExecutionStore>, tasks: Vec<Task>) -> Self {
        Self {
            store,
            tasks,
            settings: SchedulerSettings::default(),
            polling_limit: None,
            clock: Arc::new(SystemClock),
            metrics: MetricsCollector::new(),
        }
    }

    /// 使用配置文件中的调度参数
    pub fn from_config(self, config: &SchedulerConfig) -> Self {
        let polling_limit = config.polling_limit;
        let mut builder = self.settings(config.to_settings());
        builder.polling_limit = polling_limit;
        builder
    }

    /// 整体替换运行参数，其中的拉取上限视为显式设置
    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.polling_limit = Some(settings.polling_limit);
        self.settings = settings;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.settings.threads = threads;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.settings.heartbeat_interval = interval;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.settings.polling_interval = interval;
        self
    }

    pub fn polling_limit(mut self, limit: usize) -> Self {
        self.polling_limit = Some(limit);
        self
    }

    pub fn scheduler_name(mut self, name: impl Into<String>) -> Self {
        self.settings.scheduler_name = name.into();
        self
    }

    pub fn enable_immediate_execution(mut self) -> Self {
        self.settings.immediate_execution_enabled = true;
        self
    }

    pub fn delete_unresolved_after(mut self, after: Duration) -> Self {
        self.settings.delete_unresolved_after = after;
        self
    }

    pub fn missed_heartbeats_limit(mut self, limit: u32) -> Self {
        self.settings.missed_heartbeats_limit = limit;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.settings.shutdown_timeout = timeout;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    fn validate(settings: &SchedulerSettings) -> SchedulerResult<()> {
        if settings.threads == 0 {
            return Err(SchedulerError::config_error("工作线程数必须大于0"));
        }
        if settings.polling_limit == 0 {
            return Err(SchedulerError::config_error("轮询上限必须大于0"));
        }
        if settings.heartbeat_interval.is_zero() || settings.polling_interval.is_zero() {
            return Err(SchedulerError::config_error("心跳间隔和轮询间隔必须大于0"));
        }
        if settings.unresolved_cleanup_interval.is_zero() || settings.dead_detection_multiplier == 0
        {
            return Err(SchedulerError::config_error("清理间隔和死亡检测倍数必须大于0"));
        }
        if settings.missed_heartbeats_limit < 2 {
            return Err(SchedulerError::config_error(format!(
                "missed_heartbeats_limit 必须不小于2，当前: {}",
                settings.missed_heartbeats_limit
            )));
        }
        if settings.scheduler_name.trim().is_empty() {
            return Err(SchedulerError::config_error("调度器名称不能为空"));
        }
        Ok(())
    }

    pub fn build(self) -> SchedulerResult<Scheduler> {
        let mut settings = self.settings;
        settings.polling_limit = self
            .polling_limit
            .unwrap_or_else(|| settings.threads.saturating_mul(3));
        Self::validate(&settings)?;

        let registry = Arc::new(TaskRegistry::new(self.tasks)?);
        let state = SchedulerState::new();
        let pool = WorkerPool::new(settings.threads);
        let executing = Arc::new(CurrentlyExecutingMap::new());
        let wake = Arc::new(Notify::new());

        let runner = Arc::new(ExecutionRunner::new(
            self.store.clone(),
            self.clock.clone(),
            executing.clone(),
            self.metrics.clone(),
            settings.scheduler_name.clone(),
            state.clone(),
        ));
        let dispatch = Arc::new(
            DispatchLoop::new(
                self.store.clone(),
                self.clock.clone(),
                registry.clone(),
                runner,
                pool.clone(),
                DispatchConfig::from_settings(&settings),
            )
            .with_metrics(self.metrics.clone())
            .with_wake_signal(wake.clone()),
        );
        let heartbeats = Arc::new(HeartbeatManager::new(
            self.store.clone(),
            self.clock.clone(),
            executing.clone(),
            self.metrics.clone(),
            settings.heartbeat_interval,
        ));
        let detector = Arc::new(DeadExecutionDetector::new(
            self.store.clone(),
            self.clock.clone(),
            registry.clone(),
            self.metrics.clone(),
            DeadExecutionDetectorConfig::from_settings(&settings),
        ));
        let cleanup = Arc::new(CleanupService::new(
            self.store.clone(),
            self.clock.clone(),
            registry.clone(),
            self.metrics.clone(),
            CleanupConfig::from_settings(&settings),
        ));

        info!(
            scheduler_name = %settings.scheduler_name,
            threads = settings.threads,
            polling_limit = settings.polling_limit,
            tasks = registry.len(),
            "调度器已创建"
        );

        Ok(Scheduler {
            store: self.store,
            clock: self.clock,
            registry,
            settings,
            state,
            pool,
            executing,
            wake,
            dispatch,
            heartbeats,
            detector,
            cleanup,
            shutdown: ShutdownManager::new(),
        })
    }
}

/// 集群协作的持久化任务调度器
///
/// 同一张执行表可以被多个进程共享，进程之间只通过对 `version` 的条件写入协调。
pub struct Scheduler {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<TaskRegistry>,
    settings: SchedulerSettings,
    state: SchedulerState,
    pool: WorkerPool,
    executing: Arc<CurrentlyExecutingMap>,
    wake: Arc<Notify>,
    dispatch: Arc<DispatchLoop>,
    heartbeats: Arc<HeartbeatManager>,
    detector: Arc<DeadExecutionDetector>,
    cleanup: Arc<CleanupService>,
    shutdown: ShutdownManager,
}

impl Scheduler {
    pub fn builder(store: Arc<dyn ExecutionStore>, tasks: Vec<Task>) -> SchedulerBuilder {
        SchedulerBuilder::new(store, tasks)
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn scheduler_name(&self) -> &str {
        &self.settings.scheduler_name
    }

    pub fn state(&self) -> SchedulerState {
        self.state.clone()
    }

    /// 按名称查找已注册的任务
    pub fn task(&self, name: &str) -> SchedulerResult<Arc<Task>> {
        self.registry
            .resolve(name)
            .ok_or_else(|| SchedulerError::UnknownTask {
                name: name.to_string(),
            })
    }

    /// 插入新执行；同一实例键已存在时返回 `AlreadyExists`
    pub async fn schedule(&self, instance: TaskInstance, at: DateTime<Utc>) -> SchedulerResult<()> {
        let key = instance.key();
        if !self.store.insert(&Execution::new(instance, at)).await? {
            return Err(SchedulerError::already_exists(key));
        }
        debug!(execution = %key, execution_time = %at, "已调度执行");
        self.wake_if_due(at);
        Ok(())
    }

    /// 实例键不存在时才插入，返回是否插入
    pub async fn schedule_if_not_exists(
        &self,
        instance: TaskInstance,
        at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        match self.schedule(instance, at).await {
            Ok(()) => Ok(true),
            Err(SchedulerError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 修改未在运行的执行的时间，`new_data` 为 `None` 时保留原数据
    pub async fn reschedule(
        &self,
        key: &ExecutionKey,
        at: DateTime<Utc>,
        new_data: Option<Vec<u8>>,
    ) -> SchedulerResult<()> {
        let current = self.unpicked_execution(key).await?;
        let update = RescheduleUpdate::manual(at, new_data);
        if !self.store.reschedule(key, current.version, &update).await? {
            return Err(SchedulerError::concurrent_modification(key));
        }
        info!(execution = %key, execution_time = %at, "执行已改期");
        self.wake_if_due(at);
        Ok(())
    }

    /// 删除未在运行的执行
    pub async fn cancel(&self, key: &ExecutionKey) -> SchedulerResult<()> {
        let current = self.unpicked_execution(key).await?;
        if !self.store.remove(key, current.version).await? {
            return Err(SchedulerError::concurrent_modification(key));
        }
        info!(execution = %key, "执行已取消");
        Ok(())
    }

    async fn unpicked_execution(&self, key: &ExecutionKey) -> SchedulerResult<Execution> {
        let current = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| SchedulerError::execution_not_found(key))?;
        if current.picked {
            return Err(SchedulerError::execution_picked(key));
        }
        Ok(current)
    }

    fn wake_if_due(&self, at: DateTime<Utc>) {
        if self.settings.immediate_execution_enabled && at <= self.clock.now() {
            self.wake.notify_one();
        }
    }

    /// 唤醒认领循环立即拉取一次
    pub fn trigger_check_for_due_executions(&self) {
        self.wake.notify_one();
    }

    pub async fn get_scheduled_execution(
        &self,
        key: &ExecutionKey,
    ) -> SchedulerResult<Option<ScheduledExecution>> {
        Ok(self.store.get(key).await?.map(ScheduledExecution::from))
    }

    pub async fn get_scheduled_executions(&self) -> SchedulerResult<Vec<ScheduledExecution>> {
        Ok(self
            .store
            .get_scheduled_executions()
            .await?
            .into_iter()
            .map(ScheduledExecution::from)
            .collect())
    }

    /// 本进程正在运行的执行
    pub async fn currently_executing(&self) -> Vec<ExecutingSnapshot> {
        self.executing.snapshot().await
    }

    /// 插入启动任务并启动四个后台循环
    pub async fn start(&self) -> SchedulerResult<()> {
        if self.state.is_started() {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.schedule_startup_tasks().await?;
        if !self.state.try_start() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let shutdown = &self.shutdown;
        shutdown
            .register(
                "dispatch-loop",
                self.dispatch.clone().start(shutdown.subscribe().await),
            )
            .await;
        shutdown
            .register(
                "heartbeat-manager",
                self.heartbeats.clone().start(shutdown.subscribe().await),
            )
            .await;
        shutdown
            .register(
                "dead-execution-detector",
                self.detector.clone().start(shutdown.subscribe().await),
            )
            .await;
        shutdown
            .register(
                "unresolved-cleanup",
                self.cleanup.clone().start(shutdown.subscribe().await),
            )
            .await;

        info!(scheduler_name = %self.settings.scheduler_name, "调度器已启动");
        Ok(())
    }

    async fn schedule_startup_tasks(&self) -> SchedulerResult<()> {
        let now = self.clock.now();
        for task in self.registry.startup_tasks() {
            let Some(execution) = task.startup_execution(now) else {
                continue;
            };
            let key = execution.key();
            if self.store.insert(&execution).await? {
                info!(
                    execution = %key,
                    execution_time = %execution.execution_time,
                    "已创建启动任务的执行"
                );
            } else {
                debug!(execution = %key, "启动任务的执行已存在，保留原有记录");
            }
        }
        Ok(())
    }

    /// 停止所有后台循环，并在超时内等待正在运行的处理器结束
    ///
    /// 超时后仍在运行的执行被放弃：它们之后的写回会因版本检查失败而被丢弃。
    pub async fn stop(&self, timeout: Duration) -> SchedulerResult<()> {
        if !self.state.is_started() {
            return Err(SchedulerError::NotStarted);
        }
        info!(timeout = ?timeout, "开始关闭调度器");
        let deadline = Instant::now() + timeout;

        self.state.set_shutting_down();
        self.shutdown.shutdown().await;

        let aborted = self.shutdown.join(timeout).await;
        if !aborted.is_empty() {
            warn!(components = ?aborted, "部分后台循环被强制中止");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if self.pool.wait_for_idle(remaining).await {
            info!("调度器已关闭");
            return Ok(());
        }

        let abandoned = self.executing.snapshot().await;
        for snapshot in &abandoned {
            warn!(
                execution = %snapshot.key,
                started_at = %snapshot.started_at,
                "关闭超时，放弃仍在运行的执行"
            );
        }
        Err(SchedulerError::ShutdownTimeout {
            in_flight: self.pool.in_flight(),
        })
    }

    /// 执行一轮认领与分派
    pub async fn run_due_executions(&self) -> SchedulerResult<DispatchReport> {
        self.dispatch.run_due_executions().await
    }

    pub async fn detect_dead_executions(&self) -> SchedulerResult<DeadExecutionReport> {
        self.detector.detect_dead_executions().await
    }

    pub async fn update_heartbeats(&self) -> HeartbeatReport {
        self.heartbeats.update_heartbeats().await
    }

    pub async fn delete_unresolved(&self) -> SchedulerResult<u64> {
        self.cleanup.delete_unresolved().await
    }

    /// 等待所有已分派的执行写回结果
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_for_idle(timeout).await
    }
}
