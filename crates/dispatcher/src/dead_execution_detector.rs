use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scheduler_core::SchedulerSettings;
use scheduler_domain::{
    Clock, DeadExecutionDecision, DeadExecutionHandler, Execution, ExecutionStore,
    RescheduleUpdate, ReviveDeadExecution, TaskRegistry,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::MetricsCollector;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 死亡执行检测配置
#[derive(Debug, Clone)]
pub struct DeadExecutionDetectorConfig {
    /// 最后心跳早于 now - stale_threshold 即判定为死亡
    pub stale_threshold: Duration,
    /// 检测间隔
    pub detection_interval: Duration,
}

impl DeadExecutionDetectorConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            stale_threshold: settings.stale_threshold(),
            detection_interval: settings.dead_detection_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadExecutionReport {
    pub found: usize,
    pub revived: usize,
    pub removed: usize,
    /// 写入时版本已变化，通常是原持有者恢复了心跳
    pub conflicts: usize,
    /// 写入出错，留待下一轮检测
    pub failed: usize,
}

/// 死亡执行检测器
///
/// 查找心跳超时的已领取执行，按任务的死亡执行策略复活或删除。写入同样以观察到的版本为条件，
/// 与迟到的心跳竞争时谁先写入谁生效。
pub struct DeadExecutionDetector {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<TaskRegistry>,
    metrics: MetricsCollector,
    config: DeadExecutionDetectorConfig,
}

impl DeadExecutionDetector {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<TaskRegistry>,
        metrics: MetricsCollector,
        config: DeadExecutionDetectorConfig,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
            metrics,
            config,
        }
    }

    fn stale_before(&self, now: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold).map_err(|e| {
            SchedulerError::Configuration(format!("死亡判定阈值超出范围: {e}"))
        })?;
        Ok(now - threshold)
    }

    /// 执行一轮检测
    pub async fn detect_dead_executions(&self) -> SchedulerResult<DeadExecutionReport> {
        let now = self.clock.now();
        let stale = self.store.fetch_stale(self.stale_before(now)?).await?;
        let mut report = DeadExecutionReport {
            found: stale.len(),
            ..Default::default()
        };

        for execution in stale {
            self.metrics.record_dead_execution();
            warn!(
                task_name = %execution.task_name(),
                instance_id = %execution.instance_id(),
                picked_by = execution.picked_by.as_deref().unwrap_or("-"),
                last_heartbeat = ?execution.last_heartbeat,
                "发现死亡执行"
            );
            if let Err(e) = self.handle_dead_execution(&execution, now, &mut report).await {
                report.failed += 1;
                error!(
                    execution = %execution.key(),
                    error = %e,
                    "处理死亡执行失败，等待下一轮检测"
                );
            }
        }

        if report.found > 0 {
            info!(
                found = report.found,
                revived = report.revived,
                removed = report.removed,
                conflicts = report.conflicts,
                failed = report.failed,
                "死亡执行检测完成"
            );
        }
        Ok(report)
    }

    async fn handle_dead_execution(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
        report: &mut DeadExecutionReport,
    ) -> SchedulerResult<()> {
        let key = execution.key();
        // 无法解析的任务按默认策略复活，之后由未解析清理删除
        let decision = match self.registry.resolve(execution.task_name()) {
            Some(task) => task.dead_execution_handler().on_dead(execution, now),
            None => {
                self.registry.record_unresolved(execution.task_name());
                ReviveDeadExecution.on_dead(execution, now)
            }
        };

        let written = match decision {
            DeadExecutionDecision::Revive { at } => {
                let written = self
                    .store
                    .reschedule(&key, execution.version, &RescheduleUpdate::revive(at))
                    .await?;
                if written {
                    report.revived += 1;
                    info!(execution = %key, at = %at, "死亡执行已复活");
                }
                written
            }
            DeadExecutionDecision::Remove => {
                let written = self.store.remove(&key, execution.version).await?;
                if written {
                    report.removed += 1;
                    error!(execution = %key, "死亡执行按策略取消，不再重试");
                }
                written
            }
        };

        if !written {
            report.conflicts += 1;
            debug!(execution = %key, version = execution.version, "死亡执行已被其他写入更新，跳过");
        }
        Ok(())
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut detection_interval = interval(self.config.detection_interval);
        detection_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            info!(
                interval = ?self.config.detection_interval,
                stale_threshold = ?self.config.stale_threshold,
                "死亡执行检测器已启动"
            );
            loop {
                tokio::select! {
                    _ = detection_interval.tick() => {
                        if let Err(e) = self.detect_dead_executions().await {
                            error!(error = %e, "死亡执行检测失败，等待下一轮");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("死亡执行检测器收到关闭信号");
                        break;
                    }
                }
            }
        })
    }
}
