use std::sync::Arc;
use std::time::Duration;

use scheduler_core::SchedulerSettings;
use scheduler_domain::{Clock, ExecutionStore, TaskRegistry};
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::MetricsCollector;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// 未解析任务清理配置
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// 执行时间早于 now - delete_unresolved_after 的未解析执行会被删除
    pub delete_unresolved_after: Duration,
    /// 清理间隔
    pub cleanup_interval: Duration,
}

impl CleanupConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            delete_unresolved_after: settings.delete_unresolved_after,
            cleanup_interval: settings.unresolved_cleanup_interval,
        }
    }
}

/// 未解析任务清理服务
///
/// 删除引用了本地注册表中不存在的任务名、且已过保留期的未领取执行，
/// 用于清理任务改名或下线后遗留的行。
pub struct CleanupService {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<TaskRegistry>,
    metrics: MetricsCollector,
    config: CleanupConfig,
}

impl CleanupService {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<TaskRegistry>,
        metrics: MetricsCollector,
        config: CleanupConfig,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
            metrics,
            config,
        }
    }

    /// 执行一次清理，返回删除的行数
    pub async fn delete_unresolved(&self) -> SchedulerResult<u64> {
        let retention = chrono::Duration::from_std(self.config.delete_unresolved_after)
            .map_err(|e| SchedulerError::Configuration(format!("保留期超出范围: {e}")))?;
        let older_than = self.clock.now() - retention;

        let removed = self
            .store
            .remove_unresolved(older_than, &self.registry.task_names())
            .await?;

        if removed > 0 {
            self.metrics.record_unresolved_deleted(removed);
            info!(
                removed = removed,
                unresolved = ?self.registry.unresolved_names(),
                "已删除未解析任务的执行"
            );
        } else {
            debug!("没有需要清理的未解析执行");
        }
        Ok(removed)
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut cleanup_interval = interval(self.config.cleanup_interval);
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            info!(interval = ?self.config.cleanup_interval, "未解析任务清理服务已启动");
            loop {
                tokio::select! {
                    _ = cleanup_interval.tick() => {
                        if let Err(e) = self.delete_unresolved().await {
                            error!(error = %e, "清理未解析执行失败");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("未解析任务清理服务收到关闭信号");
                        break;
                    }
                }
            }
        })
    }
}
