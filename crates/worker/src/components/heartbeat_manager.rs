use std::sync::Arc;
use std::time::Duration;

use scheduler_domain::{Clock, ExecutionStore};
use scheduler_infrastructure::MetricsCollector;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::currently_executing::CurrentlyExecutingMap;

/// 一轮心跳的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub renewed: usize,
    pub lost: usize,
    pub errors: usize,
}

/// 为本进程持有的执行续约
pub struct HeartbeatManager {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    executing: Arc<CurrentlyExecutingMap>,
    metrics: MetricsCollector,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        executing: Arc<CurrentlyExecutingMap>,
        metrics: MetricsCollector,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            executing,
            metrics,
            heartbeat_interval,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// 对每个正在执行的条目发出一次条件心跳
    ///
    /// 版本不匹配说明该行已被接管，条目被标记为租约丢失，之后的完成写入会被丢弃。
    pub async fn update_heartbeats(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();

        for entry in self.executing.entries().await {
            let key = entry.key();
            let mut version = entry.lock_version().await;
            if entry.is_finished() || entry.is_lease_lost() {
                continue;
            }

            match self
                .store
                .update_heartbeat(&key, *version, self.clock.now())
                .await
            {
                Ok(true) => {
                    *version += 1;
                    report.renewed += 1;
                }
                Ok(false) => {
                    entry.mark_lease_lost();
                    report.lost += 1;
                    self.metrics.record_heartbeat_failure();
                    warn!(
                        task_name = %key.task_name,
                        instance_id = %key.instance_id,
                        version = *version,
                        "心跳版本不匹配，执行已被其他进程接管"
                    );
                }
                Err(e) => {
                    report.errors += 1;
                    self.metrics.record_heartbeat_failure();
                    error!(
                        task_name = %key.task_name,
                        instance_id = %key.instance_id,
                        error = %e,
                        "更新心跳失败"
                    );
                }
            }
        }

        if report.renewed + report.lost + report.errors > 0 {
            debug!(
                renewed = report.renewed,
                lost = report.lost,
                errors = report.errors,
                "心跳更新完成"
            );
        }
        report
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut heartbeat_interval = interval(self.heartbeat_interval);
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            info!(interval = ?self.heartbeat_interval, "心跳管理器已启动");
            loop {
                tokio::select! {
                    _ = heartbeat_interval.tick() => {
                        self.update_heartbeats().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("心跳管理器收到关闭信号");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use scheduler_domain::{Execution, RescheduleUpdate, SettableClock, TaskInstance};
    use scheduler_infrastructure::InMemoryExecutionStore;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
    }

    async fn claimed(store: &InMemoryExecutionStore, id: &str) -> Execution {
        let instance = TaskInstance::new("t", id);
        let key = instance.key();
        store.insert(&Execution::new(instance, start())).await.unwrap();
        store.try_claim(&key, 1, "node-a", start()).await.unwrap();
        store.get(&key).await.unwrap().unwrap()
    }

    fn manager(
        store: Arc<InMemoryExecutionStore>,
        clock: SettableClock,
        executing: Arc<CurrentlyExecutingMap>,
    ) -> HeartbeatManager {
        HeartbeatManager::new(
            store,
            Arc::new(clock),
            executing,
            MetricsCollector::new(),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_heartbeat_renews_and_tracks_version() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let clock = SettableClock::new(start());
        let executing = Arc::new(CurrentlyExecutingMap::new());
        let execution = claimed(&store, "1").await;
        let entry = executing.register(execution.clone(), start()).await;
        let heartbeats = manager(store.clone(), clock.clone(), executing);

        clock.advance(ChronoDuration::seconds(10));
        let report = heartbeats.update_heartbeats().await;
        assert_eq!(report.renewed, 1);
        assert_eq!(entry.current_version().await, 3);

        let stored = store.get(&execution.key()).await.unwrap().unwrap();
        assert_eq!(stored.last_heartbeat, Some(start() + ChronoDuration::seconds(10)));
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn test_heartbeat_mismatch_marks_lease_lost() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let clock = SettableClock::new(start());
        let executing = Arc::new(CurrentlyExecutingMap::new());
        let execution = claimed(&store, "1").await;
        let entry = executing.register(execution.clone(), start()).await;
        store
            .reschedule(&execution.key(), 2, &RescheduleUpdate::revive(start()))
            .await
            .unwrap();
        let heartbeats = manager(store.clone(), clock, executing);

        let report = heartbeats.update_heartbeats().await;
        assert_eq!(report.lost, 1);
        assert!(entry.is_lease_lost());

        // 已丢失的条目不再续约
        let report = heartbeats.update_heartbeats().await;
        assert_eq!(report, HeartbeatReport::default());
    }

    #[tokio::test]
    async fn test_finished_entries_are_skipped() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let executing = Arc::new(CurrentlyExecutingMap::new());
        let execution = claimed(&store, "1").await;
        let entry = executing.register(execution, start()).await;
        entry.mark_finished();
        let heartbeats = manager(store, SettableClock::new(start()), executing);

        assert_eq!(heartbeats.update_heartbeats().await.renewed, 0);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let heartbeats = Arc::new(manager(
            store,
            SettableClock::new(start()),
            Arc::new(CurrentlyExecutingMap::new()),
        ));
        let (tx, rx) = broadcast::channel(1);
        let handle = heartbeats.start(rx);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
