use std::time::Duration;

/// 引擎运行参数，已解析所有默认值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub threads: usize,
    pub heartbeat_interval: Duration,
    pub polling_interval: Duration,
    pub polling_limit: usize,
    pub scheduler_name: String,
    pub immediate_execution_enabled: bool,
    pub delete_unresolved_after: Duration,
    pub unresolved_cleanup_interval: Duration,
    pub missed_heartbeats_limit: u32,
    pub dead_detection_multiplier: u32,
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let threads = 10;
        Self {
            threads,
            heartbeat_interval: Duration::from_secs(5 * 60),
            polling_interval: Duration::from_secs(30),
            polling_limit: threads * 3,
            scheduler_name: default_scheduler_name(),
            immediate_execution_enabled: false,
            delete_unresolved_after: Duration::from_secs(14 * 24 * 3600),
            unresolved_cleanup_interval: Duration::from_secs(3600),
            missed_heartbeats_limit: 4,
            dead_detection_multiplier: 2,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerSettings {
    /// 最后心跳早于 now - stale_threshold 的执行被判定为死亡
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats_limit
    }

    pub fn dead_detection_interval(&self) -> Duration {
        self.heartbeat_interval * self.dead_detection_multiplier
    }
}

/// 主机名，获取失败时退回固定名称
pub fn default_scheduler_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "table-scheduler".to_string())
}
