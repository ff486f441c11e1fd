use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::settings::{default_scheduler_name, SchedulerSettings};

/// 调度引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 工作池大小
    pub threads: usize,
    pub heartbeat_interval_seconds: u64,
    pub polling_interval_ms: u64,
    /// 每次拉取的上限，未设置时为 threads * 3
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_limit: Option<usize>,
    /// 写入 picked_by 的实例标识，未设置时使用主机名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    /// 本地调度到期任务时立即唤醒拉取循环
    pub immediate_execution_enabled: bool,
    pub delete_unresolved_after_hours: u64,
    pub unresolved_cleanup_interval_seconds: u64,
    /// 心跳超时倍数，超过后判定为死亡执行
    pub missed_heartbeats_limit: u32,
    /// 死亡执行检测间隔相对心跳间隔的倍数
    pub dead_detection_multiplier: u32,
    pub shutdown_timeout_seconds: u64,
    pub table_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threads: 10,
            heartbeat_interval_seconds: 300,
            polling_interval_ms: 30_000,
            polling_limit: None,
            scheduler_name: None,
            immediate_execution_enabled: false,
            delete_unresolved_after_hours: 14 * 24,
            unresolved_cleanup_interval_seconds: 3600,
            missed_heartbeats_limit: 4,
            dead_detection_multiplier: 2,
            shutdown_timeout_seconds: 30,
            table_name: "scheduled_tasks".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threads == 0 {
            return Err(anyhow::anyhow!("工作线程数必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.polling_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        if self.polling_limit == Some(0) {
            return Err(anyhow::anyhow!("轮询上限必须大于0"));
        }

        if let Some(name) = &self.scheduler_name {
            if name.trim().is_empty() {
                return Err(anyhow::anyhow!("调度器名称不能为空"));
            }
        }

        // 阈值小于2倍心跳会把正常的心跳抖动判定为死亡
        if self.missed_heartbeats_limit < 2 {
            return Err(anyhow::anyhow!(
                "missed_heartbeats_limit 必须不小于2，当前: {}",
                self.missed_heartbeats_limit
            ));
        }

        if self.dead_detection_multiplier == 0 {
            return Err(anyhow::anyhow!("死亡执行检测倍数必须大于0"));
        }

        if self.unresolved_cleanup_interval_seconds == 0 {
            return Err(anyhow::anyhow!("未解析任务清理间隔必须大于0"));
        }

        if !is_valid_identifier(&self.table_name) {
            return Err(anyhow::anyhow!("无效的表名: {}", self.table_name));
        }

        Ok(())
    }

    /// 转换为引擎使用的运行参数
    pub fn to_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            threads: self.threads,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            polling_interval: Duration::from_millis(self.polling_interval_ms),
            polling_limit: self.polling_limit.unwrap_or(self.threads * 3),
            scheduler_name: self
                .scheduler_name
                .clone()
                .unwrap_or_else(default_scheduler_name),
            immediate_execution_enabled: self.immediate_execution_enabled,
            delete_unresolved_after: Duration::from_secs(
                self.delete_unresolved_after_hours * 3600,
            ),
            unresolved_cleanup_interval: Duration::from_secs(
                self.unresolved_cleanup_interval_seconds,
            ),
            missed_heartbeats_limit: self.missed_heartbeats_limit,
            dead_detection_multiplier: self.dead_detection_multiplier,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }
}

/// SQL标识符：字母或下划线开头，只包含字母、数字、下划线
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());

        let settings = config.to_settings();
        assert_eq!(settings.threads, 10);
        assert_eq!(settings.polling_limit, 30);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(300));
        assert_eq!(settings.delete_unresolved_after, Duration::from_secs(14 * 24 * 3600));
        assert!(!settings.scheduler_name.is_empty());
    }

    #[test]
    fn test_explicit_values_win() {
        let config = SchedulerConfig {
            threads: 2,
            polling_limit: Some(5),
            scheduler_name: Some("node-a".to_string()),
            ..Default::default()
        };
        let settings = config.to_settings();
        assert_eq!(settings.polling_limit, 5);
        assert_eq!(settings.scheduler_name, "node-a");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = SchedulerConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.threads = 4;
        config.missed_heartbeats_limit = 1;
        assert!(config.validate().is_err());

        config.missed_heartbeats_limit = 4;
        config.table_name = "tasks; DROP TABLE x".to_string();
        assert!(config.validate().is_err());

        config.table_name = "my_tasks".to_string();
        config.scheduler_name = Some("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("scheduled_tasks"));
        assert!(is_valid_identifier("_t1"));
        assert!(!is_valid_identifier("1table"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("a-b"));
    }
}
