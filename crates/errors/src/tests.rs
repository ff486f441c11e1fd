#[cfg(test)]
mod error_tests {
    use crate::*;

    #[test]
    fn test_scheduler_error_display() {
        let db_op_error = SchedulerError::DatabaseOperation("Connection failed".to_string());
        assert_eq!(db_op_error.to_string(), "数据库操作错误: Connection failed");

        let exists = SchedulerError::already_exists("report/daily");
        assert_eq!(exists.to_string(), "执行实例已存在: report/daily");

        let missing = SchedulerError::execution_not_found("report/daily");
        assert_eq!(missing.to_string(), "执行实例未找到: report/daily");

        let picked = SchedulerError::execution_picked("report/daily");
        assert_eq!(picked.to_string(), "执行实例正在运行中: report/daily");

        let cron = SchedulerError::InvalidCron {
            expr: "bad".to_string(),
            message: "parse".to_string(),
        };
        assert_eq!(cron.to_string(), "无效的CRON表达式: bad - parse");

        let timeout = SchedulerError::ShutdownTimeout { in_flight: 2 };
        assert_eq!(timeout.to_string(), "关闭超时: 2 个执行仍在运行");
    }

    #[test]
    fn test_error_classification() {
        assert!(SchedulerError::database_error("down").is_retryable());
        assert!(!SchedulerError::already_exists("a/b").is_retryable());

        assert!(SchedulerError::already_exists("a/b").is_conflict());
        assert!(SchedulerError::execution_picked("a/b").is_conflict());
        assert!(SchedulerError::concurrent_modification("a/b").is_conflict());
        assert!(!SchedulerError::execution_not_found("a/b").is_conflict());
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<u32>("\"text\"").unwrap_err();
        let converted: SchedulerError = err.into();
        assert!(matches!(converted, SchedulerError::Serialization(_)));
    }

    #[test]
    fn test_from_anyhow_error() {
        let converted: SchedulerError = anyhow::anyhow!("boom").into();
        assert_eq!(converted.to_string(), "内部错误: boom");
    }
}
