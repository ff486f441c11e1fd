//! 后台循环：认领与分派、死亡执行检测、未解析任务清理

pub mod cleanup_service;
pub mod dead_execution_detector;
pub mod dispatch_loop;

pub use cleanup_service::{CleanupConfig, CleanupService};
pub use dead_execution_detector::{
    DeadExecutionDetector, DeadExecutionDetectorConfig, DeadExecutionReport,
};
pub use dispatch_loop::{DispatchConfig, DispatchLoop, DispatchReport};
