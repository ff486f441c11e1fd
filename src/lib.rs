//! 基于共享数据表与乐观锁的集群任务调度器
//!
//! 多个进程共享同一张执行表，通过对 `version` 列的条件写入认领、续约和完成执行，
//! 不需要进程间通信或主节点选举。

pub mod common;
pub mod scheduler;
pub mod shutdown;

pub use scheduler::{Scheduler, SchedulerBuilder};
pub use shutdown::ShutdownManager;

pub use scheduler_core::{AppConfig, DatabaseConfig, LoggingConfig, SchedulerConfig, SchedulerSettings};
pub use scheduler_dispatcher::{DeadExecutionReport, DispatchReport};
pub use scheduler_domain::*;
pub use scheduler_infrastructure::{
    DatabaseManager, InMemoryExecutionStore, MetricsCollector, PostgresExecutionStore,
    SqliteExecutionStore,
};
pub use scheduler_worker::{ExecutingSnapshot, HeartbeatReport};
