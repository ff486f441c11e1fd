//! 执行侧组件：工作池、执行记账、处理器调用与心跳续约

pub mod components;
pub mod currently_executing;

pub use components::{ExecutionRunner, HeartbeatManager, HeartbeatReport, WorkerPool};
pub use currently_executing::{CurrentlyExecuting, CurrentlyExecutingMap, ExecutingSnapshot};
