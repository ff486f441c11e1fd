//! # Scheduler Testing Utils
//!
//! 各crate共用的测试工具，只作为 dev-dependency 使用。
//!
//! - **Builders**: 构造执行记录的 `ExecutionBuilder`
//! - **Handlers**: 记录调用、按需失败、阻塞等待的处理器
//! - **Stores**: 模拟认领竞争和存储不可用的存储包装
//! - **Helpers**: 轮询等待与测试日志初始化
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
