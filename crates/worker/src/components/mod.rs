pub mod heartbeat_manager;
pub mod task_execution;
pub mod worker_pool;

pub use heartbeat_manager::{HeartbeatManager, HeartbeatReport};
pub use task_execution::ExecutionRunner;
pub use worker_pool::WorkerPool;
