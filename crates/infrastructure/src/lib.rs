pub mod database;
pub mod in_memory_store;
pub mod observability;

pub use database::{
    DatabaseManager, DatabasePool, DatabaseType, PostgresExecutionStore, SqliteExecutionStore,
};
pub use in_memory_store::InMemoryExecutionStore;
pub use observability::MetricsCollector;
