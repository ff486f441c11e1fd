pub mod sqlite_execution_store;

pub use sqlite_execution_store::SqliteExecutionStore;
