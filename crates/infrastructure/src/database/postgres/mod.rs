pub mod postgres_execution_store;

pub use postgres_execution_store::PostgresExecutionStore;
