pub mod manager;
pub mod mapping;
pub mod postgres;
pub mod schema;
pub mod sqlite;

pub use manager::{DatabaseManager, DatabasePool, DatabaseType};
pub use postgres::PostgresExecutionStore;
pub use schema::TableName;
pub use sqlite::SqliteExecutionStore;
