use std::sync::Arc;
use std::time::Duration;

use scheduler_core::DatabaseConfig;
use scheduler_domain::ExecutionStore;
use scheduler_errors::{SchedulerError, SchedulerResult};
use tracing::info;

use super::postgres::PostgresExecutionStore;
use super::schema::TableName;
use super::sqlite::SqliteExecutionStore;

/// Database type detection
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseType::PostgreSQL
        } else {
            DatabaseType::SQLite
        }
    }
}

/// Database connection pool enum
#[derive(Debug, Clone)]
pub enum DatabasePool {
    PostgreSQL(sqlx::PgPool),
    SQLite(sqlx::SqlitePool),
}

impl DatabasePool {
    /// Create pool from config with automatic type detection
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let acquire_timeout = Duration::from_secs(config.connection_timeout_seconds);
        let idle_timeout = Duration::from_secs(config.idle_timeout_seconds);

        match DatabaseType::from_url(&config.url) {
            DatabaseType::PostgreSQL => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .connect(&config.url)
                    .await
                    .map_err(SchedulerError::Database)?;
                Ok(DatabasePool::PostgreSQL(pool))
            }
            DatabaseType::SQLite => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .connect(&config.url)
                    .await
                    .map_err(SchedulerError::Database)?;
                Ok(DatabasePool::SQLite(pool))
            }
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            DatabasePool::PostgreSQL(_) => DatabaseType::PostgreSQL,
            DatabasePool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        match self {
            DatabasePool::PostgreSQL(pool) => {
                sqlx::query("SELECT 1")
                    .execute(pool)
                    .await
                    .map_err(SchedulerError::Database)?;
            }
            DatabasePool::SQLite(pool) => {
                sqlx::query("SELECT 1")
                    .execute(pool)
                    .await
                    .map_err(SchedulerError::Database)?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        match self {
            DatabasePool::PostgreSQL(pool) => pool.close().await,
            DatabasePool::SQLite(pool) => pool.close().await,
        }
    }
}

/// 按配置连接数据库并创建执行存储
pub struct DatabaseManager {
    pool: DatabasePool,
    table: TableName,
}

impl DatabaseManager {
    pub async fn connect(config: &DatabaseConfig, table_name: &str) -> SchedulerResult<Self> {
        let table = TableName::new(table_name)?;
        let pool = DatabasePool::connect(config).await?;
        info!(
            "已连接数据库: {:?}, 执行表: {}",
            pool.database_type(),
            table
        );
        Ok(Self { pool, table })
    }

    pub fn from_pool(pool: DatabasePool, table: TableName) -> Self {
        Self { pool, table }
    }

    pub fn database_type(&self) -> DatabaseType {
        self.pool.database_type()
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        self.pool.health_check().await
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    pub async fn create_schema(&self) -> SchedulerResult<()> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => {
                PostgresExecutionStore::with_table(pool.clone(), self.table.clone())
                    .create_schema()
                    .await
            }
            DatabasePool::SQLite(pool) => {
                SqliteExecutionStore::with_table(pool.clone(), self.table.clone())
                    .create_schema()
                    .await
            }
        }
    }

    /// Factory method for the execution store
    pub fn execution_store(&self) -> Arc<dyn ExecutionStore> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => Arc::new(PostgresExecutionStore::with_table(
                pool.clone(),
                self.table.clone(),
            )),
            DatabasePool::SQLite(pool) => Arc::new(SqliteExecutionStore::with_table(
                pool.clone(),
                self.table.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_detection() {
        assert_eq!(
            DatabaseType::from_url("postgresql://localhost/db"),
            DatabaseType::PostgreSQL
        );
        assert_eq!(
            DatabaseType::from_url("postgres://localhost/db"),
            DatabaseType::PostgreSQL
        );
        assert_eq!(DatabaseType::from_url("sqlite::memory:"), DatabaseType::SQLite);
    }

    #[tokio::test]
    async fn test_connect_sqlite_and_create_schema() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let manager = DatabaseManager::connect(&config, "jobs").await.unwrap();
        assert_eq!(manager.database_type(), DatabaseType::SQLite);
        manager.create_schema().await.unwrap();
        manager.create_schema().await.unwrap();
        manager.health_check().await.unwrap();

        let store = manager.execution_store();
        assert!(store.get_scheduled_executions().await.unwrap().is_empty());
        manager.close().await;
    }

    #[tokio::test]
    async fn test_rejects_invalid_table_name() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        };
        assert!(DatabaseManager::connect(&config, "bad-name").await.is_err());
    }
}
