pub mod app_config;
pub mod database;
pub mod logging;
pub mod scheduler;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use logging::LoggingConfig;
pub use scheduler::SchedulerConfig;
