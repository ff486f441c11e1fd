pub mod models;
pub mod settings;

pub use models::scheduler::is_valid_identifier;
pub use models::{AppConfig, DatabaseConfig, LoggingConfig, SchedulerConfig};
pub use settings::{default_scheduler_name, SchedulerSettings};
