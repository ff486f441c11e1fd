pub mod clock;
pub mod cron_utils;
pub mod entities;
pub mod handlers;
pub mod registry;
pub mod repositories;
pub mod schedule;
pub mod task;
pub mod value_objects;

pub use clock::*;
pub use cron_utils::CronSchedule;
pub use entities::*;
pub use handlers::*;
pub use registry::TaskRegistry;
pub use repositories::ExecutionStore;
pub use schedule::*;
pub use scheduler_errors::{SchedulerError, SchedulerResult};
pub use task::*;
pub use value_objects::*;
