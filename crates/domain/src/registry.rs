use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::task::Task;
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 启动时构建一次的任务注册表
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<Task>>,
    unresolved: Mutex<HashSet<String>>,
}

impl TaskRegistry {
    pub fn new(tasks: Vec<Task>) -> SchedulerResult<Self> {
        let mut map = HashMap::with_capacity(tasks.len());
        for task in tasks {
            let name = task.name().to_string();
            if map.contains_key(&name) {
                return Err(SchedulerError::DuplicateTask { name });
            }
            map.insert(name, Arc::new(task));
        }
        Ok(Self {
            tasks: map,
            unresolved: Mutex::new(HashSet::new()),
        })
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.get(name).cloned()
    }

    /// 记录存储中出现但未注册的任务名，每个名字只告警一次
    pub fn record_unresolved(&self, name: &str) -> bool {
        let mut unresolved = self
            .unresolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let first_time = unresolved.insert(name.to_string());
        if first_time {
            warn!(task_name = %name, "发现未注册的任务，相关执行将被跳过");
        }
        first_time
    }

    pub fn unresolved_names(&self) -> Vec<String> {
        let unresolved = self
            .unresolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = unresolved.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// 声明了启动实例的任务
    pub fn startup_tasks(&self) -> Vec<Arc<Task>> {
        let mut tasks: Vec<Arc<Task>> = self
            .tasks
            .values()
            .filter(|task| task.startup_instance().is_some())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.name().cmp(b.name()));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
