use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entities::{encode_data, Execution, TaskInstance};
use crate::handlers::{
    CancelDeadExecution, CompletionHandler, DeadExecutionHandler, FailureHandler,
    OnCompleteRemove, OnCompleteReschedule, OnFailureReschedule, OnFailureRetryLater,
    ReviveDeadExecution,
};
use crate::schedule::Schedule;
use crate::value_objects::{CompletionDecision, SchedulerState};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 周期任务唯一实例的固定ID
pub const RECURRING_INSTANCE_ID: &str = "recurring";

/// 处理器返回值
pub type HandlerResult = Result<Option<CompletionDecision>, TaskError>;

/// 处理器报告的失败，交由失败策略处理
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 包含错误链的完整描述，写入日志与失败记录
    pub fn cause(&self) -> String {
        match &self.source {
            Some(source) => format!("{}: {}", self.message, source),
            None => self.message.clone(),
        }
    }
}

impl From<SchedulerError> for TaskError {
    fn from(err: SchedulerError) -> Self {
        Self::with_source("调度器错误", err)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source("任务数据序列化失败", err)
    }
}

/// 处理器可见的执行上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution: Execution,
    pub scheduler_name: String,
    pub state: SchedulerState,
}

impl ExecutionContext {
    pub fn scheduled_time(&self) -> DateTime<Utc> {
        self.execution.execution_time
    }

    /// 调度器正在关闭时，长时间运行的处理器应尽快返回
    pub fn is_shutting_down(&self) -> bool {
        self.state.is_shutting_down()
    }
}

/// 任务的执行逻辑
///
/// `Ok(None)` 表示交给任务的完成策略处理，`Ok(Some(_))` 由处理器自己决定下一状态。
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn execute(
        &self,
        instance: &TaskInstance,
        context: &ExecutionContext,
    ) -> HandlerResult;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ExecutionHandler for FnHandler<F>
where
    F: Fn(TaskInstance, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn execute(
        &self,
        instance: &TaskInstance,
        context: &ExecutionContext,
    ) -> HandlerResult {
        (self.f)(instance.clone(), context.clone()).await
    }
}

/// 用闭包构造处理器
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ExecutionHandler>
where
    F: Fn(TaskInstance, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    OneTime,
    Recurring,
    Custom,
}

/// 启动时确保存在的实例（存在则保留）
#[derive(Debug, Clone)]
pub struct StartupInstance {
    pub instance_id: String,
    pub data: Option<Vec<u8>>,
    pub schedule: Arc<dyn Schedule>,
}

/// 注册后不可变的任务定义
pub struct Task {
    name: String,
    kind: TaskKind,
    handler: Arc<dyn ExecutionHandler>,
    schedule: Option<Arc<dyn Schedule>>,
    completion_handler: Arc<dyn CompletionHandler>,
    failure_handler: Arc<dyn FailureHandler>,
    dead_execution_handler: Arc<dyn DeadExecutionHandler>,
    initial_data: Option<Vec<u8>>,
    startup: Option<StartupInstance>,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn handler(&self) -> &Arc<dyn ExecutionHandler> {
        &self.handler
    }

    pub fn schedule(&self) -> Option<&Arc<dyn Schedule>> {
        self.schedule.as_ref()
    }

    pub fn completion_handler(&self) -> &Arc<dyn CompletionHandler> {
        &self.completion_handler
    }

    pub fn failure_handler(&self) -> &Arc<dyn FailureHandler> {
        &self.failure_handler
    }

    pub fn dead_execution_handler(&self) -> &Arc<dyn DeadExecutionHandler> {
        &self.dead_execution_handler
    }

    pub fn initial_data(&self) -> Option<&[u8]> {
        self.initial_data.as_deref()
    }

    pub fn startup_instance(&self) -> Option<&StartupInstance> {
        self.startup.as_ref()
    }

    /// 本任务的实例，不带数据
    pub fn instance(&self, id: impl Into<String>) -> TaskInstance {
        TaskInstance::new(self.name.clone(), id)
    }

    pub fn instance_with_data<T: Serialize + ?Sized>(
        &self,
        id: impl Into<String>,
        data: &T,
    ) -> SchedulerResult<TaskInstance> {
        self.instance(id).with_data(data)
    }

    /// 启动时需要插入的执行记录
    pub fn startup_execution(&self, now: DateTime<Utc>) -> Option<Execution> {
        self.startup.as_ref().map(|startup| {
            let instance = TaskInstance::new(self.name.clone(), startup.instance_id.clone())
                .with_raw_data(startup.data.clone());
            Execution::new(instance, startup.schedule.initial_execution_time(now))
        })
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("schedule", &self.schedule)
            .field("completion_handler", &self.completion_handler)
            .field("failure_handler", &self.failure_handler)
            .field("dead_execution_handler", &self.dead_execution_handler)
            .field("startup", &self.startup)
            .finish_non_exhaustive()
    }
}

/// 任务构造入口
pub struct Tasks;

impl Tasks {
    /// 一次性任务：成功后删除，失败后5分钟重试
    pub fn one_time(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name.into(), TaskKind::OneTime)
    }

    /// 周期任务：单个 `recurring` 实例在启动时调度，完成后原地改期
    pub fn recurring(name: impl Into<String>, schedule: Arc<dyn Schedule>) -> TaskBuilder {
        let mut builder = TaskBuilder::new(name.into(), TaskKind::Recurring);
        builder.completion_handler = Arc::new(OnCompleteReschedule::new(schedule.clone()));
        builder.failure_handler = Arc::new(OnFailureReschedule::new(schedule.clone()));
        builder.startup = Some(StartupInstance {
            instance_id: RECURRING_INSTANCE_ID.to_string(),
            data: None,
            schedule: schedule.clone(),
        });
        builder.schedule = Some(schedule);
        builder
    }

    /// 自定义任务：处理器自行返回下一状态
    pub fn custom(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name.into(), TaskKind::Custom)
    }
}

pub struct TaskBuilder {
    name: String,
    kind: TaskKind,
    schedule: Option<Arc<dyn Schedule>>,
    completion_handler: Arc<dyn CompletionHandler>,
    failure_handler: Arc<dyn FailureHandler>,
    dead_execution_handler: Arc<dyn DeadExecutionHandler>,
    initial_data: Option<Vec<u8>>,
    startup: Option<StartupInstance>,
}

impl TaskBuilder {
    fn new(name: String, kind: TaskKind) -> Self {
        Self {
            name,
            kind,
            schedule: None,
            completion_handler: Arc::new(OnCompleteRemove),
            failure_handler: Arc::new(OnFailureRetryLater::default()),
            dead_execution_handler: Arc::new(ReviveDeadExecution),
            initial_data: None,
            startup: None,
        }
    }

    pub fn on_complete(mut self, handler: Arc<dyn CompletionHandler>) -> Self {
        self.completion_handler = handler;
        self
    }

    pub fn on_failure(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = handler;
        self
    }

    pub fn on_failure_retry_later(self, delay: chrono::Duration) -> Self {
        self.on_failure(Arc::new(OnFailureRetryLater::new(delay)))
    }

    pub fn on_failure_reschedule(self, schedule: Arc<dyn Schedule>) -> Self {
        self.on_failure(Arc::new(OnFailureReschedule::new(schedule)))
    }

    pub fn on_dead_execution(mut self, handler: Arc<dyn DeadExecutionHandler>) -> Self {
        self.dead_execution_handler = handler;
        self
    }

    pub fn on_dead_execution_cancel(self) -> Self {
        self.on_dead_execution(Arc::new(CancelDeadExecution))
    }

    /// 启动实例的初始数据
    pub fn initial_data<T: Serialize + ?Sized>(mut self, data: &T) -> SchedulerResult<Self> {
        let encoded = encode_data(data)?;
        if let Some(startup) = self.startup.as_mut() {
            startup.data = Some(encoded.clone());
        }
        self.initial_data = Some(encoded);
        Ok(self)
    }

    pub fn schedule_on_startup(
        mut self,
        instance_id: impl Into<String>,
        data: Option<Vec<u8>>,
        schedule: Arc<dyn Schedule>,
    ) -> Self {
        let data = data.or_else(|| self.initial_data.clone());
        self.startup = Some(StartupInstance {
            instance_id: instance_id.into(),
            data,
            schedule,
        });
        self
    }

    pub fn execute(self, handler: Arc<dyn ExecutionHandler>) -> Task {
        Task {
            name: self.name,
            kind: self.kind,
            handler,
            schedule: self.schedule,
            completion_handler: self.completion_handler,
            failure_handler: self.failure_handler,
            dead_execution_handler: self.dead_execution_handler,
            initial_data: self.initial_data,
            startup: self.startup,
        }
    }

    pub fn execute_fn<F, Fut>(self, f: F) -> Task
    where
        F: Fn(TaskInstance, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.execute(handler_fn(f))
    }
}
