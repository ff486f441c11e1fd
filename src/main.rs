use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use table_scheduler::common::{
    init_logging, load_config, wait_for_shutdown_signal, StartupConfig,
};
use table_scheduler::{
    DatabaseManager, FixedDelay, HandlerResult, Scheduler, Task, TaskError, Tasks,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "table-scheduler", version, about = "基于共享数据表的集群任务调度器")]
struct Cli {
    /// 配置文件路径
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<String>,

    /// 日志级别
    #[arg(
        short = 'l',
        long = "log-level",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    log_level: Option<String>,

    /// 日志格式
    #[arg(long = "log-format", value_parser = ["json", "pretty"])]
    log_format: Option<String>,

    /// 写入 picked_by 的实例标识，默认使用主机名
    #[arg(long = "scheduler-name")]
    scheduler_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReportRequest {
    recipient: String,
    report: String,
}

fn demo_tasks() -> Vec<Task> {
    let heartbeat_log = Tasks::recurring("heartbeat-log", Arc::new(FixedDelay::of_seconds(60)))
        .execute_fn(|_instance, context| async move {
            info!(
                scheduler_name = %context.scheduler_name,
                scheduled_time = %context.scheduled_time(),
                "周期任务运行"
            );
            HandlerResult::Ok(None)
        });

    let send_report = Tasks::one_time("send-report").execute_fn(|instance, _context| async move {
        let request: ReportRequest = instance.data_as().map_err(TaskError::from)?;
        info!(
            instance_id = %instance.id,
            recipient = %request.recipient,
            report = %request.report,
            "发送报表"
        );
        HandlerResult::Ok(None)
    });

    vec![heartbeat_log, send_report]
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let startup = StartupConfig {
        config_path: cli.config,
        log_level: cli.log_level,
        log_format: cli.log_format,
        scheduler_name: cli.scheduler_name,
    };

    let config = load_config(&startup)?;
    init_logging(&config.logging.level, &config.logging.format)?;
    info!("启动集群任务调度器");

    if !config.scheduler.enabled {
        warn!("调度器在配置中被禁用，直接退出");
        return Ok(());
    }

    let database = DatabaseManager::connect(&config.database, &config.scheduler.table_name)
        .await
        .context("连接数据库失败")?;
    if config.database.create_schema {
        database.create_schema().await.context("创建执行表失败")?;
    }

    let scheduler = Scheduler::builder(database.execution_store(), demo_tasks())
        .from_config(&config.scheduler)
        .build()
        .context("创建调度器失败")?;

    let report = scheduler.task("send-report")?.instance_with_data(
        format!("daily-{}", Utc::now().format("%Y%m%d")),
        &ReportRequest {
            recipient: "ops@example.com".to_string(),
            report: "daily-summary".to_string(),
        },
    )?;
    if scheduler.schedule_if_not_exists(report, Utc::now()).await? {
        info!("已调度今日报表");
    }

    scheduler.start().await.context("启动调度器失败")?;
    wait_for_shutdown_signal().await;

    let timeout = scheduler.settings().shutdown_timeout;
    if let Err(e) = scheduler.stop(timeout).await {
        warn!(error = %e, "调度器未能在超时内完全关闭");
    }
    database.close().await;
    info!("调度器已退出");
    Ok(())
}
