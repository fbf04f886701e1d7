use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use taskengine_core::logging::init_logging;
use taskengine_core::models::ClusterNodeInfo;
use taskengine_core::traits::{ClusterRepository, RunnerRegistry, TaskRepository};
use taskengine_core::{AppConfig, RuntimeSettings};
use taskengine_engine::{
    EngineContext, HttpRunner, RetryPolicy, ShellRunner, StaleNodeUnlocker, TaskService,
};
use taskengine_infrastructure::{
    BroadcastEventPublisher, PostgresClusterRepository, PostgresTaskRepository,
    SqliteClusterRepository, SqliteTaskRepository,
};

/// 集群感知的分布式任务调度引擎节点
#[derive(Debug, Parser)]
#[command(name = "taskengine", version, about = "集群感知的分布式任务调度引擎")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖配置中的节点ID
    #[arg(long)]
    node_id: Option<i32>,

    /// 覆盖配置中的节点组，可重复
    #[arg(long = "node-group")]
    node_groups: Vec<String>,

    /// 覆盖配置中的数据库URL
    #[arg(long)]
    database_url: Option<String>,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// 以JSON格式输出日志
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!("启动任务调度引擎节点");

    let mut config = AppConfig::load(args.config.as_deref()).context("加载配置失败")?;
    if let Some(node_id) = args.node_id {
        config.node.node_id = node_id;
    }
    if !args.node_groups.is_empty() {
        config.node.node_groups = args.node_groups.clone();
    }
    if let Some(url) = &args.database_url {
        config.database.url = url.clone();
    }
    config.validate().context("配置校验失败")?;

    info!(
        "节点 {} (组: {:?}), 存储: {}",
        config.node.node_id, config.node.node_groups, config.database.url
    );

    let settings = RuntimeSettings::seeded_from(&config);
    let (task_repo, cluster_repo) = connect_store(&config).await?;

    // 注册节点并启动心跳
    let node = ClusterNodeInfo::new(
        config.node.node_id,
        config.node.hostname.clone(),
        config.node.node_groups.clone(),
    );
    cluster_repo.register(&node).await.context("注册节点失败")?;
    let heartbeat_handle = spawn_heartbeat(
        Arc::clone(&cluster_repo),
        config.node.node_id,
        Duration::from_secs(config.node.heartbeat_interval_seconds),
    );

    // 组装服务
    let mut registry = RunnerRegistry::new();
    registry.register(Arc::new(ShellRunner::new()));
    registry.register(Arc::new(HttpRunner::new()));

    let events = Arc::new(BroadcastEventPublisher::default());
    let context = EngineContext {
        node_id: config.node.node_id,
        node_groups: config.node.node_groups.clone(),
    };

    let service = TaskService::builder(Arc::clone(&task_repo), Arc::new(registry), context)
        .settings(settings.clone())
        .events(events.clone())
        .retry_policy(RetryPolicy::new(config.retry.clone()))
        .max_concurrent_tasks(config.engine.max_concurrent_tasks)
        .build();

    let unlocker = StaleNodeUnlocker::new(
        Arc::clone(&task_repo),
        Arc::clone(&cluster_repo),
        events,
        settings.clone(),
    );

    service.engine().start().await.context("启动引擎失败")?;
    unlocker.start().await.context("启动解锁器失败")?;

    info!("节点 {} 就绪，等待停止信号", config.node.node_id);
    signal::ctrl_c().await.context("监听停止信号失败")?;
    info!("收到停止信号，开始优雅关闭");

    if let Err(e) = unlocker.stop().await {
        error!("停止解锁器失败: {}", e);
    }
    if let Err(e) = service.engine().stop().await {
        error!("停止引擎失败: {}", e);
    }
    heartbeat_handle.abort();

    info!("节点 {} 已退出", config.node.node_id);
    Ok(())
}

/// 按URL方案连接任务存储，初始化表结构
async fn connect_store(
    config: &AppConfig,
) -> Result<(Arc<dyn TaskRepository>, Arc<dyn ClusterRepository>)> {
    let url = &config.database.url;

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(url)
            .await
            .with_context(|| format!("连接PostgreSQL失败: {url}"))?;

        PostgresTaskRepository::initialize_schema(&pool).await?;
        PostgresClusterRepository::initialize_schema(&pool).await?;

        Ok((
            Arc::new(PostgresTaskRepository::new(pool.clone())),
            Arc::new(PostgresClusterRepository::new(pool)),
        ))
    } else {
        let options = url
            .parse::<sqlx::sqlite::SqliteConnectOptions>()
            .with_context(|| format!("无效的SQLite URL: {url}"))?
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("连接SQLite失败: {url}"))?;

        SqliteTaskRepository::initialize_schema(&pool).await?;
        SqliteClusterRepository::initialize_schema(&pool).await?;

        Ok((
            Arc::new(SqliteTaskRepository::new(pool.clone())),
            Arc::new(SqliteClusterRepository::new(pool)),
        ))
    }
}

/// 节点心跳循环
fn spawn_heartbeat(
    cluster_repo: Arc<dyn ClusterRepository>,
    node_id: i32,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = cluster_repo.heartbeat(node_id, Utc::now()).await {
                warn!("节点 {} 心跳更新失败: {}", node_id, e);
            }
        }
    })
}
