use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use fleet_api::channel::{ChannelContext, ConnectionRegistry};
use fleet_api::{create_app, AppState};
use fleet_core::config::{AppConfig, StorageBackend};
use fleet_core::shutdown::wait_for_shutdown;
use fleet_core::traits::{
    AgentLogRepository, AgentRepository, CommandRepository, ScheduleRepository,
};
use fleet_dispatcher::{AgentDirectory, CommandLifecycle, Scheduler, TaskOrchestrator};
use fleet_infrastructure::{
    DatabaseManager, InMemoryAgentLogRepository, InMemoryAgentRepository,
    InMemoryCommandRepository, InMemoryScheduleRepository, MetricsCollector,
    SqliteAgentLogRepository, SqliteAgentRepository, SqliteCommandRepository,
    SqliteScheduleRepository,
};

/// 存储后端提供的仓储集合
struct Repositories {
    agents: Arc<dyn AgentRepository>,
    commands: Arc<dyn CommandRepository>,
    schedules: Arc<dyn ScheduleRepository>,
    logs: Arc<dyn AgentLogRepository>,
    database: Option<DatabaseManager>,
}

impl Repositories {
    async fn open(config: &AppConfig) -> Result<Self> {
        match config.database.backend {
            StorageBackend::Sqlite => {
                info!("初始化SQLite存储: {}", config.database.url);
                let database = DatabaseManager::new(&config.database)
                    .await
                    .context("初始化数据库失败")?;
                let pool = database.pool().clone();
                Ok(Self {
                    agents: Arc::new(SqliteAgentRepository::new(pool.clone())),
                    commands: Arc::new(SqliteCommandRepository::new(pool.clone())),
                    schedules: Arc::new(SqliteScheduleRepository::new(pool.clone())),
                    logs: Arc::new(SqliteAgentLogRepository::new(pool)),
                    database: Some(database),
                })
            }
            StorageBackend::Memory => {
                warn!("使用内存存储, 重启后数据将丢失");
                Ok(Self {
                    agents: Arc::new(InMemoryAgentRepository::new()),
                    commands: Arc::new(InMemoryCommandRepository::new()),
                    schedules: Arc::new(InMemoryScheduleRepository::new()),
                    logs: Arc::new(InMemoryAgentLogRepository::new()),
                    database: None,
                })
            }
        }
    }
}

/// 安装全局Prometheus记录器, 返回渲染用的句柄
pub fn install_metrics_exporter() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("安装Prometheus记录器失败: {}", e))?;
    info!("Prometheus指标导出已启用, 路径 /metrics");
    Ok(handle)
}

/// 控制平面应用
pub struct Application {
    config: AppConfig,
    directory: Arc<AgentDirectory>,
    commands: Arc<CommandLifecycle>,
    registry: Arc<ConnectionRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
    scheduler: Arc<Scheduler>,
    logs: Arc<dyn AgentLogRepository>,
    metrics: Arc<MetricsCollector>,
    prometheus: Option<PrometheusHandle>,
    database: Option<DatabaseManager>,
}

impl Application {
    /// 打开存储、组装组件并恢复上次运行遗留的状态
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化控制平面, 存储后端: {:?}", config.database.backend);

        let repositories = Repositories::open(&config).await?;
        let metrics = Arc::new(MetricsCollector::new());

        let directory = Arc::new(AgentDirectory::new(
            repositories.agents,
            config.orchestrator.default_max_load,
        ));
        let commands = Arc::new(CommandLifecycle::new(
            repositories.commands,
            metrics.clone(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(
            config.channel.outbound_buffer,
            metrics.clone(),
        ));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            config.orchestrator.clone(),
            directory.clone(),
            commands.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            repositories.schedules,
            directory.clone(),
            orchestrator.clone(),
            &config.orchestrator,
            &config.scheduler,
            metrics.clone(),
        ));

        orchestrator.recover().await.context("恢复在途命令失败")?;
        scheduler.rehydrate().await.context("恢复调度失败")?;

        Ok(Self {
            config,
            directory,
            commands,
            registry,
            orchestrator,
            scheduler,
            logs: repositories.logs,
            metrics,
            prometheus: None,
            database: repositories.database,
        })
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn state(&self, shutdown: watch::Receiver<bool>) -> AppState {
        let channel = Arc::new(ChannelContext {
            config: self.config.channel.clone(),
            directory: self.directory.clone(),
            registry: self.registry.clone(),
            outcomes: self.orchestrator.clone(),
            logs: self.logs.clone(),
            metrics: self.metrics.clone(),
        });

        AppState {
            directory: self.directory.clone(),
            commands: self.commands.clone(),
            orchestrator: self.orchestrator.clone(),
            scheduler: self.scheduler.clone(),
            logs: self.logs.clone(),
            channel,
            prometheus: self.prometheus.clone(),
            shutdown,
        }
    }

    /// 启动后台循环并在监听器上提供服务, 直到收到关闭信号
    pub async fn run(self, listener: TcpListener, shutdown: watch::Receiver<bool>) -> Result<()> {
        let address = listener.local_addr().context("获取监听地址失败")?;

        let orchestrator_task = tokio::spawn(self.orchestrator.clone().run(shutdown.clone()));
        let scheduler_task = tokio::spawn(self.scheduler.clone().run(shutdown.clone()));

        let app = create_app(self.state(shutdown.clone()), &self.config.server);
        info!("控制平面已启动, 监听地址: {}", address);

        let mut server_shutdown = shutdown.clone();
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut server_shutdown).await })
        .await
        .context("HTTP服务异常退出");

        let grace = Duration::from_secs(self.config.server.shutdown_timeout_seconds);
        for (name, task) in [("任务编排器", orchestrator_task), ("调度器", scheduler_task)] {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{}异常退出: {}", name, e),
                Err(_) => warn!("{}未在 {:?} 内停止", name, grace),
            }
        }

        if let Some(database) = &self.database {
            database.close().await;
        }

        served?;
        info!("控制平面已停止");
        Ok(())
    }
}
