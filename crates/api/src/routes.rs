use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::sync::watch;

use fleet_core::traits::AgentLogRepository;
use fleet_dispatcher::{AgentDirectory, CommandLifecycle, Scheduler, TaskOrchestrator};

use crate::channel::{ChannelContext, ConnectionRegistry};
use crate::handlers::{
    agents::{delete_agent, get_agent, list_agent_commands, list_agent_logs, list_agents, register_agent},
    channel::channel_upgrade,
    commands::get_command,
    events::trigger_event,
    health::health_check,
    metrics::prometheus_metrics,
    schedules::{create_schedule, delete_schedule, get_schedule, list_schedules, pause_schedule, resume_schedule},
    tasks::{cancel_task, get_task, submit_task},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<AgentDirectory>,
    pub commands: Arc<CommandLifecycle>,
    pub orchestrator: Arc<TaskOrchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub logs: Arc<dyn AgentLogRepository>,
    pub channel: Arc<ChannelContext>,
    pub prometheus: Option<PrometheusHandle>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.channel.registry
    }
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查与指标
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        // Agent控制通道
        .route("/ws", get(channel_upgrade))
        // Agent管理API
        .route("/api/agents/register", post(register_agent))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}", get(get_agent).delete(delete_agent))
        .route("/api/agents/{id}/commands", get(list_agent_commands))
        .route("/api/agents/{id}/logs", get(list_agent_logs))
        // 任务API
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/commands/{id}", get(get_command))
        // 调度API
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route("/api/schedules/{id}", get(get_schedule).delete(delete_schedule))
        .route("/api/schedules/{id}/pause", post(pause_schedule))
        .route("/api/schedules/{id}/resume", post(resume_schedule))
        .route("/api/events/{name}", post(trigger_event))
        .with_state(state)
}
