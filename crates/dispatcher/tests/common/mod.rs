#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use fleet_core::config::{OrchestratorConfig, SchedulerConfig};
use fleet_core::models::{AgentRegistration, DeviceMetadata, TaskRequest, TaskTarget};
use fleet_core::traits::CommandSender;
use fleet_core::{ChannelMessage, FleetError, FleetResult};
use fleet_dispatcher::{AgentDirectory, CommandLifecycle, Scheduler, TaskOrchestrator};
use fleet_infrastructure::{
    InMemoryAgentRepository, InMemoryCommandRepository, InMemoryScheduleRepository,
    MetricsCollector,
};

/// 记录发送内容的假连接表
#[derive(Default)]
pub struct FakeSender {
    connected: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, ChannelMessage)>>,
}

impl FakeSender {
    pub fn connect(&self, agent_id: &str) {
        self.connected.lock().unwrap().insert(agent_id.to_string());
    }

    pub fn disconnect(&self, agent_id: &str) {
        self.connected.lock().unwrap().remove(agent_id);
    }

    /// 取出已发送的command消息: (agent_id, command_id, command_type)
    pub fn take_commands(&self) -> Vec<(String, String, String)> {
        self.sent
            .lock()
            .unwrap()
            .drain(..)
            .filter_map(|(agent_id, message)| match message {
                ChannelMessage::Command {
                    command_id,
                    command_type,
                    ..
                } => Some((agent_id, command_id, command_type)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl CommandSender for FakeSender {
    async fn is_connected(&self, agent_id: &str) -> bool {
        self.connected.lock().unwrap().contains(agent_id)
    }

    async fn send(&self, agent_id: &str, message: ChannelMessage) -> FleetResult<()> {
        if !self.connected.lock().unwrap().contains(agent_id) {
            return Err(FleetError::AgentNotConnected {
                id: agent_id.to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((agent_id.to_string(), message));
        Ok(())
    }
}

pub struct Harness {
    pub config: OrchestratorConfig,
    pub agents: Arc<InMemoryAgentRepository>,
    pub command_repo: Arc<InMemoryCommandRepository>,
    pub schedule_repo: Arc<InMemoryScheduleRepository>,
    pub directory: Arc<AgentDirectory>,
    pub commands: Arc<CommandLifecycle>,
    pub sender: Arc<FakeSender>,
    pub orchestrator: Arc<TaskOrchestrator>,
    pub scheduler: Arc<Scheduler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let agents = Arc::new(InMemoryAgentRepository::new());
        let command_repo = Arc::new(InMemoryCommandRepository::new());
        let schedule_repo = Arc::new(InMemoryScheduleRepository::new());
        let directory = Arc::new(AgentDirectory::new(agents.clone(), config.default_max_load));
        let commands = Arc::new(CommandLifecycle::new(command_repo.clone(), metrics.clone()));
        let sender = Arc::new(FakeSender::default());
        let orchestrator = Arc::new(TaskOrchestrator::new(
            config.clone(),
            directory.clone(),
            commands.clone(),
            sender.clone(),
            metrics.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            schedule_repo.clone(),
            directory.clone(),
            orchestrator.clone(),
            &config,
            &SchedulerConfig::default(),
            metrics,
        ));

        Self {
            config,
            agents,
            command_repo,
            schedule_repo,
            directory,
            commands,
            sender,
            orchestrator,
            scheduler,
        }
    }

    /// 新的调度器实例, 共享同一份持久化状态, 模拟进程重启
    pub fn restarted_scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.schedule_repo.clone(),
            self.directory.clone(),
            self.orchestrator.clone(),
            &self.config,
            &SchedulerConfig::default(),
            Arc::new(MetricsCollector::new()),
        )
    }

    pub async fn register(&self, device_id: &str, max_load: i32, capabilities: &[&str]) -> String {
        self.directory
            .register(AgentRegistration {
                device_id: device_id.to_string(),
                owner_id: "owner-1".to_string(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                metadata: DeviceMetadata::default(),
                max_concurrent_commands: Some(max_load),
            })
            .await
            .unwrap()
            .agent_id
    }

    /// 注册并模拟一次成功认证
    pub async fn online_agent(&self, device_id: &str, max_load: i32, capabilities: &[&str]) -> String {
        let agent_id = self.register(device_id, max_load, capabilities).await;
        self.connect(&agent_id).await;
        agent_id
    }

    pub async fn connect(&self, agent_id: &str) {
        self.directory.mark_online(agent_id).await.unwrap();
        self.sender.connect(agent_id);
    }
}

pub fn any_task(command_type: &str, priority: i32) -> TaskRequest {
    TaskRequest {
        issuer_id: "user-1".to_string(),
        command_type: command_type.to_string(),
        parameters: json!({}),
        target: TaskTarget::Any,
        capability: None,
        priority: Some(priority),
        max_retries: Some(0),
        schedule_id: None,
    }
}
