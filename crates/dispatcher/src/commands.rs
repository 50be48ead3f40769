use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use fleet_core::models::{Command, CommandStatus};
use fleet_core::traits::{CommandRepository, CommandSender};
use fleet_core::{ChannelMessage, FleetError, FleetResult};
use fleet_infrastructure::MetricsCollector;

/// 命令生命周期: 创建、派发和终态记录
///
/// 状态只能沿 pending → sent → executing → completed|failed 前进,
/// 终态写入由仓储的条件更新保证只有一个观察者生效。
pub struct CommandLifecycle {
    repo: Arc<dyn CommandRepository>,
    metrics: Arc<MetricsCollector>,
}

impl CommandLifecycle {
    pub fn new(repo: Arc<dyn CommandRepository>, metrics: Arc<MetricsCollector>) -> Self {
        Self { repo, metrics }
    }

    pub async fn create(
        &self,
        agent_id: &str,
        issuer_id: &str,
        command_type: &str,
        parameters: Value,
    ) -> FleetResult<Command> {
        if command_type.trim().is_empty() {
            return Err(FleetError::Validation("命令类型不能为空".to_string()));
        }
        let command = Command::new(agent_id, issuer_id, command_type, parameters);
        self.repo.insert(&command).await?;
        debug!("为Agent {} 创建命令 {} ({})", agent_id, command.id, command_type);
        Ok(command)
    }

    pub async fn get(&self, command_id: &str) -> FleetResult<Command> {
        self.repo
            .get(command_id)
            .await?
            .ok_or_else(|| FleetError::CommandNotFound {
                id: command_id.to_string(),
            })
    }

    pub async fn list_by_agent(&self, agent_id: &str, limit: i64) -> FleetResult<Vec<Command>> {
        self.repo.list_by_agent(agent_id, limit).await
    }

    pub async fn list_by_status(&self, statuses: &[CommandStatus]) -> FleetResult<Vec<Command>> {
        self.repo.list_by_status(statuses).await
    }

    /// 派发命令: 标记为sent并放入目标连接的发送队列
    ///
    /// 返回成功只表示消息已交给连接, 后续状态由Agent的回复或派发超时决定。
    pub async fn dispatch(
        &self,
        command_id: &str,
        sender: &dyn CommandSender,
    ) -> FleetResult<Command> {
        let mut command = self.get(command_id).await?;
        if command.is_terminal() {
            return Err(FleetError::AlreadyTerminal {
                id: command_id.to_string(),
            });
        }
        if command.status != CommandStatus::Pending {
            return Err(FleetError::invalid_transition(
                "command",
                command.status,
                CommandStatus::Sent,
            ));
        }
        if !sender.is_connected(&command.agent_id).await {
            return Err(FleetError::AgentNotConnected {
                id: command.agent_id.clone(),
            });
        }

        let sent_at = Utc::now();
        if !self.repo.mark_sent(command_id, sent_at).await? {
            let current = self.get(command_id).await?;
            return Err(if current.is_terminal() {
                FleetError::AlreadyTerminal {
                    id: command_id.to_string(),
                }
            } else {
                FleetError::invalid_transition("command", current.status, CommandStatus::Sent)
            });
        }

        let message = ChannelMessage::Command {
            command_id: command.id.clone(),
            command_type: command.command_type.clone(),
            parameters: command.parameters.clone(),
        };
        if let Err(e) = sender.send(&command.agent_id, message).await {
            warn!("命令 {} 投递到Agent {} 失败: {}", command_id, command.agent_id, e);
            self.fail(command_id, e.code(), &format!("delivery failed: {e}"))
                .await?;
            return Err(e);
        }

        self.metrics.record_command_dispatched();
        info!(
            command_id = %command.id,
            agent_id = %command.agent_id,
            command_type = %command.command_type,
            "命令已派发"
        );
        command.status = CommandStatus::Sent;
        command.sent_at = Some(sent_at);
        command.updated_at = sent_at;
        Ok(command)
    }

    /// Agent确认收到命令: sent → executing
    pub async fn mark_executing(&self, command_id: &str) -> FleetResult<bool> {
        self.repo.mark_executing(command_id, Utc::now()).await
    }

    /// 记录成功结果; 只有赢得终态的调用返回Some
    pub async fn complete(&self, command_id: &str, result: Value) -> FleetResult<Option<Command>> {
        if !self.repo.complete(command_id, &result, Utc::now()).await? {
            debug!("忽略命令 {} 的迟到结果", command_id);
            return Ok(None);
        }
        let command = self.get(command_id).await?;
        let seconds = command.execution_ms.unwrap_or(0) as f64 / 1000.0;
        self.metrics.record_command_completed(seconds);
        Ok(Some(command))
    }

    /// 记录失败; 只有赢得终态的调用返回Some
    pub async fn fail(
        &self,
        command_id: &str,
        code: &str,
        message: &str,
    ) -> FleetResult<Option<Command>> {
        if !self.repo.fail(command_id, code, message, Utc::now()).await? {
            debug!("命令 {} 已处于终态, 忽略失败: {}", command_id, message);
            return Ok(None);
        }
        self.metrics.record_command_failed(code);
        warn!(command_id = %command_id, code = %code, "命令失败: {}", message);
        self.get(command_id).await.map(Some)
    }
}
