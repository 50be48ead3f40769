use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FleetError;

/// 下发给单个Agent的命令及其结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub id: String,
    pub agent_id: String,
    pub issuer_id: String,
    pub command_type: String,
    pub parameters: Value,
    pub status: CommandStatus,
    pub result: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 执行耗时(毫秒)
    pub execution_ms: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// 命令状态, 只能单调前进
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Executing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    /// 允许直接到达目标状态的前置状态集合
    pub fn allowed_predecessors(&self) -> &'static [CommandStatus] {
        use CommandStatus::*;
        match self {
            Pending => &[],
            Sent => &[Pending],
            Executing => &[Sent],
            // result可能先于ack到达
            Completed => &[Sent, Executing],
            Failed => &[Pending, Sent, Executing],
        }
    }

    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "sent" => Ok(CommandStatus::Sent),
            "executing" => Ok(CommandStatus::Executing),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            _ => Err(FleetError::Serialization(format!("无效的命令状态: {s}"))),
        }
    }
}

impl Command {
    /// 创建新命令, 初始状态总是pending
    pub fn new(
        agent_id: impl Into<String>,
        issuer_id: impl Into<String>,
        command_type: impl Into<String>,
        parameters: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            issuer_id: issuer_id.into(),
            command_type: command_type.into(),
            parameters,
            status: CommandStatus::Pending,
            result: None,
            error_code: None,
            error_message: None,
            created_at: now,
            sent_at: None,
            started_at: None,
            completed_at: None,
            execution_ms: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 从开始执行(没有ack时取发送时间)到结束的毫秒数
    pub fn measure_execution(&self, finished_at: DateTime<Utc>) -> Option<i64> {
        self.started_at
            .or(self.sent_at)
            .map(|start| (finished_at - start).num_milliseconds().max(0))
    }
}
