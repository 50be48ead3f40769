use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务派发目标
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskTarget {
    /// 固定到某个Agent
    Agent { agent_id: String },
    /// 任意满足条件的Agent
    Any,
}

/// 编排器内部的任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub issuer_id: String,
    pub command_type: String,
    pub parameters: Value,
    pub target: TaskTarget,
    /// 需要的能力, None表示任意Agent均可
    pub capability: Option<String>,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TaskStatus,
    pub command_id: Option<String>,
    pub assigned_agent: Option<String>,
    pub last_error: Option<String>,
    pub schedule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 提交任务请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub issuer_id: String,
    pub command_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default = "default_target")]
    pub target: TaskTarget,
    pub capability: Option<String>,
    pub priority: Option<i32>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub schedule_id: Option<String>,
}

fn default_target() -> TaskTarget {
    TaskTarget::Any
}

impl TaskRequest {
    pub fn pinned(
        agent_id: impl Into<String>,
        issuer_id: impl Into<String>,
        command_type: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            issuer_id: issuer_id.into(),
            command_type: command_type.into(),
            parameters,
            target: TaskTarget::Agent {
                agent_id: agent_id.into(),
            },
            capability: None,
            priority: None,
            max_retries: None,
            schedule_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

impl Task {
    /// 由已校验的请求创建pending任务
    pub fn new(request: TaskRequest, priority: i32, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            issuer_id: request.issuer_id,
            command_type: request.command_type,
            parameters: request.parameters,
            target: request.target,
            capability: request.capability,
            priority,
            retry_count: 0,
            max_retries,
            status: TaskStatus::Pending,
            command_id: None,
            assigned_agent: None,
            last_error: None,
            schedule_id: request.schedule_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn pinned_agent(&self) -> Option<&str> {
        match &self.target {
            TaskTarget::Agent { agent_id } => Some(agent_id.as_str()),
            TaskTarget::Any => None,
        }
    }
}
