use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FleetError;

/// 调度规则
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: String,
    pub owner_id: String,
    pub agent_id: String,
    pub name: String,
    pub command_type: String,
    /// 命令参数模板
    pub parameters: Value,
    pub kind: ScheduleKind,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: ScheduleStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 调度类型及其配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleKind {
    Once { run_at: DateTime<Utc> },
    Interval { every_minutes: u32, anchor: DateTime<Utc> },
    Cron { expression: String },
    Event { event_name: String },
}

impl ScheduleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScheduleKind::Once { .. } => "once",
            ScheduleKind::Interval { .. } => "interval",
            ScheduleKind::Cron { .. } => "cron",
            ScheduleKind::Event { .. } => "event",
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            ScheduleKind::Event { event_name } => Some(event_name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ScheduleStatus::Active),
            "paused" => Ok(ScheduleStatus::Paused),
            "completed" => Ok(ScheduleStatus::Completed),
            "failed" => Ok(ScheduleStatus::Failed),
            _ => Err(FleetError::Serialization(format!("无效的调度状态: {s}"))),
        }
    }
}

/// 创建调度请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub owner_id: String,
    pub agent_id: String,
    pub name: String,
    pub command_type: String,
    #[serde(default)]
    pub parameters: Value,
    pub kind: ScheduleKind,
    pub max_retries: Option<u32>,
}

impl Schedule {
    pub fn new(request: NewSchedule, default_max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: request.owner_id,
            agent_id: request.agent_id,
            name: request.name,
            command_type: request.command_type,
            parameters: request.parameters,
            kind: request.kind,
            next_run_at: None,
            last_run_at: None,
            run_count: 0,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            status: ScheduleStatus::Active,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_serialization_is_tagged() {
        let kind = ScheduleKind::Interval {
            every_minutes: 15,
            anchor: "2026-01-01T00:00:00Z".parse().unwrap(),
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "interval");
        assert_eq!(value["every_minutes"], 15);

        let parsed: ScheduleKind =
            serde_json::from_value(json!({"type": "cron", "expression": "0 * * * *"})).unwrap();
        assert_eq!(
            parsed,
            ScheduleKind::Cron {
                expression: "0 * * * *".to_string()
            }
        );
    }

    #[test]
    fn test_event_name_only_for_event_kind() {
        let kind = ScheduleKind::Event {
            event_name: "invoice.created".to_string(),
        };
        assert_eq!(kind.event_name(), Some("invoice.created"));
        assert_eq!(kind.type_name(), "event");
    }
}
