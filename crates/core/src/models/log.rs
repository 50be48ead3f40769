use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent上报的诊断日志
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentLog {
    pub id: i64,
    pub agent_id: String,
    pub level: String,
    pub message: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAgentLog {
    pub agent_id: String,
    pub level: String,
    pub message: String,
    pub metadata: Option<Value>,
}
