use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FleetError;

/// 桌面Agent记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub device_id: String,
    pub owner_id: String,
    #[serde(skip_serializing, default)]
    pub token: String,
    pub capabilities: Vec<String>,
    pub metadata: DeviceMetadata,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_address: Option<String>,
    pub current_load: i32,
    pub max_load: i32,
    pub completed_count: i64,
    pub failed_count: i64,
    pub avg_response_ms: f64,
    pub revoked: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 设备元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceMetadata {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
}

/// Agent状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
        }
    }

    /// 允许的状态转换:
    /// offline→online, online→offline, online→busy, busy→online, 任意→error, error→offline
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Offline, Online)
                | (Online, Offline)
                | (Online, Busy)
                | (Busy, Online)
                | (Error, Offline)
                | (Online | Offline | Busy, Error)
        )
    }

    /// 连接存活中(在线或繁忙)
    pub fn is_connected(&self) -> bool {
        matches!(self, AgentStatus::Online | AgentStatus::Busy)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "offline" => Ok(AgentStatus::Offline),
            "busy" => Ok(AgentStatus::Busy),
            "error" => Ok(AgentStatus::Error),
            _ => Err(FleetError::Serialization(format!("无效的Agent状态: {s}"))),
        }
    }
}

/// Agent注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub device_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: DeviceMetadata,
    pub max_concurrent_commands: Option<i32>,
}

/// 注册结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub agent_id: String,
    pub token: String,
    /// 重复注册时返回已有令牌
    pub existing: bool,
}

/// 命令结束时对Agent计数器的更新
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotRelease {
    Completed { response_ms: f64 },
    Failed,
}

/// Agent状态变更事件
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Registered {
        agent_id: String,
    },
    StatusChanged {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },
    Revoked {
        agent_id: String,
    },
}

impl Agent {
    pub fn new(registration: AgentRegistration, token: String, default_max_load: i32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: registration.device_id,
            owner_id: registration.owner_id,
            token,
            capabilities: registration.capabilities,
            metadata: registration.metadata,
            status: AgentStatus::Offline,
            last_heartbeat: None,
            last_address: None,
            current_load: 0,
            max_load: registration
                .max_concurrent_commands
                .filter(|max| *max > 0)
                .unwrap_or(default_max_load),
            completed_count: 0,
            failed_count: 0,
            avg_response_ms: 0.0,
            revoked: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 未被吊销且未被软删除
    pub fn is_active(&self) -> bool {
        !self.revoked && self.deleted_at.is_none()
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_load
    }

    /// 获取负载比例 currentLoad / maxLoad
    pub fn load_ratio(&self) -> f64 {
        if self.max_load <= 0 {
            1.0
        } else {
            self.current_load as f64 / self.max_load as f64
        }
    }

    /// 是否声明了指定能力
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// 增量均值更新平均响应时间
    pub fn record_completion(&mut self, response_ms: f64) {
        self.completed_count += 1;
        self.avg_response_ms += (response_ms - self.avg_response_ms) / self.completed_count as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> AgentRegistration {
        AgentRegistration {
            device_id: "device-1".to_string(),
            owner_id: "owner-1".to_string(),
            capabilities: vec!["shell".to_string()],
            metadata: DeviceMetadata::default(),
            max_concurrent_commands: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        use AgentStatus::*;
        assert!(Offline.can_transition_to(Online));
        assert!(Online.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Online));
        assert!(Busy.can_transition_to(Error));
        assert!(Error.can_transition_to(Offline));

        assert!(!Offline.can_transition_to(Busy));
        assert!(!Busy.can_transition_to(Offline));
        assert!(!Error.can_transition_to(Online));
        assert!(!Online.can_transition_to(Online));
    }

    #[test]
    fn test_new_agent_starts_offline() {
        let agent = Agent::new(registration(), "tok".to_string(), 5);
        assert_eq!(agent.status, AgentStatus::Offline);
        assert_eq!(agent.max_load, 5);
        assert!(agent.is_active());
        assert!(agent.supports("shell"));
        assert!(!agent.supports("browser"));
    }

    #[test]
    fn test_incremental_mean() {
        let mut agent = Agent::new(registration(), "tok".to_string(), 5);
        agent.record_completion(100.0);
        agent.record_completion(200.0);
        agent.record_completion(300.0);
        assert_eq!(agent.completed_count, 3);
        assert!((agent.avg_response_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_ratio() {
        let mut agent = Agent::new(registration(), "tok".to_string(), 4);
        agent.current_load = 1;
        assert!((agent.load_ratio() - 0.25).abs() < f64::EPSILON);
        agent.current_load = 4;
        assert!(!agent.has_capacity());
    }
}
