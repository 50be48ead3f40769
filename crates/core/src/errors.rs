use thiserror::Error;

/// 认证失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("未知的令牌")]
    UnknownToken,

    #[error("令牌已被吊销")]
    RevokedToken,

    #[error("认证窗口已超时")]
    WindowElapsed,
}

/// 控制平面错误类型定义
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("认证失败: {0}")]
    Auth(#[from] AuthError),

    #[error("消息校验失败: {0}")]
    Validation(String),

    #[error("消息速率超限: 每秒最多{limit}条")]
    RateLimitExceeded { limit: u32 },

    #[error("消息过大: {size}字节, 上限{limit}字节")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("没有可用的Agent: {reason}")]
    AgentUnavailable { reason: String },

    #[error("Agent未连接: {id}")]
    AgentNotConnected { id: String },

    #[error("命令执行超时: {command_id}")]
    CommandTimeout { command_id: String },

    #[error("Agent熔断器已打开: {agent_id}")]
    CircuitOpen { agent_id: String },

    #[error("设备身份已被其他所有者注册: {device_id}")]
    DuplicateIdentity { device_id: String },

    #[error("Agent未找到: {id}")]
    AgentNotFound { id: String },

    #[error("命令未找到: {id}")]
    CommandNotFound { id: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("调度未找到: {id}")]
    ScheduleNotFound { id: String },

    #[error("无效的状态转换: {entity} {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("命令已处于终态, 不可重新派发: {id}")]
    AlreadyTerminal { id: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的调度配置: {0}")]
    InvalidSchedule(String),

    #[error("无权操作: {0}")]
    Forbidden(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl FleetError {
    /// 稳定的机器可读错误码, 用于error消息和REST错误体
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::Database(_) | FleetError::DatabaseOperation(_) => "DATABASE_ERROR",
            FleetError::Auth(_) => "AUTH_FAILED",
            FleetError::Validation(_) => "VALIDATION_ERROR",
            FleetError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            FleetError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            FleetError::AgentUnavailable { .. } => "AGENT_UNAVAILABLE",
            FleetError::AgentNotConnected { .. } => "AGENT_NOT_CONNECTED",
            FleetError::CommandTimeout { .. } => "COMMAND_TIMEOUT",
            FleetError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            FleetError::DuplicateIdentity { .. } => "DUPLICATE_IDENTITY",
            FleetError::AgentNotFound { .. }
            | FleetError::CommandNotFound { .. }
            | FleetError::TaskNotFound { .. }
            | FleetError::ScheduleNotFound { .. } => "NOT_FOUND",
            FleetError::InvalidTransition { .. } => "INVALID_TRANSITION",
            FleetError::AlreadyTerminal { .. } => "ALREADY_TERMINAL",
            FleetError::InvalidCron { .. } => "INVALID_CRON",
            FleetError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            FleetError::Forbidden(_) => "FORBIDDEN",
            FleetError::Serialization(_) => "SERIALIZATION_ERROR",
            FleetError::Configuration(_) => "CONFIGURATION_ERROR",
            FleetError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        FleetError::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type FleetResult<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(FleetError::Auth(AuthError::RevokedToken).code(), "AUTH_FAILED");
        assert_eq!(
            FleetError::TaskNotFound { id: "t".into() }.code(),
            FleetError::AgentNotFound { id: "a".into() }.code()
        );
        assert_eq!(
            FleetError::PayloadTooLarge { size: 2, limit: 1 }.code(),
            "PAYLOAD_TOO_LARGE"
        );
    }

    #[test]
    fn test_reason_is_human_readable() {
        let err = FleetError::invalid_transition("command", "completed", "sent");
        assert!(err.to_string().contains("completed -> sent"));
    }
}
