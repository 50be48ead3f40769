use thiserror::Error;

/// Agent客户端错误
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("注册失败: HTTP {status} - {body}")]
    Registration { status: u16, body: String },

    #[error("WebSocket错误: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("认证被拒绝: {code} - {message}")]
    AuthRejected { code: String, message: String },

    #[error("配置错误: {0}")]
    Configuration(String),
}

impl From<fleet_core::FleetError> for AgentError {
    fn from(err: fleet_core::FleetError) -> Self {
        AgentError::Protocol(err.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

/// 命令执行失败, 以 `error` 消息回报
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
}

impl ExecutionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new("INVALID_PARAMS", message)
    }

    pub fn unsupported(command_type: &str) -> Self {
        Self::new(
            "UNSUPPORTED_COMMAND",
            format!("不支持的命令类型: {command_type}"),
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new("EXECUTION_FAILED", message)
    }
}
