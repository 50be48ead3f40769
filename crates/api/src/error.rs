use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_core::FleetError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Fleet(#[from] FleetError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源")]
    NotFound,
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Fleet(err) => match err {
                FleetError::Auth(_) => StatusCode::UNAUTHORIZED,
                FleetError::Validation(_)
                | FleetError::InvalidCron { .. }
                | FleetError::InvalidSchedule(_)
                | FleetError::Serialization(_) => StatusCode::BAD_REQUEST,
                FleetError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                FleetError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                FleetError::AgentUnavailable { .. }
                | FleetError::AgentNotConnected { .. }
                | FleetError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
                FleetError::CommandTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                FleetError::DuplicateIdentity { .. }
                | FleetError::InvalidTransition { .. }
                | FleetError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
                FleetError::AgentNotFound { .. }
                | FleetError::CommandNotFound { .. }
                | FleetError::TaskNotFound { .. }
                | FleetError::ScheduleNotFound { .. } => StatusCode::NOT_FOUND,
                FleetError::Forbidden(_) => StatusCode::FORBIDDEN,
                FleetError::Database(_)
                | FleetError::DatabaseOperation(_)
                | FleetError::Configuration(_)
                | FleetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Fleet(err) => err.code(),
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound => "NOT_FOUND",
        }
    }

    fn suggestions(&self) -> Vec<&'static str> {
        match self {
            ApiError::Fleet(FleetError::AgentNotFound { .. }) => vec![
                "请检查Agent ID是否正确",
                "使用 GET /api/agents 查看已注册的Agent",
            ],
            ApiError::Fleet(FleetError::InvalidCron { .. }) => vec![
                "请使用标准的Cron表达式格式",
                "示例: '0 */5 * * * *' (每5分钟执行一次)",
            ],
            ApiError::Fleet(FleetError::DuplicateIdentity { .. }) => {
                vec!["该设备已由其他所有者注册, 请先删除原有Agent"]
            }
            ApiError::Fleet(FleetError::InvalidTransition { .. }) => {
                vec!["请求的操作与当前状态冲突, 请刷新状态后重试"]
            }
            ApiError::Fleet(FleetError::AgentNotConnected { .. })
            | ApiError::Fleet(FleetError::AgentUnavailable { .. }) => {
                vec!["确认Agent已连接控制通道后重试"]
            }
            ApiError::BadRequest(_) => vec!["请检查请求格式和参数", "确保Content-Type正确设置"],
            _ if self.status().is_server_error() => vec![
                "系统遇到内部错误，请稍后重试",
                "查看 GET /health 检查系统状态",
            ],
            _ => Vec::new(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("请求处理失败: {}", self);
            "系统内部错误".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "code": status.as_u16(),
                "suggestions": self.suggestions(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
