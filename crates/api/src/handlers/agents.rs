use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::info;

use fleet_core::limits::close_code;
use fleet_core::models::AgentRegistration;

use crate::{
    channel::CloseReason,
    error::ApiResult,
    response::{created, success, ApiResponse},
    routes::AppState,
};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

/// Agent查询参数
#[derive(Debug, Deserialize)]
pub struct AgentQueryParams {
    pub owner_id: Option<String>,
}

/// 删除需要所有者确认
#[derive(Debug, Deserialize)]
pub struct OwnerParams {
    pub owner_id: String,
}

/// 历史记录查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

impl HistoryParams {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

/// 注册Agent; 同一所有者重复注册返回已有令牌
pub async fn register_agent(
    State(state): State<AppState>,
    payload: Result<Json<AgentRegistration>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(registration) = payload?;
    let outcome = state.directory.register(registration).await?;

    if outcome.existing {
        Ok(ApiResponse::success_with_message(outcome, "设备已注册, 返回已有令牌")
            .into_response())
    } else {
        Ok(created(outcome).into_response())
    }
}

/// 获取Agent列表
pub async fn list_agents(
    State(state): State<AppState>,
    params: Result<Query<AgentQueryParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = params?;
    let agents = state.directory.list(params.owner_id.as_deref()).await?;
    Ok(success(agents))
}

/// 获取单个Agent
pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agent = state.directory.get(&id).await?;
    Ok(success(agent))
}

/// 删除Agent: 吊销令牌并断开当前连接
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Result<Query<OwnerParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = params?;
    let agent = state.directory.delete(&id, &params.owner_id).await?;

    let disconnected = state
        .registry()
        .disconnect(&id, CloseReason::new(close_code::AUTH_FAILED, "agent revoked"))
        .await;
    info!(agent_id = %id, disconnected, "Agent已删除");

    Ok(success(agent))
}

/// 获取Agent的命令历史, 最新的在前
pub async fn list_agent_commands(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<impl IntoResponse> {
    state.directory.get(&id).await?;
    let commands = state.commands.list_by_agent(&id, params.limit()).await?;
    Ok(success(commands))
}

/// 获取Agent上报的日志
pub async fn list_agent_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<impl IntoResponse> {
    state.directory.get(&id).await?;
    let logs = state.logs.list_by_agent(&id, params.limit()).await?;
    Ok(success(logs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_limit_is_clamped() {
        assert_eq!(HistoryParams { limit: None }.limit(), DEFAULT_LIST_LIMIT);
        assert_eq!(HistoryParams { limit: Some(0) }.limit(), 1);
        assert_eq!(HistoryParams { limit: Some(10_000) }.limit(), MAX_LIST_LIMIT);
    }
}
