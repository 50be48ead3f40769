use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use tracing::info;

use fleet_core::models::TaskRequest;

use crate::{
    error::ApiResult,
    response::{created, success},
    routes::AppState,
};

/// 提交任务
pub async fn submit_task(
    State(state): State<AppState>,
    payload: Result<Json<TaskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let task = state.orchestrator.submit(request).await?;
    info!(task_id = %task.id, command_type = %task.command_type, "任务已提交");
    Ok(created(task))
}

/// 获取单个任务
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state.orchestrator.get_task(&id).await?;
    Ok(success(task))
}

/// 取消等待中的任务
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state.orchestrator.cancel(&id).await?;
    Ok(success(task))
}
