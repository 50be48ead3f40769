use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use fleet_core::models::NewSchedule;

use crate::{
    error::ApiResult,
    response::{created, success, ApiResponse},
    routes::AppState,
};

/// 调度查询参数
#[derive(Debug, Deserialize)]
pub struct ScheduleQueryParams {
    pub owner_id: Option<String>,
}

/// 创建调度
pub async fn create_schedule(
    State(state): State<AppState>,
    payload: Result<Json<NewSchedule>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let schedule = state.scheduler.create(request).await?;
    Ok(created(schedule))
}

/// 获取调度列表
pub async fn list_schedules(
    State(state): State<AppState>,
    params: Result<Query<ScheduleQueryParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = params?;
    let schedules = state.scheduler.list(params.owner_id.as_deref()).await?;
    Ok(success(schedules))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let schedule = state.scheduler.get(&id).await?;
    Ok(success(schedule))
}

pub async fn pause_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let schedule = state.scheduler.pause(&id).await?;
    Ok(success(schedule))
}

pub async fn resume_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let schedule = state.scheduler.resume(&id).await?;
    Ok(success(schedule))
}

/// 删除调度, 已排定的触发一并取消
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.scheduler.delete(&id).await?;
    Ok(ApiResponse::success_empty_with_message(format!("调度 {id} 已删除")))
}
