use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use tracing::info;

use crate::{error::ApiResult, response::success, routes::AppState};

/// 触发事件调度; 请求体可省略
pub async fn trigger_event(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let payload = match payload {
        Ok(Json(value)) => value,
        Err(JsonRejection::MissingJsonContentType(_)) => Value::Object(Default::default()),
        Err(rejection) => return Err(rejection.into()),
    };

    let reports = state.scheduler.trigger_event(&name, payload).await?;
    info!(event = %name, fired = reports.len(), "事件已触发");
    Ok(success(reports))
}
