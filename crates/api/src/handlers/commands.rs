use axum::{
    extract::{Path, State},
    response::IntoResponse,
};

use crate::{error::ApiResult, response::success, routes::AppState};

/// 获取单个命令
pub async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let command = state.commands.get(&id).await?;
    Ok(success(command))
}
