use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    fn build(data: Option<T>, message: Option<String>) -> Self {
        Self {
            success: true,
            data,
            message,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn success(data: T) -> Self {
        Self::build(Some(data), None)
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self::build(Some(data), Some(message.into()))
    }
}

impl ApiResponse<()> {
    /// 没有返回数据的操作, 例如删除
    pub fn success_empty_with_message(message: impl Into<String>) -> Self {
        Self::build(None, Some(message.into()))
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

pub fn success<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, ApiResponse::success(data))
}

pub fn created<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, ApiResponse::success(data))
}
