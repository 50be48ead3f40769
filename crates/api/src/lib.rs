//! # Fleet API
//!
//! 控制平面的对外接口: Agent控制通道 (WebSocket) 与REST管理接口。
//!
//! ## 模块
//!
//! - [`channel`] - 控制通道: 帧抽象、会话状态机、滑动窗口限速、连接表
//! - [`handlers`] - REST处理器
//! - [`routes`] - 路由与共享状态 [`AppState`]
//! - [`error`] / [`response`] - 统一的错误与响应格式
//!
//! ## 端点
//!
//! - `GET /ws` - Agent控制通道
//! - `POST /api/agents/register`, `GET /api/agents`, `GET|DELETE /api/agents/{id}`
//! - `GET /api/agents/{id}/commands`, `GET /api/agents/{id}/logs`
//! - `POST /api/tasks`, `GET /api/tasks/{id}`, `POST /api/tasks/{id}/cancel`
//! - `GET /api/commands/{id}`
//! - `GET|POST /api/schedules`, `GET|DELETE /api/schedules/{id}`,
//!   `POST /api/schedules/{id}/pause`, `POST /api/schedules/{id}/resume`
//! - `POST /api/events/{name}`
//! - `GET /health`, `GET /metrics`
//!
//! 控制通道依赖连接地址, 服务需以 `into_make_service_with_connect_info::<SocketAddr>()` 启动。

pub mod channel;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use tower::ServiceBuilder;

use fleet_core::config::ServerConfig;

use error::ApiError;
use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState, server: &ServerConfig) -> Router {
    let router = create_routes(state).fallback(|| async { ApiError::NotFound });

    let router = router.layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );

    if server.cors_enabled {
        router.layer(cors_layer(&server.cors_origins))
    } else {
        router
    }
}
