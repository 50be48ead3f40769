use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::routes::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let stats = state.orchestrator.stats().await;
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "fleet-control",
        "version": env!("CARGO_PKG_VERSION"),
        "connected_agents": state.registry().connected_count().await,
        "tasks": stats,
        "armed_schedules": state.scheduler.armed_count().await,
    }))
}
