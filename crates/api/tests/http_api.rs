mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use common::TestApp;
use fleet_core::config::ChannelConfig;
use fleet_core::models::AgentStatus;
use fleet_core::{ChannelMessage, Envelope};

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn registration(device_id: &str, owner_id: &str) -> Value {
    json!({
        "device_id": device_id,
        "owner_id": owner_id,
        "capabilities": ["shell"],
        "metadata": {"platform": "linux", "version": "1.0.0", "hostname": "box"}
    })
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new();
    let (status, body) = call(&app.router(), Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connected_agents"], 0);
}

#[tokio::test]
async fn test_register_agent_is_idempotent_per_owner() {
    let app = TestApp::new();
    let router = app.router();

    let (status, first) = call(
        &router,
        Method::POST,
        "/api/agents/register",
        Some(registration("laptop-1", "owner-1")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["success"], true);
    assert_eq!(first["data"]["existing"], false);
    let token = first["data"]["token"].as_str().unwrap().to_string();

    let (status, second) = call(
        &router,
        Method::POST,
        "/api/agents/register",
        Some(registration("laptop-1", "owner-1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["existing"], true);
    assert_eq!(second["data"]["token"], token.as_str());
    assert_eq!(second["data"]["agentId"], first["data"]["agentId"]);

    let (status, conflict) = call(
        &router,
        Method::POST,
        "/api/agents/register",
        Some(registration("laptop-1", "owner-2")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(conflict["error"]["type"], "DUPLICATE_IDENTITY");
    assert_eq!(conflict["error"]["code"], 409);
}

#[tokio::test]
async fn test_agent_queries_hide_token() {
    let app = TestApp::new();
    let outcome = app.register("laptop-1", "owner-1").await;
    app.register("laptop-2", "owner-2").await;
    let router = app.router();

    let (status, body) = call(
        &router,
        Method::GET,
        &format!("/api/agents/{}", outcome.agent_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["device_id"], "laptop-1");
    assert_eq!(body["data"]["status"], "offline");
    assert!(body["data"].get("token").is_none());

    let (_, body) = call(&router, Method::GET, "/api/agents?owner_id=owner-2", None).await;
    let agents = body["data"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["device_id"], "laptop-2");

    let (status, body) = call(&router, Method::GET, "/api/agents/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "NOT_FOUND");
    assert!(body["error"]["suggestions"].is_array());
}

#[tokio::test]
async fn test_delete_agent_requires_owner() {
    let app = TestApp::new();
    let outcome = app.register("laptop-1", "owner-1").await;
    let router = app.router();
    let uri = format!("/api/agents/{}", outcome.agent_id);

    let (status, body) = call(&router, Method::DELETE, &format!("{uri}?owner_id=intruder"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["type"], "FORBIDDEN");

    let (status, body) = call(&router, Method::DELETE, &format!("{uri}?owner_id=owner-1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["revoked"], true);
    assert!(body["data"]["deleted_at"].is_string());

    let (status, _) = call(&router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_task_submission_and_cancel() {
    let app = TestApp::new();
    let router = app.router();

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/tasks",
        Some(json!({"issuer_id": "user-1", "command_type": "echo", "priority": 11})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "VALIDATION_ERROR");

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "issuer_id": "user-1",
            "command_type": "echo",
            "parameters": {"text": "hi"},
            "capability": "shell"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["priority"], 5);
    assert_eq!(body["data"]["max_retries"], 3);
    let task_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(&router, Method::POST, &format!("/api/tasks/{task_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    let (status, body) = call(&router, Method::POST, &format!("/api/tasks/{task_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "INVALID_TRANSITION");

    let (status, body) = call(&router, Method::GET, &format!("/api/tasks/{task_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");
}

#[tokio::test]
async fn test_pinned_task_exposes_pending_command() {
    let app = TestApp::new();
    let outcome = app.register("laptop-1", "owner-1").await;
    let router = app.router();

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "issuer_id": "user-1",
            "command_type": "system_info",
            "target": {"kind": "agent", "agent_id": outcome.agent_id}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let command_id = body["data"]["command_id"].as_str().unwrap().to_string();

    let (status, body) = call(&router, Method::GET, &format!("/api/commands/{command_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "pending");

    let (_, body) = call(
        &router,
        Method::GET,
        &format!("/api/agents/{}/commands", outcome.agent_id),
        None,
    )
    .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_json_is_rejected() {
    let app = TestApp::new();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/tasks")
        .header("content-type", "application/json")
        .body(Body::from("{oops"))
        .unwrap();

    let response = app.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["type"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_schedule_lifecycle() {
    let app = TestApp::new();
    let outcome = app.register("laptop-1", "owner-1").await;
    let router = app.router();

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/schedules",
        Some(json!({
            "owner_id": "owner-1",
            "agent_id": outcome.agent_id,
            "name": "nightly backup",
            "command_type": "shell",
            "parameters": {"command": "backup.sh"},
            "kind": {"type": "cron", "expression": "0 0 3 * * *"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "active");
    assert!(body["data"]["next_run_at"].is_string());
    let schedule_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &router,
        Method::POST,
        &format!("/api/schedules/{schedule_id}/pause"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "paused");

    let (_, body) = call(
        &router,
        Method::POST,
        &format!("/api/schedules/{schedule_id}/resume"),
        None,
    )
    .await;
    assert_eq!(body["data"]["status"], "active");

    let (_, body) = call(&router, Method::GET, "/api/schedules?owner_id=owner-1", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = call(&router, Method::DELETE, &format!("/api/schedules/{schedule_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&router, Method::GET, &format!("/api/schedules/{schedule_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_cron_is_rejected() {
    let app = TestApp::new();
    let outcome = app.register("laptop-1", "owner-1").await;

    let (status, body) = call(
        &app.router(),
        Method::POST,
        "/api/schedules",
        Some(json!({
            "owner_id": "owner-1",
            "agent_id": outcome.agent_id,
            "name": "broken",
            "command_type": "shell",
            "kind": {"type": "cron", "expression": "every tuesday"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "INVALID_CRON");
}

#[tokio::test]
async fn test_event_trigger_reports_unreachable_agent() {
    let app = TestApp::new();
    let outcome = app.register("laptop-1", "owner-1").await;
    let router = app.router();

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/schedules",
        Some(json!({
            "owner_id": "owner-1",
            "agent_id": outcome.agent_id,
            "name": "on deploy",
            "command_type": "shell",
            "kind": {"type": "event", "event_name": "deploy"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let schedule_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(&router, Method::POST, "/api/events/deploy", None).await;
    assert_eq!(status, StatusCode::OK);
    let reports = body["data"].as_array().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["schedule_id"], schedule_id.as_str());
    assert!(reports[0]["error"].is_string());

    let (_, body) = call(&router, Method::POST, "/api/events/other", Some(json!({"x": 1}))).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_metrics_and_unknown_routes() {
    let app = TestApp::new();
    let router = app.router();

    let (status, _) = call(&router, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&router, Method::GET, "/api/nothing-here", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "NOT_FOUND");
}

#[tokio::test]
async fn test_websocket_end_to_end() {
    let app = TestApp::new();
    let address = app.spawn_server().await;
    let client = reqwest::Client::new();

    let response: Value = client
        .post(format!("http://{address}/api/agents/register"))
        .json(&registration("laptop-9", "owner-1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = response["data"]["token"].as_str().unwrap().to_string();
    let agent_id = response["data"]["agentId"].as_str().unwrap().to_string();

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{address}/ws"))
        .await
        .unwrap();
    let auth = Envelope::now(ChannelMessage::Auth { token }).encode().unwrap();
    socket.send(Message::Text(auth.into())).await.unwrap();

    let reply = loop {
        match socket.next().await.unwrap().unwrap() {
            Message::Text(text) => break Envelope::decode(text.as_str()).unwrap().message,
            _ => continue,
        }
    };
    assert_eq!(
        reply,
        ChannelMessage::AuthOk {
            agent_id: agent_id.clone(),
            heartbeat_interval_secs: 30
        }
    );
    assert_eq!(
        app.directory.get(&agent_id).await.unwrap().status,
        AgentStatus::Online
    );

    socket.close(None).await.unwrap();
    // 等待服务端完成清理
    for _ in 0..50 {
        if app.directory.get(&agent_id).await.unwrap().status == AgentStatus::Offline {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("agent was not marked offline after the socket closed");
}

async fn authenticated_socket(
    app: &TestApp,
    address: std::net::SocketAddr,
    device_id: &str,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let outcome = app.register(device_id, "owner-1").await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{address}/ws"))
        .await
        .unwrap();
    let auth = Envelope::now(ChannelMessage::Auth {
        token: outcome.token,
    })
    .encode()
    .unwrap();
    socket.send(Message::Text(auth.into())).await.unwrap();
    loop {
        match socket.next().await.unwrap().unwrap() {
            Message::Text(text) => {
                let reply = Envelope::decode(text.as_str()).unwrap().message;
                assert!(matches!(reply, ChannelMessage::AuthOk { .. }));
                return socket;
            }
            _ => continue,
        }
    }
}

async fn close_code_after<S>(socket: &mut S) -> Option<u16>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_oversized_messages_close_with_1009() {
    let app = TestApp::with_channel_config(ChannelConfig {
        max_message_bytes: 1024,
        ..ChannelConfig::default()
    });
    let address = app.spawn_server().await;

    // 超过上限但在传输层放宽范围内
    let mut socket = authenticated_socket(&app, address, "laptop-a").await;
    socket
        .send(Message::Text("x".repeat(1500).into()))
        .await
        .unwrap();
    assert_eq!(close_code_after(&mut socket).await, Some(1009));

    // 超过传输层上限, 由tungstenite在读取时拒绝
    let mut socket = authenticated_socket(&app, address, "laptop-b").await;
    socket
        .send(Message::Text("x".repeat(4096).into()))
        .await
        .unwrap();
    assert_eq!(close_code_after(&mut socket).await, Some(1009));
}
