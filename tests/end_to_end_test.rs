use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use fleet_agent::{AgentConfig, AgentRunner};
use fleet_control::{Application, ShutdownManager};
use fleet_core::config::{AppConfig, StorageBackend};

struct RunningServer {
    address: SocketAddr,
    shutdown: ShutdownManager,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    async fn start(config: AppConfig) -> Self {
        let app = Application::new(config).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let shutdown = ShutdownManager::new();
        let handle = tokio::spawn(app.run(listener, shutdown.subscribe()));
        Self {
            address,
            shutdown,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    async fn stop(self) {
        self.shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database.backend = StorageBackend::Memory;
    config.server.metrics_enabled = false;
    config.orchestrator.dispatch_interval_ms = 50;
    config.scheduler.tick_interval_ms = 50;
    config
}

async fn get_data(client: &reqwest::Client, url: &str) -> Value {
    let body: Value = client.get(url).send().await.unwrap().json().await.unwrap();
    body["data"].clone()
}

/// 轮询直到条件成立
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_agent_executes_submitted_task() {
    let server = RunningServer::start(fast_config()).await;
    let client = reqwest::Client::new();

    let agent_config = AgentConfig {
        server_url: format!("http://{}", server.address),
        device_id: "e2e-device".to_string(),
        owner_id: "owner-1".to_string(),
        shell_enabled: false,
        ..AgentConfig::default()
    };
    let (agent_shutdown_tx, agent_shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(async move { AgentRunner::new(agent_config).run(agent_shutdown_rx).await });

    let agents_url = server.url("/api/agents?owner_id=owner-1");
    eventually(|| async {
        let agents = get_data(&client, &agents_url).await;
        agents[0]["status"] == "online"
    })
    .await;

    let response = client
        .post(server.url("/api/tasks"))
        .json(&json!({
            "issuer_id": "owner-1",
            "command_type": "echo",
            "parameters": {"text": "hi"},
            "capability": "echo"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let task: Value = response.json().await.unwrap();
    let task_url = server.url(&format!("/api/tasks/{}", task["data"]["id"].as_str().unwrap()));

    eventually(|| async { get_data(&client, &task_url).await["status"] == "completed" }).await;

    let task = get_data(&client, &task_url).await;
    let command = get_data(
        &client,
        &server.url(&format!("/api/commands/{}", task["command_id"].as_str().unwrap())),
    )
    .await;
    assert_eq!(command["status"], "completed");
    assert_eq!(command["result"], json!({"text": "hi"}));

    agent_shutdown_tx.send(true).unwrap();
    agent.await.unwrap().unwrap();

    eventually(|| async {
        let agents = get_data(&client, &agents_url).await;
        agents[0]["status"] == "offline"
    })
    .await;

    server.stop().await;
}

#[tokio::test]
async fn test_sqlite_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.database.backend = StorageBackend::Sqlite;
    config.database.url = format!("sqlite://{}", dir.path().join("fleet.db").display());

    let client = reqwest::Client::new();
    let server = RunningServer::start(config.clone()).await;
    let response = client
        .post(server.url("/api/agents/register"))
        .json(&json!({
            "device_id": "laptop-1",
            "owner_id": "owner-1",
            "capabilities": ["echo"],
            "metadata": {"platform": "linux", "version": "1.0.0", "hostname": "laptop"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let registered: Value = response.json().await.unwrap();
    let agent_id = registered["data"]["agentId"].as_str().unwrap().to_string();
    server.stop().await;

    let server = RunningServer::start(config).await;
    let agent = get_data(&client, &server.url(&format!("/api/agents/{agent_id}"))).await;
    assert_eq!(agent["device_id"], "laptop-1");
    assert_eq!(agent["status"], "offline");
    server.stop().await;
}
