#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use fleet_api::channel::{run_session, ChannelContext, ConnectionRegistry, Frame, SessionEnd};
use fleet_api::{create_app, AppState};
use fleet_core::config::{ChannelConfig, OrchestratorConfig, SchedulerConfig, ServerConfig};
use fleet_core::models::{AgentRegistration, DeviceMetadata, RegistrationOutcome};
use fleet_core::{ChannelMessage, Envelope};
use fleet_dispatcher::{AgentDirectory, CommandLifecycle, Scheduler, TaskOrchestrator};
use fleet_infrastructure::{
    InMemoryAgentLogRepository, InMemoryAgentRepository, InMemoryCommandRepository,
    InMemoryScheduleRepository, MetricsCollector,
};

pub struct TestApp {
    pub state: AppState,
    pub directory: Arc<AgentDirectory>,
    pub registry: Arc<ConnectionRegistry>,
    pub orchestrator: Arc<TaskOrchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub commands: Arc<CommandLifecycle>,
    pub logs: Arc<InMemoryAgentLogRepository>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_channel_config(ChannelConfig::default())
    }

    pub fn with_channel_config(channel: ChannelConfig) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let orchestrator_config = OrchestratorConfig::default();

        let directory = Arc::new(AgentDirectory::new(
            Arc::new(InMemoryAgentRepository::new()),
            orchestrator_config.default_max_load,
        ));
        let commands = Arc::new(CommandLifecycle::new(
            Arc::new(InMemoryCommandRepository::new()),
            metrics.clone(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(channel.outbound_buffer, metrics.clone()));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            orchestrator_config.clone(),
            directory.clone(),
            commands.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(InMemoryScheduleRepository::new()),
            directory.clone(),
            orchestrator.clone(),
            &orchestrator_config,
            &SchedulerConfig::default(),
            metrics.clone(),
        ));
        let logs = Arc::new(InMemoryAgentLogRepository::new());

        let channel = Arc::new(ChannelContext {
            config: channel,
            directory: directory.clone(),
            registry: registry.clone(),
            outcomes: orchestrator.clone(),
            logs: logs.clone(),
            metrics,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = AppState {
            directory: directory.clone(),
            commands: commands.clone(),
            orchestrator: orchestrator.clone(),
            scheduler: scheduler.clone(),
            logs: logs.clone(),
            channel,
            prometheus: None,
            shutdown: shutdown_rx,
        };

        Self {
            state,
            directory,
            registry,
            orchestrator,
            scheduler,
            commands,
            logs,
            shutdown_tx,
        }
    }

    pub fn router(&self) -> Router {
        create_app(self.state.clone(), &ServerConfig::default())
    }

    /// 在随机端口上启动真实服务, 返回监听地址
    pub async fn spawn_server(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let app = self.router();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        address
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn register(&self, device_id: &str, owner_id: &str) -> RegistrationOutcome {
        self.directory
            .register(AgentRegistration {
                device_id: device_id.to_string(),
                owner_id: owner_id.to_string(),
                capabilities: vec!["shell".to_string()],
                metadata: DeviceMetadata::default(),
                max_concurrent_commands: Some(2),
            })
            .await
            .unwrap()
    }

    /// 通过内存通道驱动一个真实的会话循环
    pub fn open_socket(&self) -> TestSocket {
        let (client_tx, server_rx) = mpsc::unbounded::<Result<Frame, Infallible>>();
        let (server_tx, client_rx) = mpsc::unbounded::<Frame>();
        let session = tokio::spawn(run_session(
            self.state.channel.clone(),
            server_rx,
            server_tx,
            Some("127.0.0.1:50000".to_string()),
            self.state.shutdown.clone(),
        ));
        TestSocket {
            tx: client_tx,
            rx: client_rx,
            session,
        }
    }
}

pub struct TestSocket {
    tx: mpsc::UnboundedSender<Result<Frame, Infallible>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    pub session: JoinHandle<SessionEnd>,
}

impl TestSocket {
    pub fn send(&self, message: ChannelMessage) {
        let text = Envelope::now(message).encode().unwrap();
        self.send_frame(Frame::Text(text));
    }

    pub fn send_frame(&self, frame: Frame) {
        self.tx.unbounded_send(Ok(frame)).unwrap();
    }

    pub async fn recv_frame(&mut self) -> Frame {
        self.rx.next().await.expect("session closed the socket")
    }

    pub async fn recv(&mut self) -> ChannelMessage {
        match self.recv_frame().await {
            Frame::Text(text) => Envelope::decode(&text).unwrap().message,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// 跳过其余消息, 返回关闭码
    pub async fn expect_close(&mut self) -> u16 {
        loop {
            if let Frame::Close(reason) = self.recv_frame().await {
                return reason.map_or(1005, |r| r.code);
            }
        }
    }

    pub async fn authenticate(&mut self, token: &str) -> String {
        self.send(ChannelMessage::Auth {
            token: token.to_string(),
        });
        match self.recv().await {
            ChannelMessage::AuthOk { agent_id, .. } => agent_id,
            other => panic!("expected auth_ok, got {other:?}"),
        }
    }

    /// 客户端断开, 等待会话结束
    pub async fn hang_up(self) -> SessionEnd {
        drop(self.tx);
        self.session.await.unwrap()
    }

    pub async fn finished(self) -> SessionEnd {
        self.session.await.unwrap()
    }
}
