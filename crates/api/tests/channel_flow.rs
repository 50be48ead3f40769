mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use common::TestApp;
use fleet_api::channel::{CloseReason, Frame};
use fleet_core::config::ChannelConfig;
use fleet_core::limits::close_code;
use fleet_core::models::{AgentStatus, CommandStatus, TaskRequest, TaskStatus};
use fleet_core::ChannelMessage;

async fn status_of(app: &TestApp, agent_id: &str) -> AgentStatus {
    app.directory.get(agent_id).await.unwrap().status
}

#[tokio::test(start_paused = true)]
async fn test_auth_marks_agent_online() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;

    let mut socket = app.open_socket();
    socket.send(ChannelMessage::Auth {
        token: registration.token.clone(),
    });
    match socket.recv().await {
        ChannelMessage::AuthOk {
            agent_id,
            heartbeat_interval_secs,
        } => {
            assert_eq!(agent_id, registration.agent_id);
            assert_eq!(heartbeat_interval_secs, 30);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(status_of(&app, &registration.agent_id).await, AgentStatus::Online);
    assert_eq!(
        app.registry.connected_agents().await,
        vec![registration.agent_id.clone()]
    );
    let agent = app.directory.get(&registration.agent_id).await.unwrap();
    assert!(agent.last_heartbeat.is_some());
    assert_eq!(agent.last_address.as_deref(), Some("127.0.0.1:50000"));

    let end = socket.hang_up().await;
    assert_eq!(end.agent_id.as_deref(), Some(registration.agent_id.as_str()));
    assert_eq!(status_of(&app, &registration.agent_id).await, AgentStatus::Offline);
    assert_eq!(app.registry.connected_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_token_closes_with_4001() {
    let app = TestApp::new();
    let mut socket = app.open_socket();

    socket.send(ChannelMessage::Auth {
        token: "not-a-token".to_string(),
    });
    match socket.recv().await {
        ChannelMessage::Error { code, command_id, .. } => {
            assert_eq!(code, "AUTH_FAILED");
            assert!(command_id.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(socket.expect_close().await, close_code::AUTH_FAILED);

    let end = socket.finished().await;
    assert_eq!(end.agent_id, None);
    assert_eq!(end.close_code, close_code::AUTH_FAILED);
}

#[tokio::test(start_paused = true)]
async fn test_auth_window_elapses() {
    let app = TestApp::new();
    let start = Instant::now();
    let mut socket = app.open_socket();

    assert_eq!(socket.expect_close().await, close_code::AUTH_FAILED);
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(start.elapsed() < Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn test_messages_before_auth_are_rejected_without_closing() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();

    socket.send(ChannelMessage::Heartbeat {});
    match socket.recv().await {
        ChannelMessage::Error { code, .. } => assert_eq!(code, "VALIDATION_ERROR"),
        other => panic!("unexpected {other:?}"),
    }

    let agent_id = socket.authenticate(&registration.token).await;
    assert_eq!(agent_id, registration.agent_id);
}

#[tokio::test(start_paused = true)]
async fn test_revoked_token_is_refused() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    app.directory
        .delete(&registration.agent_id, "owner-1")
        .await
        .unwrap();

    let mut socket = app.open_socket();
    socket.send(ChannelMessage::Auth {
        token: registration.token,
    });
    assert_eq!(socket.expect_close().await, close_code::AUTH_FAILED);
}

#[tokio::test(start_paused = true)]
async fn test_client_heartbeat_is_acknowledged() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    socket.authenticate(&registration.token).await;

    socket.send(ChannelMessage::Heartbeat {});
    assert_eq!(socket.recv().await, ChannelMessage::HeartbeatAck {});
}

#[tokio::test(start_paused = true)]
async fn test_silent_agent_times_out() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    socket.authenticate(&registration.token).await;
    let start = Instant::now();

    // 服务端每30秒发送一次心跳
    assert_eq!(socket.recv().await, ChannelMessage::Heartbeat {});
    assert_eq!(start.elapsed(), Duration::from_secs(30));

    assert_eq!(socket.expect_close().await, close_code::HEARTBEAT_TIMEOUT);
    assert_eq!(start.elapsed(), Duration::from_secs(90));

    let end = socket.finished().await;
    assert_eq!(end.close_code, close_code::HEARTBEAT_TIMEOUT);
    assert_eq!(status_of(&app, &registration.agent_id).await, AgentStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ack_keeps_connection_alive() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    socket.authenticate(&registration.token).await;
    let start = Instant::now();

    for _ in 0..4 {
        assert_eq!(socket.recv().await, ChannelMessage::Heartbeat {});
        socket.send(ChannelMessage::HeartbeatAck {});
    }
    assert_eq!(start.elapsed(), Duration::from_secs(120));
    assert_eq!(status_of(&app, &registration.agent_id).await, AgentStatus::Online);

    // 最后一次应答在120秒, 超时发生在210秒
    assert_eq!(socket.expect_close().await, close_code::HEARTBEAT_TIMEOUT);
    assert_eq!(start.elapsed(), Duration::from_secs(210));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_closes_with_4029() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    socket.authenticate(&registration.token).await;

    // 认证消息占用了窗口中的一个名额
    for _ in 0..20 {
        socket.send(ChannelMessage::Heartbeat {});
    }
    let mut acks = 0;
    let code = loop {
        match socket.recv_frame().await {
            Frame::Text(_) => acks += 1,
            Frame::Close(reason) => break reason.map(|r| r.code),
            other => panic!("unexpected {other:?}"),
        }
    };

    assert_eq!(acks, 19);
    assert_eq!(code, Some(close_code::RATE_LIMITED));
    assert_eq!(socket.finished().await.close_code, close_code::RATE_LIMITED);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_message_closes_with_1009() {
    let app = TestApp::with_channel_config(ChannelConfig {
        max_message_bytes: 64,
        ..ChannelConfig::default()
    });
    let mut socket = app.open_socket();

    socket.send_frame(Frame::Text("x".repeat(65)));
    assert_eq!(socket.expect_close().await, close_code::MESSAGE_TOO_LARGE);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_violations_close_with_1008() {
    let app = TestApp::new();
    let mut socket = app.open_socket();

    for _ in 0..5 {
        socket.send_frame(Frame::Text("{not json".to_string()));
    }
    for _ in 0..5 {
        match socket.recv().await {
            ChannelMessage::Error { code, .. } => assert_eq!(code, "VALIDATION_ERROR"),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(socket.expect_close().await, close_code::POLICY_VIOLATION);
}

#[tokio::test(start_paused = true)]
async fn test_server_only_message_from_agent_is_a_violation() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    socket.authenticate(&registration.token).await;

    socket.send(ChannelMessage::Command {
        command_id: "c-1".to_string(),
        command_type: "echo".to_string(),
        parameters: json!({}),
    });
    match socket.recv().await {
        ChannelMessage::Error { code, message, .. } => {
            assert_eq!(code, "VALIDATION_ERROR");
            assert!(message.contains("command"));
        }
        other => panic!("unexpected {other:?}"),
    }

    socket.send_frame(Frame::Binary(vec![0xff, 0xfe]));
    assert!(matches!(socket.recv().await, ChannelMessage::Error { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_newer_connection_supersedes_older() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;

    let mut first = app.open_socket();
    first.authenticate(&registration.token).await;
    let mut second = app.open_socket();
    second.authenticate(&registration.token).await;

    assert_eq!(first.expect_close().await, close_code::SUPERSEDED);
    let end = first.finished().await;
    assert_eq!(end.close_code, close_code::SUPERSEDED);

    // 旧连接退出不影响新连接
    assert_eq!(status_of(&app, &registration.agent_id).await, AgentStatus::Online);
    assert_eq!(app.registry.connected_count().await, 1);
    second.send(ChannelMessage::Heartbeat {});
    assert_eq!(second.recv().await, ChannelMessage::HeartbeatAck {});

    second.hang_up().await;
    assert_eq!(status_of(&app, &registration.agent_id).await, AgentStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_command_round_trip() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    let agent_id = socket.authenticate(&registration.token).await;

    let task = app
        .orchestrator
        .submit(TaskRequest::pinned(&agent_id, "user-1", "echo", json!({"text": "hi"})))
        .await
        .unwrap();
    assert_eq!(app.orchestrator.dispatch_pass().await.unwrap(), 1);

    let command_id = match socket.recv().await {
        ChannelMessage::Command {
            command_id,
            command_type,
            parameters,
        } => {
            assert_eq!(command_type, "echo");
            assert_eq!(parameters, json!({"text": "hi"}));
            command_id
        }
        other => panic!("unexpected {other:?}"),
    };

    socket.send(ChannelMessage::Ack {
        command_id: command_id.clone(),
    });
    socket.send(ChannelMessage::Result {
        command_id: command_id.clone(),
        result: json!({"text": "hi"}),
    });
    // 心跳应答说明前面的消息都已处理
    socket.send(ChannelMessage::Heartbeat {});
    assert_eq!(socket.recv().await, ChannelMessage::HeartbeatAck {});

    let command = app.commands.get(&command_id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Completed);
    assert_eq!(command.result, Some(json!({"text": "hi"})));
    let task = app.orchestrator.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let agent = app.directory.get(&agent_id).await.unwrap();
    assert_eq!(agent.current_load, 0);
    assert_eq!(agent.completed_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_outcome_for_unknown_command_is_reported() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    socket.authenticate(&registration.token).await;

    socket.send(ChannelMessage::Result {
        command_id: "missing".to_string(),
        result: json!(null),
    });
    match socket.recv().await {
        ChannelMessage::Error {
            command_id, code, ..
        } => {
            assert_eq!(command_id.as_deref(), Some("missing"));
            assert_eq!(code, "NOT_FOUND");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_log_messages_are_persisted() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    let agent_id = socket.authenticate(&registration.token).await;

    socket.send(ChannelMessage::Log {
        level: "warn".to_string(),
        message: "disk almost full".to_string(),
        metadata: Some(json!({"free_mb": 120})),
    });
    socket.send(ChannelMessage::Heartbeat {});
    assert_eq!(socket.recv().await, ChannelMessage::HeartbeatAck {});

    use fleet_core::traits::AgentLogRepository;
    let logs = app.logs.list_by_agent(&agent_id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, "warn");
    assert_eq!(logs[0].message, "disk almost full");
}

#[tokio::test(start_paused = true)]
async fn test_agent_level_error_marks_error_until_teardown() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    let agent_id = socket.authenticate(&registration.token).await;

    socket.send(ChannelMessage::Error {
        command_id: None,
        code: "EXECUTOR_CRASHED".to_string(),
        message: "executor crashed".to_string(),
    });
    socket.send(ChannelMessage::Heartbeat {});
    assert_eq!(socket.recv().await, ChannelMessage::HeartbeatAck {});
    assert_eq!(status_of(&app, &agent_id).await, AgentStatus::Error);

    socket.hang_up().await;
    assert_eq!(status_of(&app, &agent_id).await, AgentStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_with_1001() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    let agent_id = socket.authenticate(&registration.token).await;

    app.shutdown();
    assert_eq!(socket.expect_close().await, close_code::GOING_AWAY);
    socket.finished().await;
    assert_eq!(status_of(&app, &agent_id).await, AgentStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_request_closes_session() {
    let app = TestApp::new();
    let registration = app.register("laptop-1", "owner-1").await;
    let mut socket = app.open_socket();
    let agent_id = socket.authenticate(&registration.token).await;

    app.directory.delete(&agent_id, "owner-1").await.unwrap();
    assert!(
        app.registry
            .disconnect(&agent_id, CloseReason::new(close_code::AUTH_FAILED, "agent revoked"))
            .await
    );
    assert_eq!(socket.expect_close().await, close_code::AUTH_FAILED);
    socket.finished().await;
    assert_eq!(app.registry.connected_count().await, 0);
}
