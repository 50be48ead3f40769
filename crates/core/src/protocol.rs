//! 控制通道消息格式
//!
//! 每条应用消息都是 `{ "type": ..., "timestamp": ..., 各类型字段 }` 形式的JSON对象。
//! 消息类型是封闭的枚举, 在进入业务逻辑之前完成校验。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{FleetError, FleetResult};

/// 带时间戳的消息信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: ChannelMessage,
}

/// 控制通道消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChannelMessage {
    /// agent→server 认证
    Auth { token: String },
    /// server→agent 认证成功
    AuthOk {
        agent_id: String,
        heartbeat_interval_secs: u64,
    },
    /// 双向心跳探测
    Heartbeat {},
    /// 心跳应答, 应答时间即信封时间戳
    HeartbeatAck {},
    /// server→agent 指令
    Command {
        command_id: String,
        command_type: String,
        #[serde(default)]
        parameters: Value,
    },
    /// agent→server 已开始执行
    Ack { command_id: String },
    /// agent→server 执行结果
    Result { command_id: String, result: Value },
    /// 执行失败或协议层拒绝
    Error {
        #[serde(default)]
        command_id: Option<String>,
        code: String,
        message: String,
    },
    /// agent→server 诊断日志
    Log {
        level: String,
        message: String,
        #[serde(default)]
        metadata: Option<Value>,
    },
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl ChannelMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelMessage::Auth { .. } => "auth",
            ChannelMessage::AuthOk { .. } => "auth_ok",
            ChannelMessage::Heartbeat {} => "heartbeat",
            ChannelMessage::HeartbeatAck {} => "heartbeat_ack",
            ChannelMessage::Command { .. } => "command",
            ChannelMessage::Ack { .. } => "ack",
            ChannelMessage::Result { .. } => "result",
            ChannelMessage::Error { .. } => "error",
            ChannelMessage::Log { .. } => "log",
        }
    }

    /// 只允许由服务端发出的消息类型
    pub fn is_server_only(&self) -> bool {
        matches!(
            self,
            ChannelMessage::AuthOk { .. } | ChannelMessage::Command { .. }
        )
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        ChannelMessage::Error {
            command_id: None,
            code: "VALIDATION_ERROR".to_string(),
            message: message.into(),
        }
    }

    /// 反序列化无法表达的字段约束
    fn validate(&self) -> FleetResult<()> {
        match self {
            ChannelMessage::Auth { token } if token.trim().is_empty() => {
                Err(FleetError::Validation("auth.token不能为空".to_string()))
            }
            ChannelMessage::Command { command_id, .. }
            | ChannelMessage::Ack { command_id }
            | ChannelMessage::Result { command_id, .. }
                if command_id.is_empty() =>
            {
                Err(FleetError::Validation("commandId不能为空".to_string()))
            }
            ChannelMessage::Command { command_type, .. } if command_type.is_empty() => {
                Err(FleetError::Validation("commandType不能为空".to_string()))
            }
            ChannelMessage::Log { level, .. } if !LOG_LEVELS.contains(&level.as_str()) => Err(
                FleetError::Validation(format!("未知的日志级别: {level}")),
            ),
            _ => Ok(()),
        }
    }
}

impl Envelope {
    pub fn now(message: ChannelMessage) -> Self {
        Self {
            timestamp: Utc::now(),
            message,
        }
    }

    /// 解析并校验一条消息, 任何格式问题都归为 `FleetError::Validation`
    pub fn decode(raw: &str) -> FleetResult<Self> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| FleetError::Validation(format!("无效的消息: {e}")))?;
        envelope.message.validate()?;
        Ok(envelope)
    }

    pub fn encode(&self) -> FleetResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_uses_camel_case_fields() {
        let envelope = Envelope::now(ChannelMessage::Command {
            command_id: "c-1".to_string(),
            command_type: "echo".to_string(),
            parameters: json!({"text": "hi"}),
        });
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["commandId"], "c-1");
        assert_eq!(value["commandType"], "echo");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_decode_heartbeat_ack() {
        let envelope =
            Envelope::decode(r#"{"type":"heartbeat_ack","timestamp":"2026-03-01T10:00:00Z"}"#)
                .unwrap();
        assert_eq!(envelope.message, ChannelMessage::HeartbeatAck {});
        assert_eq!(envelope.timestamp.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_decode_agent_error_without_command() {
        let envelope = Envelope::decode(
            r#"{"type":"error","timestamp":"2026-03-01T10:00:00Z","code":"DISK_FULL","message":"no space"}"#,
        )
        .unwrap();
        match envelope.message {
            ChannelMessage::Error { command_id, code, .. } => {
                assert!(command_id.is_none());
                assert_eq!(code, "DISK_FULL");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_type_and_malformed_payloads() {
        let cases = [
            r#"{"type":"subscribe","timestamp":"2026-03-01T10:00:00Z"}"#,
            r#"{"type":"result","timestamp":"2026-03-01T10:00:00Z","commandId":"c"}"#,
            r#"{"type":"heartbeat"}"#,
            r#"{"type":"auth","timestamp":"2026-03-01T10:00:00Z","token":"  "}"#,
            r#"{"type":"log","timestamp":"2026-03-01T10:00:00Z","level":"loud","message":"x"}"#,
            "not json",
        ];
        for raw in cases {
            let err = Envelope::decode(raw).unwrap_err();
            assert!(matches!(err, FleetError::Validation(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn test_server_only_types() {
        assert!(ChannelMessage::AuthOk {
            agent_id: "a".into(),
            heartbeat_interval_secs: 30
        }
        .is_server_only());
        assert!(!ChannelMessage::Heartbeat {}.is_server_only());
    }
}
