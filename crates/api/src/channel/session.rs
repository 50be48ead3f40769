//! 控制通道会话
//!
//! 每个连接由一个会话任务驱动, 状态依次经过 AwaitingAuth → Authenticated → Closed。
//! 应用消息在分派之前先检查大小上限, 再经过滑动窗口限速; 格式错误只回复
//! `error` 消息, 累计违规达到上限才断开连接。
//!
//! 认证后服务端按固定周期发送心跳, 超时窗口内没有收到任何数据时关闭连接并
//! 将Agent标记为离线。

use std::fmt::Display;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use fleet_core::config::ChannelConfig;
use fleet_core::limits::close_code;
use fleet_core::models::NewAgentLog;
use fleet_core::shutdown::wait_for_shutdown;
use fleet_core::traits::{AgentLogRepository, CommandOutcomeHandler};
use fleet_core::{AuthError, ChannelMessage, Envelope, FleetError, FleetResult};
use fleet_dispatcher::AgentDirectory;
use fleet_infrastructure::MetricsCollector;

use super::frame::{CloseReason, Frame, TransportError};
use super::rate_limiter::SlidingWindowLimiter;
use super::registry::{Attachment, ConnectionRegistry};

/// 对端没有给出关闭码
const NO_STATUS: u16 = 1005;
/// 传输层异常断开
const ABNORMAL: u16 = 1006;

/// 所有会话共享的依赖
pub struct ChannelContext {
    pub config: ChannelConfig,
    pub directory: Arc<AgentDirectory>,
    pub registry: Arc<ConnectionRegistry>,
    pub outcomes: Arc<dyn CommandOutcomeHandler>,
    pub logs: Arc<dyn AgentLogRepository>,
    pub metrics: Arc<MetricsCollector>,
}

/// 会话结束时的摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    pub connection_id: u64,
    pub agent_id: Option<String>,
    pub close_code: u16,
}

enum SessionState {
    AwaitingAuth,
    Authenticated { agent_id: String },
    Closed,
}

enum Exit {
    /// 服务端主动关闭, 需要发送关闭帧
    Close(CloseReason),
    /// 对端已经离开
    Ended(u16),
}

struct Session<I, O> {
    ctx: Arc<ChannelContext>,
    incoming: I,
    outgoing: O,
    connection_id: u64,
    peer: Option<String>,
    limiter: SlidingWindowLimiter,
    violations: u32,
    last_seen: Instant,
    state: SessionState,
}

/// 驱动一个连接直到关闭
pub async fn run_session<I, O, E>(
    ctx: Arc<ChannelContext>,
    incoming: I,
    outgoing: O,
    peer: Option<String>,
    mut shutdown: watch::Receiver<bool>,
) -> SessionEnd
where
    I: Stream<Item = Result<Frame, E>> + Unpin + Send,
    E: Into<TransportError> + Send,
    O: Sink<Frame> + Unpin + Send,
    O::Error: Display,
{
    let connection_id = ctx.registry.next_connection_id();
    let limiter = SlidingWindowLimiter::new(
        ctx.config.rate_limit_per_second,
        ctx.config.rate_limit_window(),
    );
    let mut session = Session {
        ctx,
        incoming,
        outgoing,
        connection_id,
        peer,
        limiter,
        violations: 0,
        last_seen: Instant::now(),
        state: SessionState::AwaitingAuth,
    };
    debug!(connection_id, peer = ?session.peer, "连接已建立, 等待认证");

    let exit = match session.authenticate(&mut shutdown).await {
        Ok((agent_id, attachment)) => session.serve(&agent_id, attachment, &mut shutdown).await,
        Err(exit) => exit,
    };
    session.finish(exit).await
}

impl<I, O, E> Session<I, O>
where
    I: Stream<Item = Result<Frame, E>> + Unpin + Send,
    E: Into<TransportError> + Send,
    O: Sink<Frame> + Unpin + Send,
    O::Error: Display,
{
    async fn authenticate(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(String, Attachment), Exit> {
        let deadline = Instant::now() + self.ctx.config.auth_timeout();
        loop {
            let frame = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => {
                    return Err(Exit::Close(CloseReason::new(close_code::GOING_AWAY, "server shutting down")));
                }
                _ = sleep_until(deadline) => {
                    warn!(connection_id = self.connection_id, "认证窗口已过期");
                    self.ctx.metrics.record_message_rejected("auth_timeout");
                    return Err(self.reject_auth(AuthError::WindowElapsed.into()).await);
                }
                frame = self.incoming.next() => frame,
            };

            match self.screen(frame).await? {
                Some(ChannelMessage::Auth { token }) => return self.accept(&token).await,
                Some(other) => {
                    self.violation(format!("认证前不接受 {} 消息", other.type_name()))
                        .await?
                }
                None => {}
            }
        }
    }

    async fn accept(&mut self, token: &str) -> Result<(String, Attachment), Exit> {
        let agent = match self.ctx.directory.authenticate(token).await {
            Ok(agent) => agent,
            Err(e @ FleetError::Auth(_)) => {
                warn!(connection_id = self.connection_id, "认证失败: {}", e);
                self.ctx.metrics.record_message_rejected("auth_failed");
                return Err(self.reject_auth(e).await);
            }
            Err(e) => {
                error!(connection_id = self.connection_id, "认证时出错: {}", e);
                return Err(internal_error());
            }
        };

        // 先登记连接再标记在线, 派发循环看到online时连接一定可用
        let attachment = self
            .ctx
            .registry
            .attach(&agent.id, self.connection_id)
            .await;
        self.state = SessionState::Authenticated {
            agent_id: agent.id.clone(),
        };
        if let Err(e) = self.ctx.directory.mark_online(&agent.id).await {
            error!(agent_id = %agent.id, "标记Agent在线失败: {}", e);
            return Err(internal_error());
        }
        self.touch(&agent.id).await;

        self.send(ChannelMessage::AuthOk {
            agent_id: agent.id.clone(),
            heartbeat_interval_secs: self.ctx.config.heartbeat_interval_seconds,
        })
        .await?;

        info!(
            agent_id = %agent.id,
            connection_id = self.connection_id,
            peer = ?self.peer,
            "Agent认证成功"
        );
        Ok((agent.id, attachment))
    }

    async fn serve(
        &mut self,
        agent_id: &str,
        attachment: Attachment,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        let interval = self.ctx.config.heartbeat_interval();
        let timeout = self.ctx.config.heartbeat_timeout();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let Attachment {
            mut outbound,
            mut close,
        } = attachment;

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => {
                    return Exit::Close(CloseReason::new(close_code::GOING_AWAY, "server shutting down"));
                }
                reason = &mut close => {
                    return Exit::Close(reason.unwrap_or_else(|_| {
                        CloseReason::new(close_code::GOING_AWAY, "connection released")
                    }));
                }
                _ = sleep_until(self.last_seen + timeout) => {
                    warn!(
                        agent_id = %agent_id,
                        connection_id = self.connection_id,
                        "心跳超时, 超过{}秒没有收到数据",
                        timeout.as_secs()
                    );
                    return Exit::Close(CloseReason::new(close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout"));
                }
                _ = heartbeat.tick() => {
                    if let Err(exit) = self.send(ChannelMessage::Heartbeat {}).await {
                        return exit;
                    }
                }
                message = outbound.recv() => {
                    let Some(message) = message else {
                        return Exit::Close(CloseReason::new(close_code::GOING_AWAY, "connection released"));
                    };
                    if let Err(exit) = self.send(message).await {
                        return exit;
                    }
                }
                frame = self.incoming.next() => {
                    let handled = match self.screen(frame).await {
                        Ok(Some(message)) => self.handle(agent_id, message).await,
                        Ok(None) => Ok(()),
                        Err(exit) => Err(exit),
                    };
                    if let Err(exit) = handled {
                        return exit;
                    }
                }
            }
        }
    }

    /// 传输层检查: 大小上限、限速、解码。返回None表示该帧无需分派
    async fn screen(
        &mut self,
        frame: Option<Result<Frame, E>>,
    ) -> Result<Option<ChannelMessage>, Exit> {
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                return match e.into() {
                    TransportError::TooLarge { size, max_size } => {
                        warn!(
                            connection_id = self.connection_id,
                            "消息大小 {} 超过传输层上限 {}", size, max_size
                        );
                        self.ctx.metrics.record_message_rejected("too_large");
                        Err(Exit::Close(CloseReason::new(
                            close_code::MESSAGE_TOO_LARGE,
                            "message too large",
                        )))
                    }
                    TransportError::Other(e) => {
                        warn!(connection_id = self.connection_id, "传输错误: {}", e);
                        Err(Exit::Ended(ABNORMAL))
                    }
                };
            }
            None => return Err(Exit::Ended(ABNORMAL)),
        };
        self.last_seen = Instant::now();

        let Some(len) = frame.payload_len() else {
            return match frame {
                Frame::Close(reason) => Err(Exit::Ended(reason.map_or(NO_STATUS, |r| r.code))),
                _ => Ok(None),
            };
        };

        let limit = self.ctx.config.max_message_bytes;
        if len > limit {
            warn!(
                connection_id = self.connection_id,
                "消息大小 {} 超过上限 {}", len, limit
            );
            self.ctx.metrics.record_message_rejected("too_large");
            return Err(Exit::Close(CloseReason::new(
                close_code::MESSAGE_TOO_LARGE,
                "message too large",
            )));
        }

        if !self.limiter.check(Instant::now()) {
            warn!(connection_id = self.connection_id, "超过消息速率限制");
            self.ctx.metrics.record_message_rejected("rate_limited");
            return Err(Exit::Close(CloseReason::new(
                close_code::RATE_LIMITED,
                "rate limit exceeded",
            )));
        }

        let raw = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    self.violation("二进制消息必须是UTF-8编码的JSON").await?;
                    return Ok(None);
                }
            },
            _ => return Ok(None),
        };

        match Envelope::decode(&raw) {
            Ok(envelope) if envelope.message.is_server_only() => {
                self.violation(format!(
                    "{} 消息只能由服务端发送",
                    envelope.message.type_name()
                ))
                .await?;
                Ok(None)
            }
            Ok(envelope) => {
                trace!(
                    connection_id = self.connection_id,
                    message_type = envelope.message.type_name(),
                    "收到消息"
                );
                Ok(Some(envelope.message))
            }
            Err(e) => {
                self.violation(e.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn handle(&mut self, agent_id: &str, message: ChannelMessage) -> Result<(), Exit> {
        match message {
            ChannelMessage::Heartbeat {} => {
                self.touch(agent_id).await;
                self.send(ChannelMessage::HeartbeatAck {}).await
            }
            ChannelMessage::HeartbeatAck {} => {
                self.touch(agent_id).await;
                Ok(())
            }
            ChannelMessage::Ack { command_id } => {
                let outcome = self.ctx.outcomes.on_command_ack(agent_id, &command_id).await;
                self.report(command_id, outcome).await
            }
            ChannelMessage::Result { command_id, result } => {
                let outcome = self
                    .ctx
                    .outcomes
                    .on_command_result(agent_id, &command_id, result)
                    .await;
                self.report(command_id, outcome).await
            }
            ChannelMessage::Error {
                command_id: Some(command_id),
                code,
                message,
            } => {
                let outcome = self
                    .ctx
                    .outcomes
                    .on_command_error(agent_id, &command_id, &code, &message)
                    .await;
                self.report(command_id, outcome).await
            }
            ChannelMessage::Error {
                command_id: None,
                code,
                message,
            } => {
                warn!(agent_id = %agent_id, code = %code, "Agent报告错误: {}", message);
                if let Err(e) = self.ctx.directory.mark_error(agent_id).await {
                    warn!(agent_id = %agent_id, "标记Agent错误状态失败: {}", e);
                }
                Ok(())
            }
            ChannelMessage::Log {
                level,
                message,
                metadata,
            } => {
                self.record_log(agent_id, level, message, metadata).await;
                Ok(())
            }
            ChannelMessage::Auth { .. } => self.violation("连接已经完成认证").await,
            other => {
                self.violation(format!("不支持的消息类型: {}", other.type_name()))
                    .await
            }
        }
    }

    /// 命令结果处理失败时回复带commandId的错误, 连接保持
    async fn report(&mut self, command_id: String, outcome: FleetResult<()>) -> Result<(), Exit> {
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(
                    connection_id = self.connection_id,
                    command_id = %command_id,
                    "处理命令消息失败: {}",
                    e
                );
                self.send(ChannelMessage::Error {
                    command_id: Some(command_id),
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
                .await
            }
        }
    }

    async fn record_log(
        &self,
        agent_id: &str,
        level: String,
        message: String,
        metadata: Option<Value>,
    ) {
        match level.as_str() {
            "error" => error!(agent_id = %agent_id, metadata = ?metadata, "[agent] {}", message),
            "warn" => warn!(agent_id = %agent_id, metadata = ?metadata, "[agent] {}", message),
            "info" => info!(agent_id = %agent_id, metadata = ?metadata, "[agent] {}", message),
            "debug" => debug!(agent_id = %agent_id, metadata = ?metadata, "[agent] {}", message),
            _ => trace!(agent_id = %agent_id, metadata = ?metadata, "[agent] {}", message),
        }

        let log = NewAgentLog {
            agent_id: agent_id.to_string(),
            level,
            message,
            metadata,
        };
        if let Err(e) = self.ctx.logs.insert(&log).await {
            warn!(agent_id = %agent_id, "保存Agent日志失败: {}", e);
        }
    }

    async fn touch(&self, agent_id: &str) {
        if let Err(e) = self
            .ctx
            .directory
            .touch_heartbeat(agent_id, self.peer.as_deref())
            .await
        {
            warn!(agent_id = %agent_id, "更新心跳失败: {}", e);
        }
    }

    async fn violation(&mut self, reason: impl Into<String>) -> Result<(), Exit> {
        let reason = reason.into();
        self.violations += 1;
        self.ctx.metrics.record_message_rejected("invalid");
        debug!(
            connection_id = self.connection_id,
            violations = self.violations,
            "拒绝无效消息: {}",
            reason
        );

        self.send(ChannelMessage::validation_error(reason)).await?;
        if self.violations >= self.ctx.config.max_violations {
            warn!(
                connection_id = self.connection_id,
                "无效消息达到{}次, 关闭连接",
                self.violations
            );
            return Err(Exit::Close(CloseReason::new(
                close_code::POLICY_VIOLATION,
                "too many invalid messages",
            )));
        }
        Ok(())
    }

    async fn reject_auth(&mut self, e: FleetError) -> Exit {
        let _ = self
            .send(ChannelMessage::Error {
                command_id: None,
                code: e.code().to_string(),
                message: e.to_string(),
            })
            .await;
        Exit::Close(CloseReason::new(
            close_code::AUTH_FAILED,
            "authentication failed",
        ))
    }

    async fn send(&mut self, message: ChannelMessage) -> Result<(), Exit> {
        let text = Envelope::now(message).encode().map_err(|e| {
            error!(connection_id = self.connection_id, "编码消息失败: {}", e);
            internal_error()
        })?;
        self.outgoing.send(Frame::Text(text)).await.map_err(|e| {
            debug!(connection_id = self.connection_id, "发送失败: {}", e);
            Exit::Ended(ABNORMAL)
        })
    }

    async fn finish(mut self, exit: Exit) -> SessionEnd {
        let close_code = match exit {
            Exit::Close(reason) => {
                let code = reason.code;
                let _ = self.outgoing.send(Frame::Close(Some(reason))).await;
                let _ = self.outgoing.close().await;
                code
            }
            Exit::Ended(code) => code,
        };
        self.ctx.metrics.record_connection_closed(close_code);

        let agent_id = match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Authenticated { agent_id } => {
                // 被新连接取代时不改变Agent状态
                if self
                    .ctx
                    .registry
                    .detach(&agent_id, self.connection_id)
                    .await
                {
                    if let Err(e) = self.ctx.directory.mark_offline(&agent_id).await {
                        warn!(agent_id = %agent_id, "标记Agent离线失败: {}", e);
                    }
                }
                Some(agent_id)
            }
            SessionState::AwaitingAuth | SessionState::Closed => None,
        };

        info!(
            connection_id = self.connection_id,
            agent_id = ?agent_id,
            close_code,
            "连接已关闭"
        );
        SessionEnd {
            connection_id: self.connection_id,
            agent_id,
            close_code,
        }
    }
}

fn internal_error() -> Exit {
    Exit::Close(CloseReason::new(close_code::INTERNAL_ERROR, "internal error"))
}
