//! 控制通道客户端
//!
//! 先认证再服务: [`authenticate`] 建立连接并等待 `auth_ok`, 返回的
//! [`AuthenticatedChannel`] 负责应答心跳、确认并执行命令。

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use fleet_core::shutdown::wait_for_shutdown;
use fleet_core::{ChannelMessage, Envelope};

use crate::error::{AgentError, AgentResult};
use crate::executors::ExecutorRegistry;

type ChannelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const REPLY_BUFFER: usize = 64;

/// 会话结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// 服务端关闭或连接中断, 附带关闭码
    Closed { code: Option<u16> },
    /// 本地关闭
    Shutdown,
}

pub struct AuthenticatedChannel {
    pub agent_id: String,
    pub heartbeat_interval_secs: u64,
    stream: ChannelStream,
}

/// 连接并认证; 服务端拒绝令牌时返回 [`AgentError::AuthRejected`]
pub async fn authenticate(
    url: &str,
    token: &str,
    auth_timeout: Duration,
) -> AgentResult<AuthenticatedChannel> {
    let (mut stream, _) = connect_async(url).await?;
    send(
        &mut stream,
        ChannelMessage::Auth {
            token: token.to_string(),
        },
    )
    .await?;

    let waiting = async {
        loop {
            let message = match stream.next().await {
                Some(Ok(Message::Text(text))) => Envelope::decode(text.as_str())?.message,
                Some(Ok(Message::Close(frame))) => {
                    return Err(AgentError::AuthRejected {
                        code: frame
                            .as_ref()
                            .map(|f| u16::from(f.code).to_string())
                            .unwrap_or_default(),
                        message: frame
                            .map(|f| f.reason.as_str().to_string())
                            .unwrap_or_else(|| "连接在认证完成前关闭".to_string()),
                    })
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(AgentError::Protocol("连接在认证完成前关闭".to_string())),
            };

            match message {
                ChannelMessage::AuthOk {
                    agent_id,
                    heartbeat_interval_secs,
                } => return Ok((agent_id, heartbeat_interval_secs)),
                ChannelMessage::Error { code, message, .. } if code == "AUTH_FAILED" => {
                    return Err(AgentError::AuthRejected { code, message })
                }
                other => warn!("认证完成前收到 {} 消息, 忽略", other.type_name()),
            }
        }
    };

    let (agent_id, heartbeat_interval_secs) = tokio::time::timeout(auth_timeout, waiting)
        .await
        .map_err(|_| AgentError::Protocol("等待auth_ok超时".to_string()))??;

    info!(agent_id = %agent_id, "控制通道认证成功");
    Ok(AuthenticatedChannel {
        agent_id,
        heartbeat_interval_secs,
        stream,
    })
}

impl AuthenticatedChannel {
    /// 处理服务端消息直到连接关闭或收到关闭信号
    pub async fn serve(
        self,
        executors: Arc<ExecutorRegistry>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AgentResult<SessionOutcome> {
        let agent_id = self.agent_id;
        let (mut sink, mut stream) = self.stream.split();
        let (reply_tx, mut reply_rx) = mpsc::channel::<ChannelMessage>(REPLY_BUFFER);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => {
                    info!(agent_id = %agent_id, "收到关闭信号, 断开控制通道");
                    let _ = sink.close().await;
                    return Ok(SessionOutcome::Shutdown);
                }
                Some(reply) = reply_rx.recv() => {
                    sink.send(encode(reply)?).await?;
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code));
                            info!(agent_id = %agent_id, ?code, "服务端关闭了控制通道");
                            return Ok(SessionOutcome::Closed { code });
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(SessionOutcome::Closed { code: None }),
                    };

                    let message = match Envelope::decode(text.as_str()) {
                        Ok(envelope) => envelope.message,
                        Err(e) => {
                            warn!("无法解析服务端消息: {}", e);
                            continue;
                        }
                    };

                    match message {
                        ChannelMessage::Heartbeat {} => {
                            sink.send(encode(ChannelMessage::HeartbeatAck {})?).await?;
                        }
                        ChannelMessage::Command { command_id, command_type, parameters } => {
                            debug!(command_id = %command_id, command_type = %command_type, "收到命令");
                            sink.send(encode(ChannelMessage::Ack { command_id: command_id.clone() })?).await?;

                            let executors = executors.clone();
                            let reply_tx = reply_tx.clone();
                            tokio::spawn(async move {
                                let reply = match executors.execute(&command_type, &parameters).await {
                                    Ok(result) => ChannelMessage::Result { command_id, result },
                                    Err(e) => {
                                        warn!(command_id = %command_id, "命令执行失败: {}", e);
                                        ChannelMessage::Error {
                                            command_id: Some(command_id),
                                            code: e.code,
                                            message: e.message,
                                        }
                                    }
                                };
                                let _ = reply_tx.send(reply).await;
                            });
                        }
                        ChannelMessage::Error { command_id, code, message } => {
                            warn!(?command_id, code = %code, "服务端返回错误: {}", message);
                        }
                        ChannelMessage::HeartbeatAck {} => {}
                        other => debug!("忽略 {} 消息", other.type_name()),
                    }
                }
            }
        }
    }
}

fn encode(message: ChannelMessage) -> AgentResult<Message> {
    Ok(Message::Text(Envelope::now(message).encode()?.into()))
}

async fn send(stream: &mut ChannelStream, message: ChannelMessage) -> AgentResult<()> {
    stream.send(encode(message)?).await?;
    Ok(())
}
