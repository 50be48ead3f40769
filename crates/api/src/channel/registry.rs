//! 已认证连接表
//!
//! 每个Agent最多登记一个连接。新连接登记时替换旧连接, 旧连接通过关闭通知
//! 收到4009并自行退出; 退出时只有仍然登记在册的连接才会把Agent标记为离线。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use fleet_core::limits::close_code;
use fleet_core::traits::CommandSender;
use fleet_core::{ChannelMessage, FleetError, FleetResult};
use fleet_infrastructure::MetricsCollector;

use super::frame::CloseReason;

struct ConnectionHandle {
    connection_id: u64,
    outbound: mpsc::Sender<ChannelMessage>,
    close: Option<oneshot::Sender<CloseReason>>,
}

impl ConnectionHandle {
    fn kick(&mut self, reason: CloseReason) {
        if let Some(close) = self.close.take() {
            let _ = close.send(reason);
        }
    }
}

/// 登记成功后会话持有的接收端
pub struct Attachment {
    pub outbound: mpsc::Receiver<ChannelMessage>,
    pub close: oneshot::Receiver<CloseReason>,
}

pub struct ConnectionRegistry {
    buffer: usize,
    next_id: AtomicU64,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    metrics: Arc<MetricsCollector>,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 登记连接, 替换该Agent的旧连接
    pub async fn attach(&self, agent_id: &str, connection_id: u64) -> Attachment {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.buffer);
        let (close_tx, close_rx) = oneshot::channel();

        let mut connections = self.connections.write().await;
        let previous = connections.insert(
            agent_id.to_string(),
            ConnectionHandle {
                connection_id,
                outbound: outbound_tx,
                close: Some(close_tx),
            },
        );
        if let Some(mut previous) = previous {
            info!(
                agent_id = %agent_id,
                connection_id = previous.connection_id,
                "连接被新连接 {} 取代",
                connection_id
            );
            previous.kick(CloseReason::new(
                close_code::SUPERSEDED,
                "superseded by a newer connection",
            ));
        }
        self.metrics.update_connected_agents(connections.len() as f64);

        Attachment {
            outbound: outbound_rx,
            close: close_rx,
        }
    }

    /// 注销连接; 已被取代时返回false
    pub async fn detach(&self, agent_id: &str, connection_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        let owned = connections
            .get(agent_id)
            .is_some_and(|handle| handle.connection_id == connection_id);
        if owned {
            connections.remove(agent_id);
        }
        self.metrics.update_connected_agents(connections.len() as f64);
        owned
    }

    /// 要求当前连接以指定关闭码退出, 连接在退出时自行注销
    pub async fn disconnect(&self, agent_id: &str, reason: CloseReason) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(agent_id) {
            Some(handle) => {
                debug!(agent_id = %agent_id, code = reason.code, "请求断开连接");
                handle.kick(reason);
                true
            }
            None => false,
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connected_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.connections.read().await.keys().cloned().collect();
        agents.sort();
        agents
    }
}

#[async_trait]
impl CommandSender for ConnectionRegistry {
    async fn is_connected(&self, agent_id: &str) -> bool {
        self.connections.read().await.contains_key(agent_id)
    }

    async fn send(&self, agent_id: &str, message: ChannelMessage) -> FleetResult<()> {
        let connections = self.connections.read().await;
        let handle = connections
            .get(agent_id)
            .ok_or_else(|| FleetError::AgentNotConnected {
                id: agent_id.to_string(),
            })?;

        handle.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(agent_id = %agent_id, "发送缓冲已满");
                FleetError::AgentUnavailable {
                    reason: format!("Agent {agent_id} 发送缓冲已满"),
                }
            }
            mpsc::error::TrySendError::Closed(_) => FleetError::AgentNotConnected {
                id: agent_id.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(buffer: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(buffer, Arc::new(MetricsCollector::new()))
    }

    #[tokio::test]
    async fn test_send_reaches_attached_connection() {
        let registry = registry(4);
        let mut attachment = registry.attach("agent-1", 1).await;

        assert!(registry.is_connected("agent-1").await);
        registry
            .send("agent-1", ChannelMessage::Heartbeat {})
            .await
            .unwrap();
        assert_eq!(
            attachment.outbound.recv().await,
            Some(ChannelMessage::Heartbeat {})
        );

        let err = registry
            .send("agent-2", ChannelMessage::Heartbeat {})
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::AgentNotConnected { .. }));
    }

    #[tokio::test]
    async fn test_full_buffer_is_reported() {
        let registry = registry(1);
        let _attachment = registry.attach("agent-1", 1).await;

        registry
            .send("agent-1", ChannelMessage::Heartbeat {})
            .await
            .unwrap();
        let err = registry
            .send("agent-1", ChannelMessage::Heartbeat {})
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::AgentUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_newer_connection_supersedes() {
        let registry = registry(4);
        let first = registry.attach("agent-1", 1).await;
        let _second = registry.attach("agent-1", 2).await;

        let reason = first.close.await.unwrap();
        assert_eq!(reason.code, close_code::SUPERSEDED);

        // 被取代的连接注销不会影响新连接
        assert!(!registry.detach("agent-1", 1).await);
        assert!(registry.is_connected("agent-1").await);
        assert!(registry.detach("agent-1", 2).await);
        assert_eq!(registry.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_registration_until_detach() {
        let registry = registry(4);
        let attachment = registry.attach("agent-1", 7).await;

        assert!(
            registry
                .disconnect("agent-1", CloseReason::new(close_code::AUTH_FAILED, "revoked"))
                .await
        );
        assert_eq!(attachment.close.await.unwrap().code, close_code::AUTH_FAILED);
        assert_eq!(registry.connected_agents().await, vec!["agent-1".to_string()]);
        assert!(registry.detach("agent-1", 7).await);
        assert!(!registry.disconnect("agent-1", CloseReason::new(1000, "")).await);
    }
}
