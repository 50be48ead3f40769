use async_trait::async_trait;
use serde_json::Value;

use crate::errors::FleetResult;
use crate::protocol::ChannelMessage;

/// 向已认证连接投递消息
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// 目标Agent当前是否持有已认证连接
    async fn is_connected(&self, agent_id: &str) -> bool;

    /// 放入连接的发送队列, 不代表对端已收到
    async fn send(&self, agent_id: &str, message: ChannelMessage) -> FleetResult<()>;
}

/// 控制通道观察到的命令结果回调
#[async_trait]
pub trait CommandOutcomeHandler: Send + Sync {
    async fn on_command_ack(&self, agent_id: &str, command_id: &str) -> FleetResult<()>;

    async fn on_command_result(
        &self,
        agent_id: &str,
        command_id: &str,
        result: Value,
    ) -> FleetResult<()>;

    async fn on_command_error(
        &self,
        agent_id: &str,
        command_id: &str,
        code: &str,
        message: &str,
    ) -> FleetResult<()>;
}
