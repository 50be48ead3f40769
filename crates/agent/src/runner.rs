use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use fleet_core::limits::close_code;
use fleet_core::shutdown::wait_for_shutdown;

use crate::channel::{authenticate, SessionOutcome};
use crate::client::ControlPlaneClient;
use crate::config::{AgentConfig, ReconnectBackoff};
use crate::error::{AgentError, AgentResult};
use crate::executors::ExecutorRegistry;

/// Agent主循环: 注册、连接、服务, 断线后按退避重连
pub struct AgentRunner {
    config: AgentConfig,
    executors: Arc<ExecutorRegistry>,
    client: ControlPlaneClient,
}

impl AgentRunner {
    pub fn new(config: AgentConfig) -> Self {
        let executors = ExecutorRegistry::with_defaults(config.shell_enabled);
        Self {
            config,
            executors: Arc::new(executors),
            client: ControlPlaneClient::new(),
        }
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Arc::new(executors);
        self
    }

    /// 声明的能力加上所有可执行的命令类型
    pub fn capabilities(&self) -> Vec<String> {
        let mut capabilities = self.config.capabilities.clone();
        capabilities.extend(self.executors.supported_types());
        capabilities.sort();
        capabilities.dedup();
        capabilities
    }

    /// 运行直到收到关闭信号; 只有无法通过重试恢复的注册错误才返回Err
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        self.config.validate()?;
        let mut backoff = ReconnectBackoff::new(self.config.reconnect_base, self.config.reconnect_max);
        let mut token: Option<String> = None;

        info!(
            device_id = %self.config.device_id,
            server = %self.config.server_url,
            "Agent启动, 支持的命令: {:?}",
            self.executors.supported_types()
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect_once(&mut token, &mut backoff, &mut shutdown).await {
                Ok(SessionOutcome::Shutdown) => return Ok(()),
                Ok(SessionOutcome::Closed { code }) => {
                    warn!(?code, "控制通道已断开");
                    // 令牌被吊销, 重新注册获取新令牌
                    if code == Some(close_code::AUTH_FAILED) {
                        token = None;
                    }
                }
                Err(AgentError::AuthRejected { code, message }) => {
                    warn!(code = %code, "认证被拒绝, 将重新注册: {}", message);
                    token = None;
                }
                Err(AgentError::Registration { status, body }) if (400..500).contains(&status) => {
                    error!("注册被拒绝, 停止重试: HTTP {} - {}", status, body);
                    return Err(AgentError::Registration { status, body });
                }
                Err(e) => warn!("连接失败: {}", e),
            }

            let delay = backoff.next_delay();
            info!("{}ms后重连", delay.as_millis());
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_once(
        &self,
        token: &mut Option<String>,
        backoff: &mut ReconnectBackoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AgentResult<SessionOutcome> {
        let current = match token.as_ref() {
            Some(token) => token.clone(),
            None => {
                let outcome = self.client.register(&self.config, self.capabilities()).await?;
                *token = Some(outcome.token.clone());
                outcome.token
            }
        };

        let channel = authenticate(&self.config.channel_url(), &current, self.config.auth_timeout).await?;
        backoff.reset();
        channel.serve(self.executors.clone(), shutdown).await
    }
}
