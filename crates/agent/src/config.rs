use std::time::Duration;

use rand::Rng;

use crate::error::{AgentError, AgentResult};

/// Agent运行配置
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 控制平面HTTP地址, 例如 `http://127.0.0.1:8080`
    pub server_url: String,
    pub device_id: String,
    pub owner_id: String,
    pub capabilities: Vec<String>,
    pub max_concurrent_commands: Option<i32>,
    pub shell_enabled: bool,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub auth_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            device_id: default_device_id(),
            owner_id: "default".to_string(),
            capabilities: Vec::new(),
            max_concurrent_commands: None,
            shell_enabled: true,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> AgentResult<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(AgentError::Configuration(format!(
                "服务地址必须以http://或https://开头: {}",
                self.server_url
            )));
        }
        if self.device_id.trim().is_empty() {
            return Err(AgentError::Configuration("设备ID不能为空".to_string()));
        }
        if self.owner_id.trim().is_empty() {
            return Err(AgentError::Configuration("所有者ID不能为空".to_string()));
        }
        if self.reconnect_base.is_zero() || self.reconnect_base > self.reconnect_max {
            return Err(AgentError::Configuration(
                "重连间隔必须大于0且不超过上限".to_string(),
            ));
        }
        Ok(())
    }

    fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    pub fn register_url(&self) -> String {
        format!("{}/api/agents/register", self.base_url())
    }

    /// 控制通道地址, http(s) 对应 ws(s)
    pub fn channel_url(&self) -> String {
        let base = self.base_url();
        let ws_base = match base.strip_prefix("https://") {
            Some(rest) => format!("wss://{rest}"),
            None => format!("ws://{}", base.trim_start_matches("http://")),
        };
        format!("{ws_base}/ws")
    }
}

fn default_device_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-device".to_string())
}

/// 重连退避: `min(base * 2^attempt, max)` 加上不超过10%的随机抖动
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// 不含抖动的下一次等待时间
    pub fn current(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
