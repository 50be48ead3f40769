use serde::Deserialize;
use tracing::{error, info};

use fleet_core::models::{AgentRegistration, DeviceMetadata, RegistrationOutcome};

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

/// 控制平面REST客户端
pub struct ControlPlaneClient {
    http_client: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }

    /// 注册设备, 同一所有者重复注册会拿到原有令牌
    pub async fn register(
        &self,
        config: &AgentConfig,
        capabilities: Vec<String>,
    ) -> AgentResult<RegistrationOutcome> {
        let registration = AgentRegistration {
            device_id: config.device_id.clone(),
            owner_id: config.owner_id.clone(),
            capabilities,
            metadata: DeviceMetadata {
                platform: std::env::consts::OS.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                hostname: hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            },
            max_concurrent_commands: config.max_concurrent_commands,
        };

        let response = self
            .http_client
            .post(config.register_url())
            .json(&registration)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("注册失败: HTTP {} - {}", status, body);
            return Err(AgentError::Registration {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope<RegistrationOutcome> = response.json().await?;
        let outcome = envelope
            .data
            .ok_or_else(|| AgentError::Protocol("注册响应缺少data字段".to_string()))?;
        info!(
            agent_id = %outcome.agent_id,
            existing = outcome.existing,
            "设备 {} 注册成功",
            config.device_id
        );
        Ok(outcome)
    }
}

impl Default for ControlPlaneClient {
    fn default() -> Self {
        Self::new()
    }
}
