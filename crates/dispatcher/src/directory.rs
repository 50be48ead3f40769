//! Agent目录
//!
//! 维护Agent的身份、令牌、存活状态和负载计数。所有状态变化都经过
//! `AgentStatus::can_transition_to` 校验, 并以条件更新写入仓储;
//! 成功的变化会在广播通道上发布 `AgentEvent`。

use std::sync::Arc;

use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fleet_core::models::{
    Agent, AgentEvent, AgentRegistration, AgentStatus, RegistrationOutcome, SlotRelease,
};
use fleet_core::traits::AgentRepository;
use fleet_core::{AuthError, FleetError, FleetResult};

const TOKEN_LENGTH: usize = 48;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const TRANSITION_ATTEMPTS: usize = 5;

pub struct AgentDirectory {
    repo: Arc<dyn AgentRepository>,
    events: broadcast::Sender<AgentEvent>,
    default_max_load: i32,
}

fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

impl AgentDirectory {
    pub fn new(repo: Arc<dyn AgentRepository>, default_max_load: i32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            repo,
            events,
            default_max_load,
        }
    }

    /// 订阅状态事件; 丢弃接收端即取消订阅
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AgentEvent) {
        // 没有订阅者时发送失败是正常情况
        let _ = self.events.send(event);
    }

    /// 注册设备。同一所有者重复注册返回已有令牌, 其他所有者占用时报DuplicateIdentity
    pub async fn register(&self, registration: AgentRegistration) -> FleetResult<RegistrationOutcome> {
        if registration.device_id.trim().is_empty() {
            return Err(FleetError::Validation("device_id不能为空".to_string()));
        }
        if registration.owner_id.trim().is_empty() {
            return Err(FleetError::Validation("owner_id不能为空".to_string()));
        }

        if let Some(existing) = self.repo.find_active_by_device(&registration.device_id).await? {
            return self.reregister(existing, registration).await;
        }

        let agent = Agent::new(registration, generate_token(), self.default_max_load);
        if let Err(e) = self.repo.insert(&agent).await {
            // 并发注册同一设备时唯一索引冲突, 以已写入的记录为准
            if let Some(existing) = self.repo.find_active_by_device(&agent.device_id).await? {
                let registration = AgentRegistration {
                    device_id: agent.device_id.clone(),
                    owner_id: agent.owner_id.clone(),
                    capabilities: agent.capabilities.clone(),
                    metadata: agent.metadata.clone(),
                    max_concurrent_commands: Some(agent.max_load),
                };
                return self.reregister(existing, registration).await;
            }
            return Err(e);
        }

        info!(
            agent_id = %agent.id,
            device_id = %agent.device_id,
            "新Agent注册成功"
        );
        self.emit(AgentEvent::Registered {
            agent_id: agent.id.clone(),
        });
        Ok(RegistrationOutcome {
            agent_id: agent.id,
            token: agent.token,
            existing: false,
        })
    }

    async fn reregister(
        &self,
        mut existing: Agent,
        registration: AgentRegistration,
    ) -> FleetResult<RegistrationOutcome> {
        if existing.owner_id != registration.owner_id {
            return Err(FleetError::DuplicateIdentity {
                device_id: registration.device_id,
            });
        }

        existing.capabilities = registration.capabilities;
        existing.metadata = registration.metadata;
        if let Some(max_load) = registration.max_concurrent_commands.filter(|max| *max > 0) {
            existing.max_load = max_load;
        }
        self.repo.update_profile(&existing).await?;

        debug!("设备 {} 重复注册, 返回已有令牌", existing.device_id);
        Ok(RegistrationOutcome {
            agent_id: existing.id,
            token: existing.token,
            existing: true,
        })
    }

    /// 按令牌认证
    pub async fn authenticate(&self, token: &str) -> FleetResult<Agent> {
        let agent = self
            .repo
            .find_by_token(token)
            .await?
            .ok_or(AuthError::UnknownToken)?;
        if !agent.is_active() {
            return Err(AuthError::RevokedToken.into());
        }
        Ok(agent)
    }

    pub async fn get(&self, agent_id: &str) -> FleetResult<Agent> {
        self.repo
            .get(agent_id)
            .await?
            .ok_or_else(|| FleetError::AgentNotFound {
                id: agent_id.to_string(),
            })
    }

    pub async fn list(&self, owner_id: Option<&str>) -> FleetResult<Vec<Agent>> {
        self.repo.list(owner_id).await
    }

    /// 当前可以接收新任务的Agent
    pub async fn dispatchable_agents(&self) -> FleetResult<Vec<Agent>> {
        Ok(self
            .repo
            .list(None)
            .await?
            .into_iter()
            .filter(|agent| {
                agent.status == AgentStatus::Online && agent.is_active() && agent.has_capacity()
            })
            .collect())
    }

    /// 单步状态转换; 已处于目标状态时返回None
    async fn transition(
        &self,
        agent_id: &str,
        target: AgentStatus,
    ) -> FleetResult<Option<AgentStatus>> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let agent = self.get(agent_id).await?;
            if agent.status == target {
                return Ok(None);
            }
            if !agent.status.can_transition_to(target) {
                return Err(FleetError::invalid_transition("agent", agent.status, target));
            }
            if self
                .repo
                .compare_and_set_status(agent_id, agent.status, target)
                .await?
            {
                debug!("Agent {} 状态变更: {} -> {}", agent_id, agent.status, target);
                self.emit(AgentEvent::StatusChanged {
                    agent_id: agent_id.to_string(),
                    from: agent.status,
                    to: target,
                });
                return Ok(Some(agent.status));
            }
        }

        Err(FleetError::DatabaseOperation(format!(
            "Agent {agent_id} 状态并发冲突, 放弃转换到 {target}"
        )))
    }

    /// 认证成功后调用; 已经在线或繁忙时保持不变
    pub async fn mark_online(&self, agent_id: &str) -> FleetResult<()> {
        let agent = self.get(agent_id).await?;
        match agent.status {
            AgentStatus::Online | AgentStatus::Busy => Ok(()),
            AgentStatus::Error => {
                self.transition(agent_id, AgentStatus::Offline).await?;
                self.transition(agent_id, AgentStatus::Online).await.map(|_| ())
            }
            AgentStatus::Offline => self.transition(agent_id, AgentStatus::Online).await.map(|_| ()),
        }
    }

    /// 连接断开时调用; busy先回到online再离线
    pub async fn mark_offline(&self, agent_id: &str) -> FleetResult<()> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let agent = self.get(agent_id).await?;
            let step = match agent.status {
                AgentStatus::Offline => return Ok(()),
                AgentStatus::Busy => AgentStatus::Online,
                AgentStatus::Online | AgentStatus::Error => AgentStatus::Offline,
            };
            match self.transition(agent_id, step).await {
                Ok(_) => {}
                // 状态在读取后被并发修改, 重新读取
                Err(FleetError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        let agent = self.get(agent_id).await?;
        if agent.status == AgentStatus::Offline {
            Ok(())
        } else {
            warn!("Agent {} 未能离线, 当前状态: {}", agent_id, agent.status);
            Err(FleetError::invalid_transition(
                "agent",
                agent.status,
                AgentStatus::Offline,
            ))
        }
    }

    pub async fn mark_error(&self, agent_id: &str) -> FleetResult<()> {
        self.transition(agent_id, AgentStatus::Error).await.map(|_| ())
    }

    pub async fn touch_heartbeat(&self, agent_id: &str, address: Option<&str>) -> FleetResult<()> {
        self.repo.touch_heartbeat(agent_id, Utc::now(), address).await
    }

    /// 占用一个负载槽位; 满载时Agent变为busy
    pub async fn try_acquire_slot(&self, agent_id: &str) -> FleetResult<Option<Agent>> {
        let acquired = self.repo.try_acquire_slot(agent_id).await?;
        if let Some(agent) = &acquired {
            if agent.status == AgentStatus::Busy {
                self.emit(AgentEvent::StatusChanged {
                    agent_id: agent_id.to_string(),
                    from: AgentStatus::Online,
                    to: AgentStatus::Busy,
                });
            }
        }
        Ok(acquired)
    }

    /// 释放槽位并更新生命周期计数; 每个命令只能由赢得终态的一方调用一次
    pub async fn release_slot(
        &self,
        agent_id: &str,
        release: SlotRelease,
    ) -> FleetResult<Option<Agent>> {
        let before = self.repo.get(agent_id).await?.map(|agent| agent.status);
        let released = self.repo.release_slot(agent_id, release).await?;
        if let Some(agent) = &released {
            if before == Some(AgentStatus::Busy) && agent.status == AgentStatus::Online {
                self.emit(AgentEvent::StatusChanged {
                    agent_id: agent_id.to_string(),
                    from: AgentStatus::Busy,
                    to: AgentStatus::Online,
                });
            }
        }
        Ok(released)
    }

    /// 按所有者软删除并吊销令牌
    pub async fn delete(&self, agent_id: &str, owner_id: &str) -> FleetResult<Agent> {
        let agent = self.get(agent_id).await?;
        if !agent.is_active() {
            return Err(FleetError::AgentNotFound {
                id: agent_id.to_string(),
            });
        }
        if agent.owner_id != owner_id {
            return Err(FleetError::Forbidden(format!(
                "Agent {agent_id} 不属于 {owner_id}"
            )));
        }
        if !self.repo.soft_delete(agent_id, Utc::now()).await? {
            return Err(FleetError::AgentNotFound {
                id: agent_id.to_string(),
            });
        }

        info!(agent_id = %agent_id, "Agent已删除, 令牌已吊销");
        self.emit(AgentEvent::Revoked {
            agent_id: agent_id.to_string(),
        });
        self.get(agent_id).await
    }

    /// 启动时重置所有Agent的存活状态
    pub async fn reset_liveness(&self) -> FleetResult<u64> {
        self.repo.reset_liveness().await
    }
}
