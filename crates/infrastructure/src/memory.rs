//! 内存仓储实现, 语义与SQLite实现一致, 用于测试和 `database.backend = "memory"`

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::models::{
    Agent, AgentLog, AgentStatus, Command, CommandStatus, NewAgentLog, Schedule, ScheduleStatus,
    SlotRelease,
};
use fleet_core::traits::{
    AgentLogRepository, AgentRepository, CommandRepository, ScheduleRepository,
};
use fleet_core::{FleetError, FleetResult};
use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryAgentRepository {
    agents: RwLock<HashMap<String, Agent>>,
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn insert(&self, agent: &Agent) -> FleetResult<()> {
        let mut agents = self.agents.write().await;
        let conflict = agents.values().any(|existing| {
            existing.id == agent.id
                || existing.token == agent.token
                || (existing.device_id == agent.device_id && existing.deleted_at.is_none())
        });
        if conflict {
            return Err(FleetError::DatabaseOperation(format!(
                "违反唯一约束: {}",
                agent.id
            )));
        }
        agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Agent>> {
        Ok(self.agents.read().await.get(id).cloned())
    }

    async fn find_by_token(&self, token: &str) -> FleetResult<Option<Agent>> {
        let agents = self.agents.read().await;
        Ok(agents.values().find(|a| a.token == token).cloned())
    }

    async fn find_active_by_device(&self, device_id: &str) -> FleetResult<Option<Agent>> {
        let agents = self.agents.read().await;
        Ok(agents
            .values()
            .find(|a| a.device_id == device_id && a.deleted_at.is_none())
            .cloned())
    }

    async fn list(&self, owner_id: Option<&str>) -> FleetResult<Vec<Agent>> {
        let agents = self.agents.read().await;
        let mut result: Vec<Agent> = agents
            .values()
            .filter(|a| a.deleted_at.is_none())
            .filter(|a| owner_id.map_or(true, |owner| a.owner_id == owner))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(result)
    }

    async fn update_profile(&self, agent: &Agent) -> FleetResult<()> {
        if let Some(stored) = self.agents.write().await.get_mut(&agent.id) {
            stored.capabilities = agent.capabilities.clone();
            stored.metadata = agent.metadata.clone();
            stored.max_load = agent.max_load;
            stored.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        from: AgentStatus,
        to: AgentStatus,
    ) -> FleetResult<bool> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(id) {
            Some(agent) if agent.status == from => {
                agent.status = to;
                agent.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_heartbeat(
        &self,
        id: &str,
        at: DateTime<Utc>,
        address: Option<&str>,
    ) -> FleetResult<()> {
        if let Some(agent) = self.agents.write().await.get_mut(id) {
            agent.last_heartbeat = Some(at);
            if let Some(address) = address {
                agent.last_address = Some(address.to_string());
            }
            agent.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn try_acquire_slot(&self, id: &str) -> FleetResult<Option<Agent>> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(id) {
            Some(agent)
                if agent.status == AgentStatus::Online
                    && agent.has_capacity()
                    && agent.is_active() =>
            {
                agent.current_load += 1;
                if agent.current_load >= agent.max_load {
                    agent.status = AgentStatus::Busy;
                }
                agent.updated_at = Utc::now();
                Ok(Some(agent.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_slot(&self, id: &str, release: SlotRelease) -> FleetResult<Option<Agent>> {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(id) else {
            return Ok(None);
        };
        agent.current_load = (agent.current_load - 1).max(0);
        if agent.status == AgentStatus::Busy {
            agent.status = AgentStatus::Online;
        }
        match release {
            SlotRelease::Completed { response_ms } => agent.record_completion(response_ms),
            SlotRelease::Failed => agent.failed_count += 1,
        }
        agent.updated_at = Utc::now();
        Ok(Some(agent.clone()))
    }

    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> FleetResult<bool> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(id) {
            Some(agent) if agent.deleted_at.is_none() => {
                agent.revoked = true;
                agent.deleted_at = Some(at);
                agent.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_liveness(&self) -> FleetResult<u64> {
        let mut agents = self.agents.write().await;
        let mut changed = 0;
        for agent in agents.values_mut() {
            if agent.status != AgentStatus::Offline || agent.current_load != 0 {
                agent.status = AgentStatus::Offline;
                agent.current_load = 0;
                agent.updated_at = Utc::now();
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[derive(Default)]
pub struct InMemoryCommandRepository {
    commands: RwLock<HashMap<String, Command>>,
}

impl InMemoryCommandRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition(
        &self,
        id: &str,
        target: CommandStatus,
        apply: impl FnOnce(&mut Command) + Send,
    ) -> FleetResult<bool> {
        let mut commands = self.commands.write().await;
        match commands.get_mut(id) {
            Some(command) if command.status.can_transition_to(target) => {
                apply(command);
                command.status = target;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CommandRepository for InMemoryCommandRepository {
    async fn insert(&self, command: &Command) -> FleetResult<()> {
        self.commands
            .write()
            .await
            .insert(command.id.clone(), command.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Command>> {
        Ok(self.commands.read().await.get(id).cloned())
    }

    async fn list_by_agent(&self, agent_id: &str, limit: i64) -> FleetResult<Vec<Command>> {
        let commands = self.commands.read().await;
        let mut result: Vec<Command> = commands
            .values()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(result)
    }

    async fn list_by_status(&self, statuses: &[CommandStatus]) -> FleetResult<Vec<Command>> {
        let commands = self.commands.read().await;
        let mut result: Vec<Command> = commands
            .values()
            .filter(|c| statuses.contains(&c.status))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    async fn mark_sent(&self, id: &str, at: DateTime<Utc>) -> FleetResult<bool> {
        self.transition(id, CommandStatus::Sent, |c| {
            c.sent_at = Some(at);
            c.updated_at = at;
        })
        .await
    }

    async fn mark_executing(&self, id: &str, at: DateTime<Utc>) -> FleetResult<bool> {
        self.transition(id, CommandStatus::Executing, |c| {
            c.started_at = Some(at);
            c.updated_at = at;
        })
        .await
    }

    async fn complete(&self, id: &str, result: &Value, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = result.clone();
        self.transition(id, CommandStatus::Completed, move |c| {
            c.execution_ms = c.measure_execution(at);
            c.result = Some(result);
            c.completed_at = Some(at);
            c.updated_at = at;
        })
        .await
    }

    async fn fail(
        &self,
        id: &str,
        code: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let (code, message) = (code.to_string(), message.to_string());
        self.transition(id, CommandStatus::Failed, move |c| {
            c.execution_ms = c.measure_execution(at);
            c.error_code = Some(code);
            c.error_message = Some(message);
            c.completed_at = Some(at);
            c.updated_at = at;
        })
        .await
    }
}

#[derive(Default)]
pub struct InMemoryScheduleRepository {
    schedules: RwLock<HashMap<String, Schedule>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn insert(&self, schedule: &Schedule) -> FleetResult<()> {
        self.schedules
            .write()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Schedule>> {
        Ok(self.schedules.read().await.get(id).cloned())
    }

    async fn list(&self, owner_id: Option<&str>) -> FleetResult<Vec<Schedule>> {
        let schedules = self.schedules.read().await;
        let mut result: Vec<Schedule> = schedules
            .values()
            .filter(|s| owner_id.map_or(true, |owner| s.owner_id == owner))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(result)
    }

    async fn list_by_status(&self, status: ScheduleStatus) -> FleetResult<Vec<Schedule>> {
        let schedules = self.schedules.read().await;
        let mut result: Vec<Schedule> = schedules
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(result)
    }

    async fn update(&self, schedule: &Schedule) -> FleetResult<()> {
        let mut schedules = self.schedules.write().await;
        match schedules.get_mut(&schedule.id) {
            Some(stored) => {
                *stored = schedule.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(FleetError::ScheduleNotFound {
                id: schedule.id.clone(),
            }),
        }
    }

    async fn delete(&self, id: &str) -> FleetResult<bool> {
        Ok(self.schedules.write().await.remove(id).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryAgentLogRepository {
    next_id: AtomicI64,
    logs: RwLock<Vec<AgentLog>>,
}

impl InMemoryAgentLogRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentLogRepository for InMemoryAgentLogRepository {
    async fn insert(&self, log: &NewAgentLog) -> FleetResult<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.logs.write().await.push(AgentLog {
            id,
            agent_id: log.agent_id.clone(),
            level: log.level.clone(),
            message: log.message.clone(),
            metadata: log.metadata.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list_by_agent(&self, agent_id: &str, limit: i64) -> FleetResult<Vec<AgentLog>> {
        let logs = self.logs.read().await;
        Ok(logs
            .iter()
            .rev()
            .filter(|l| l.agent_id == agent_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::models::{AgentRegistration, DeviceMetadata};
    use serde_json::json;

    fn agent(max_load: i32) -> Agent {
        Agent::new(
            AgentRegistration {
                device_id: format!("device-{}", uuid::Uuid::new_v4()),
                owner_id: "owner".to_string(),
                capabilities: vec![],
                metadata: DeviceMetadata::default(),
                max_concurrent_commands: Some(max_load),
            },
            uuid::Uuid::new_v4().to_string(),
            5,
        )
    }

    #[tokio::test]
    async fn test_slot_accounting_flips_busy() {
        let repo = InMemoryAgentRepository::new();
        let agent = agent(1);
        repo.insert(&agent).await.unwrap();

        assert!(repo.try_acquire_slot(&agent.id).await.unwrap().is_none());
        assert!(repo
            .compare_and_set_status(&agent.id, AgentStatus::Offline, AgentStatus::Online)
            .await
            .unwrap());

        let acquired = repo.try_acquire_slot(&agent.id).await.unwrap().unwrap();
        assert_eq!(acquired.status, AgentStatus::Busy);
        assert!(repo.try_acquire_slot(&agent.id).await.unwrap().is_none());

        let released = repo
            .release_slot(&agent.id, SlotRelease::Completed { response_ms: 40.0 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.status, AgentStatus::Online);
        assert_eq!(released.current_load, 0);
        assert_eq!(released.completed_count, 1);
    }

    #[tokio::test]
    async fn test_command_terminal_state_is_final() {
        let repo = InMemoryCommandRepository::new();
        let command = Command::new("agent", "user", "echo", json!({}));
        repo.insert(&command).await.unwrap();

        assert!(repo.mark_sent(&command.id, Utc::now()).await.unwrap());
        assert!(repo.complete(&command.id, &json!("ok"), Utc::now()).await.unwrap());
        assert!(!repo.fail(&command.id, "X", "late", Utc::now()).await.unwrap());

        let stored = repo.get(&command.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert!(stored.error_code.is_none());
    }
}
