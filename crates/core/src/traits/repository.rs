//! 数据仓储层接口定义
//!
//! 每个仓储只负责一个实体:
//! - `AgentRepository` - Agent的注册、存活状态和负载计数
//! - `CommandRepository` - 命令生命周期
//! - `ScheduleRepository` - 调度规则
//! - `AgentLogRepository` - Agent上报日志
//!
//! 状态类写操作都是条件更新: 只有当行仍处于期望的前置状态时才生效,
//! 返回值表示调用方是否赢得了这次转换。同一行上的并发写因此被串行化,
//! 不会出现丢失更新。SQLite实现和内存实现遵循相同语义。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::FleetResult;
use crate::models::{
    Agent, AgentLog, AgentStatus, Command, CommandStatus, NewAgentLog, Schedule, ScheduleStatus,
    SlotRelease,
};

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn insert(&self, agent: &Agent) -> FleetResult<()>;

    async fn get(&self, id: &str) -> FleetResult<Option<Agent>>;

    async fn find_by_token(&self, token: &str) -> FleetResult<Option<Agent>>;

    /// 查找设备身份对应的未删除记录
    async fn find_active_by_device(&self, device_id: &str) -> FleetResult<Option<Agent>>;

    /// 列出未删除的Agent, 可按所有者过滤
    async fn list(&self, owner_id: Option<&str>) -> FleetResult<Vec<Agent>>;

    /// 更新重复注册时上报的能力和元数据
    async fn update_profile(&self, agent: &Agent) -> FleetResult<()>;

    /// 仅当当前状态为 `from` 时改为 `to`
    async fn compare_and_set_status(
        &self,
        id: &str,
        from: AgentStatus,
        to: AgentStatus,
    ) -> FleetResult<bool>;

    async fn touch_heartbeat(
        &self,
        id: &str,
        at: DateTime<Utc>,
        address: Option<&str>,
    ) -> FleetResult<()>;

    /// 在线且有剩余容量时占用一个负载槽位, 满载时状态变为busy
    async fn try_acquire_slot(&self, id: &str) -> FleetResult<Option<Agent>>;

    /// 释放一个负载槽位并更新生命周期计数, busy时回到online
    async fn release_slot(&self, id: &str, release: SlotRelease) -> FleetResult<Option<Agent>>;

    /// 软删除并吊销令牌
    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> FleetResult<bool>;

    /// 启动时把所有Agent置为离线并清零负载
    async fn reset_liveness(&self) -> FleetResult<u64>;
}

#[async_trait]
pub trait CommandRepository: Send + Sync {
    async fn insert(&self, command: &Command) -> FleetResult<()>;

    async fn get(&self, id: &str) -> FleetResult<Option<Command>>;

    async fn list_by_agent(&self, agent_id: &str, limit: i64) -> FleetResult<Vec<Command>>;

    async fn list_by_status(&self, statuses: &[CommandStatus]) -> FleetResult<Vec<Command>>;

    /// pending → sent
    async fn mark_sent(&self, id: &str, at: DateTime<Utc>) -> FleetResult<bool>;

    /// sent → executing
    async fn mark_executing(&self, id: &str, at: DateTime<Utc>) -> FleetResult<bool>;

    /// sent | executing → completed
    async fn complete(&self, id: &str, result: &Value, at: DateTime<Utc>) -> FleetResult<bool>;

    /// 任意非终态 → failed
    async fn fail(
        &self,
        id: &str,
        code: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn insert(&self, schedule: &Schedule) -> FleetResult<()>;

    async fn get(&self, id: &str) -> FleetResult<Option<Schedule>>;

    async fn list(&self, owner_id: Option<&str>) -> FleetResult<Vec<Schedule>>;

    async fn list_by_status(&self, status: ScheduleStatus) -> FleetResult<Vec<Schedule>>;

    /// 整行覆盖写入, 由调度器在持锁状态下调用
    async fn update(&self, schedule: &Schedule) -> FleetResult<()>;

    async fn delete(&self, id: &str) -> FleetResult<bool>;
}

#[async_trait]
pub trait AgentLogRepository: Send + Sync {
    async fn insert(&self, log: &NewAgentLog) -> FleetResult<i64>;

    async fn list_by_agent(&self, agent_id: &str, limit: i64) -> FleetResult<Vec<AgentLog>>;
}
