//! 任务编排器
//!
//! 维护优先级队列, 周期性地为排队任务挑选Agent并通过控制通道派发命令。
//! 派发时占用Agent负载槽位, 命令进入终态时由赢得终态写入的一方释放,
//! 因此无论结果、错误还是派发超时先到, 槽位只会释放一次。
//! 失败计入Agent熔断器, 并按指数退避重新排队直到用完重试次数。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use fleet_core::config::OrchestratorConfig;
use fleet_core::models::{
    Agent, AgentEvent, CommandStatus, SlotRelease, Task, TaskRequest, TaskStatus,
};
use fleet_core::shutdown::wait_for_shutdown;
use fleet_core::traits::{CommandOutcomeHandler, CommandSender};
use fleet_core::{CircuitBreakerConfig, CircuitBreakerSnapshot, FleetError, FleetResult};
use fleet_infrastructure::MetricsCollector;

use crate::breakers::CircuitBreakerRegistry;
use crate::commands::CommandLifecycle;
use crate::directory::AgentDirectory;
use crate::queue::TaskQueue;
use crate::retry::RetryPolicy;
use crate::strategies::{is_eligible, AgentSelectionStrategy, LeastLoadedStrategy};

const CANCELLED_REASON: &str = "cancelled before dispatch";
const RESTARTED_REASON: &str = "server restarted before outcome";
const REVOKED_REASON: &str = "agent revoked before dispatch";

/// 已派发、等待结果的命令
#[derive(Debug, Clone)]
struct InFlight {
    task_id: String,
    agent_id: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct OrchestratorState {
    tasks: HashMap<String, Task>,
    queue: TaskQueue,
    in_flight: HashMap<String, InFlight>,
    history: VecDeque<Task>,
}

enum Placement {
    Dispatched,
    Deferred,
    Settled,
}

/// 启动恢复结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub agents_reset: u64,
    pub commands_failed: usize,
    pub tasks_requeued: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub queued: usize,
    pub delayed: usize,
    pub running: usize,
    pub finished: usize,
}

pub struct TaskOrchestrator {
    config: OrchestratorConfig,
    directory: Arc<AgentDirectory>,
    commands: Arc<CommandLifecycle>,
    sender: Arc<dyn CommandSender>,
    breakers: CircuitBreakerRegistry,
    strategy: Box<dyn AgentSelectionStrategy>,
    retry: RetryPolicy,
    metrics: Arc<MetricsCollector>,
    state: Mutex<OrchestratorState>,
}

impl TaskOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        directory: Arc<AgentDirectory>,
        commands: Arc<CommandLifecycle>,
        sender: Arc<dyn CommandSender>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.breaker_failure_threshold,
            cooldown: config.breaker_cooldown(),
        });
        Self {
            retry: RetryPolicy::from_config(&config),
            config,
            directory,
            commands,
            sender,
            breakers,
            strategy: Box::new(LeastLoadedStrategy::new()),
            metrics,
            state: Mutex::new(OrchestratorState::default()),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn AgentSelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn breaker_snapshot(&self, agent_id: &str) -> Option<CircuitBreakerSnapshot> {
        self.breakers.snapshot(agent_id)
    }

    /// 提交任务; 固定到某个Agent的任务立即创建pending命令
    pub async fn submit(&self, request: TaskRequest) -> FleetResult<Task> {
        if request.command_type.trim().is_empty() {
            return Err(FleetError::Validation("命令类型不能为空".to_string()));
        }
        let priority = request.priority.unwrap_or(self.config.default_priority);
        if !(self.config.min_priority..=self.config.max_priority).contains(&priority) {
            return Err(FleetError::Validation(format!(
                "优先级必须在{}到{}之间: {}",
                self.config.min_priority, self.config.max_priority, priority
            )));
        }
        let max_retries = request
            .max_retries
            .unwrap_or(self.config.default_max_retries);
        if max_retries > self.config.max_retries_limit {
            return Err(FleetError::Validation(format!(
                "最大重试次数不能超过{}: {}",
                self.config.max_retries_limit, max_retries
            )));
        }

        let mut task = Task::new(request, priority, max_retries);
        if let Some(agent_id) = task.pinned_agent().map(str::to_string) {
            let agent = self.directory.get(&agent_id).await?;
            if !agent.is_active() {
                return Err(FleetError::AgentNotFound { id: agent_id });
            }
            let command = self
                .commands
                .create(
                    &agent_id,
                    &task.issuer_id,
                    &task.command_type,
                    task.parameters.clone(),
                )
                .await?;
            task.command_id = Some(command.id);
            task.assigned_agent = Some(agent_id);
        }

        let mut state = self.state.lock().await;
        state.queue.push(task.id.clone(), task.priority);
        state.tasks.insert(task.id.clone(), task.clone());
        self.report_queue_depth(&state);

        info!(
            task_id = %task.id,
            command_type = %task.command_type,
            priority = task.priority,
            "任务已提交"
        );
        Ok(task)
    }

    /// 取消仍在排队(或等待退避)的任务
    pub async fn cancel(&self, task_id: &str) -> FleetResult<Task> {
        let mut state = self.state.lock().await;
        let status = match state.tasks.get(task_id) {
            Some(task) => task.status,
            None => {
                return Err(match state.history.iter().find(|t| t.id == task_id) {
                    Some(task) => {
                        FleetError::invalid_transition("task", task.status, TaskStatus::Cancelled)
                    }
                    None => FleetError::TaskNotFound {
                        id: task_id.to_string(),
                    },
                });
            }
        };
        if status != TaskStatus::Pending {
            return Err(FleetError::invalid_transition(
                "task",
                status,
                TaskStatus::Cancelled,
            ));
        }

        state.queue.remove(task_id);
        let Some(mut task) = state.tasks.remove(task_id) else {
            return Err(FleetError::TaskNotFound {
                id: task_id.to_string(),
            });
        };
        if let Some(command_id) = &task.command_id {
            self.commands
                .fail(command_id, "CANCELLED", CANCELLED_REASON)
                .await?;
        }
        task.status = TaskStatus::Cancelled;
        task.last_error = Some(CANCELLED_REASON.to_string());
        task.updated_at = Utc::now();
        self.archive(&mut state, task.clone());
        self.report_queue_depth(&state);

        info!("任务 {} 已取消", task_id);
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> FleetResult<Task> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(task_id)
            .or_else(|| state.history.iter().rev().find(|t| t.id == task_id))
            .cloned()
            .ok_or_else(|| FleetError::TaskNotFound {
                id: task_id.to_string(),
            })
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let state = self.state.lock().await;
        OrchestratorStats {
            queued: state.queue.ready_len(),
            delayed: state.queue.delayed_len(),
            running: state.in_flight.len(),
            finished: state.history.len(),
        }
    }

    /// 一轮派发: 处理超时、提升退避结束的任务, 再按优先级依次选择Agent
    pub async fn dispatch_pass(&self) -> FleetResult<usize> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        self.expire_overdue(&mut state, now).await?;
        state.queue.promote_ready(now);
        if state.queue.ready_len() == 0 {
            self.report_queue_depth(&state);
            return Ok(0);
        }

        let mut agents = self.directory.dispatchable_agents().await?;
        let mut deferred = Vec::new();
        let mut dispatched = 0;

        while let Some(entry) = state.queue.pop() {
            let Some(task) = state.tasks.get(&entry.task_id).cloned() else {
                continue;
            };
            match self.place(&mut state, &task, &mut agents, now).await {
                Ok(Placement::Dispatched) => dispatched += 1,
                Ok(Placement::Deferred) => deferred.push(entry),
                Ok(Placement::Settled) => {}
                Err(e) => {
                    error!("派发任务 {} 失败: {}", task.id, e);
                    deferred.push(entry);
                }
            }
        }
        for entry in deferred {
            state.queue.requeue(entry);
        }
        self.report_queue_depth(&state);

        if dispatched > 0 {
            debug!("本轮派发了 {} 个任务", dispatched);
        }
        Ok(dispatched)
    }

    async fn place(
        &self,
        state: &mut OrchestratorState,
        task: &Task,
        agents: &mut Vec<Agent>,
        now: Instant,
    ) -> FleetResult<Placement> {
        let agent_id = loop {
            let candidates: Vec<&Agent> = agents
                .iter()
                .filter(|agent| is_eligible(task, agent) && self.breakers.is_selectable(&agent.id, now))
                .collect();
            let Some(selected) = self.strategy.select(task, &candidates) else {
                debug!("没有可用的Agent, 任务 {} 继续排队", task.id);
                return Ok(Placement::Deferred);
            };
            let agent_id = selected.id.clone();

            match self.directory.try_acquire_slot(&agent_id).await? {
                Some(updated) => {
                    if let Some(slot) = agents.iter_mut().find(|a| a.id == agent_id) {
                        *slot = updated;
                    }
                    break agent_id;
                }
                None => agents.retain(|a| a.id != agent_id),
            }
        };

        let command_id = match &task.command_id {
            Some(id) => id.clone(),
            None => {
                self.commands
                    .create(
                        &agent_id,
                        &task.issuer_id,
                        &task.command_type,
                        task.parameters.clone(),
                    )
                    .await?
                    .id
            }
        };

        self.breakers.on_dispatch(&agent_id, now);
        match self.commands.dispatch(&command_id, self.sender.as_ref()).await {
            Ok(_) => {
                if let Some(running) = state.tasks.get_mut(&task.id) {
                    running.status = TaskStatus::Running;
                    running.assigned_agent = Some(agent_id.clone());
                    running.command_id = Some(command_id.clone());
                    running.updated_at = Utc::now();
                }
                state.in_flight.insert(
                    command_id,
                    InFlight {
                        task_id: task.id.clone(),
                        agent_id,
                        deadline: now + self.config.dispatch_timeout(),
                    },
                );
                Ok(Placement::Dispatched)
            }
            Err(e) => {
                warn!("任务 {} 派发到Agent {} 失败: {}", task.id, agent_id, e);
                self.commands
                    .fail(&command_id, e.code(), &format!("dispatch failed: {e}"))
                    .await?;
                self.directory
                    .release_slot(&agent_id, SlotRelease::Failed)
                    .await?;
                agents.retain(|a| a.id != agent_id);
                // 连接刚断开时不计入熔断器
                let charged = if matches!(e, FleetError::AgentNotConnected { .. }) {
                    self.breakers.release_probe(&agent_id);
                    None
                } else {
                    Some(agent_id.as_str())
                };
                self.fail_task(state, &task.id, charged, format!("dispatch failed: {e}"), now);
                Ok(Placement::Settled)
            }
        }
    }

    /// 派发超时的命令记为失败; 只有赢得终态写入时才释放槽位
    async fn expire_overdue(&self, state: &mut OrchestratorState, now: Instant) -> FleetResult<()> {
        let overdue: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline <= now)
            .map(|(command_id, _)| command_id.clone())
            .collect();

        for command_id in overdue {
            let timeout = FleetError::CommandTimeout {
                command_id: command_id.clone(),
            };
            let reason = format!(
                "no outcome within {}s",
                self.config.dispatch_timeout_seconds
            );
            if self
                .commands
                .fail(&command_id, timeout.code(), &reason)
                .await?
                .is_none()
            {
                continue;
            }
            let Some(flight) = state.in_flight.remove(&command_id) else {
                continue;
            };
            self.directory
                .release_slot(&flight.agent_id, SlotRelease::Failed)
                .await?;
            self.fail_task(
                state,
                &flight.task_id,
                Some(&flight.agent_id),
                format!("{timeout}: {reason}"),
                now,
            );
        }
        Ok(())
    }

    /// 任务失败: 计入熔断器, 还有重试次数时按退避延迟重新排队, 否则终结
    fn fail_task(
        &self,
        state: &mut OrchestratorState,
        task_id: &str,
        agent_id: Option<&str>,
        reason: String,
        now: Instant,
    ) {
        if let Some(agent_id) = agent_id {
            if self.breakers.record_failure(agent_id, now) {
                warn!("Agent {} 连续失败, 熔断器打开", agent_id);
                self.metrics.record_circuit_opened(agent_id);
            }
        }

        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };
        task.last_error = Some(reason);
        task.updated_at = Utc::now();

        if task.retry_count < task.max_retries {
            let delay = self.retry.delay_for(task.retry_count);
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.command_id = None;
            task.assigned_agent = None;
            let (priority, retry_count) = (task.priority, task.retry_count);

            state
                .queue
                .push_delayed(task_id.to_string(), priority, now + delay);
            self.metrics.record_task_retry();
            info!(
                "任务 {} 第{}次重试, {}ms后重新排队",
                task_id,
                retry_count,
                delay.as_millis()
            );
        } else if let Some(mut task) = state.tasks.remove(task_id) {
            task.status = TaskStatus::Failed;
            warn!(
                "任务 {} 重试{}次后失败: {}",
                task_id,
                task.retry_count,
                task.last_error.as_deref().unwrap_or_default()
            );
            self.metrics.record_task_exhausted();
            self.archive(state, task);
        }
    }

    fn complete_task(&self, state: &mut OrchestratorState, task_id: &str, agent_id: &str) {
        self.breakers.record_success(agent_id);
        if let Some(mut task) = state.tasks.remove(task_id) {
            task.status = TaskStatus::Completed;
            task.last_error = None;
            task.updated_at = Utc::now();
            debug!("任务 {} 完成", task_id);
            self.archive(state, task);
        }
    }

    fn archive(&self, state: &mut OrchestratorState, task: Task) {
        state.history.push_back(task);
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
    }

    fn report_queue_depth(&self, state: &OrchestratorState) {
        self.metrics.update_queue_depth(state.queue.len() as f64);
    }

    async fn ensure_owner(&self, agent_id: &str, command_id: &str) -> FleetResult<()> {
        let command = self.commands.get(command_id).await?;
        if command.agent_id != agent_id {
            return Err(FleetError::Forbidden(format!(
                "命令 {command_id} 不属于Agent {agent_id}"
            )));
        }
        Ok(())
    }

    /// 只有在途命令的结果才占有槽位可释放; 还未派发的命令拒绝, 已终结的忽略
    async fn is_in_flight(
        &self,
        state: &OrchestratorState,
        command_id: &str,
        target: CommandStatus,
    ) -> FleetResult<bool> {
        if state.in_flight.contains_key(command_id) {
            return Ok(true);
        }
        let command = self.commands.get(command_id).await?;
        if command.status == CommandStatus::Pending {
            return Err(FleetError::invalid_transition(
                "command",
                command.status.as_str(),
                target.as_str(),
            ));
        }
        debug!("忽略命令 {} 的迟到结果, 当前状态 {}", command_id, command.status.as_str());
        Ok(false)
    }

    /// 启动恢复: 重置Agent存活状态, 结束上次运行遗留的在途命令, 重新排队pending命令
    pub async fn recover(&self) -> FleetResult<RecoveryReport> {
        let mut report = RecoveryReport {
            agents_reset: self.directory.reset_liveness().await?,
            ..Default::default()
        };

        let stale = self
            .commands
            .list_by_status(&[CommandStatus::Sent, CommandStatus::Executing])
            .await?;
        for command in stale {
            if self
                .commands
                .fail(&command.id, "SERVER_RESTARTED", RESTARTED_REASON)
                .await?
                .is_some()
            {
                report.commands_failed += 1;
            }
        }

        let pending = self
            .commands
            .list_by_status(&[CommandStatus::Pending])
            .await?;
        let mut state = self.state.lock().await;
        for command in pending {
            let request = TaskRequest::pinned(
                &command.agent_id,
                &command.issuer_id,
                &command.command_type,
                command.parameters.clone(),
            );
            let mut task = Task::new(
                request,
                self.config.default_priority,
                self.config.default_max_retries,
            );
            task.command_id = Some(command.id.clone());
            task.assigned_agent = Some(command.agent_id.clone());
            state.queue.push(task.id.clone(), task.priority);
            state.tasks.insert(task.id.clone(), task);
            report.tasks_requeued += 1;
        }
        self.report_queue_depth(&state);

        info!(
            "启动恢复完成: 重置{}个Agent, 结束{}个在途命令, 重新排队{}个任务",
            report.agents_reset, report.commands_failed, report.tasks_requeued
        );
        Ok(report)
    }

    async fn handle_agent_event(&self, event: AgentEvent) -> FleetResult<()> {
        match event {
            AgentEvent::Revoked { agent_id } => {
                self.breakers.forget(&agent_id);
                let mut state = self.state.lock().await;
                let stranded: Vec<String> = state
                    .tasks
                    .values()
                    .filter(|task| {
                        task.status == TaskStatus::Pending
                            && task.pinned_agent() == Some(agent_id.as_str())
                    })
                    .map(|task| task.id.clone())
                    .collect();

                for task_id in stranded {
                    state.queue.remove(&task_id);
                    if let Some(mut task) = state.tasks.remove(&task_id) {
                        if let Some(command_id) = &task.command_id {
                            self.commands
                                .fail(command_id, "AGENT_REVOKED", REVOKED_REASON)
                                .await?;
                        }
                        task.status = TaskStatus::Failed;
                        task.last_error = Some(REVOKED_REASON.to_string());
                        task.updated_at = Utc::now();
                        warn!("Agent {} 已吊销, 任务 {} 终止", agent_id, task.id);
                        self.archive(&mut state, task);
                    }
                }
                self.report_queue_depth(&state);
            }
            AgentEvent::StatusChanged { agent_id, from, to } => {
                debug!("Agent {} 状态 {} -> {}, 下一轮派发生效", agent_id, from, to);
            }
            AgentEvent::Registered { .. } => {}
        }
        Ok(())
    }

    /// 周期派发循环, 收到关闭信号后退出
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.dispatch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = self.directory.subscribe();
        info!(
            "任务编排器启动, 派发周期 {}ms",
            self.config.dispatch_interval_ms
        );

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("任务编排器收到关闭信号");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_pass().await {
                        error!("派发循环出错: {}", e);
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_agent_event(event).await {
                            error!("处理Agent事件失败: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("编排器落后 {} 条Agent事件", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Agent事件通道已关闭");
                        break;
                    }
                },
            }
        }
        info!("任务编排器已停止");
    }
}

#[async_trait]
impl CommandOutcomeHandler for TaskOrchestrator {
    async fn on_command_ack(&self, agent_id: &str, command_id: &str) -> FleetResult<()> {
        self.ensure_owner(agent_id, command_id).await?;
        if !self.commands.mark_executing(command_id).await? {
            debug!("忽略命令 {} 的确认", command_id);
        }
        Ok(())
    }

    async fn on_command_result(
        &self,
        agent_id: &str,
        command_id: &str,
        result: Value,
    ) -> FleetResult<()> {
        self.ensure_owner(agent_id, command_id).await?;
        let mut state = self.state.lock().await;
        if !self
            .is_in_flight(&state, command_id, CommandStatus::Completed)
            .await?
        {
            return Ok(());
        }
        let Some(command) = self.commands.complete(command_id, result).await? else {
            return Ok(());
        };
        let response_ms = command.execution_ms.unwrap_or(0) as f64;
        self.directory
            .release_slot(agent_id, SlotRelease::Completed { response_ms })
            .await?;

        if let Some(flight) = state.in_flight.remove(command_id) {
            self.complete_task(&mut state, &flight.task_id, agent_id);
        }
        Ok(())
    }

    async fn on_command_error(
        &self,
        agent_id: &str,
        command_id: &str,
        code: &str,
        message: &str,
    ) -> FleetResult<()> {
        self.ensure_owner(agent_id, command_id).await?;
        let mut state = self.state.lock().await;
        if !self
            .is_in_flight(&state, command_id, CommandStatus::Failed)
            .await?
        {
            return Ok(());
        }
        if self.commands.fail(command_id, code, message).await?.is_none() {
            return Ok(());
        }
        self.directory
            .release_slot(agent_id, SlotRelease::Failed)
            .await?;

        if let Some(flight) = state.in_flight.remove(command_id) {
            self.fail_task(
                &mut state,
                &flight.task_id,
                Some(agent_id),
                format!("{code}: {message}"),
                Instant::now(),
            );
        }
        Ok(())
    }
}
