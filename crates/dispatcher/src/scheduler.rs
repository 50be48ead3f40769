//! 调度器
//!
//! 把声明式调度(once/interval/cron/event)在正确的时间转换为固定到目标Agent的任务。
//! 内存中只保存活跃调度的定时登记, 全部可以从持久化状态重建;
//! 暂停和删除在持有登记锁的情况下完成, 返回前该调度已不会再触发。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use fleet_core::config::{OrchestratorConfig, SchedulerConfig};
use fleet_core::models::{
    NewSchedule, Schedule, ScheduleKind, ScheduleStatus, Task, TaskRequest,
};
use fleet_core::shutdown::wait_for_shutdown;
use fleet_core::traits::ScheduleRepository;
use fleet_core::{FleetError, FleetResult};
use fleet_infrastructure::MetricsCollector;

use crate::cron_utils::{next_interval_run, CronExpression};
use crate::directory::AgentDirectory;
use crate::orchestrator::TaskOrchestrator;
use crate::retry::RetryPolicy;

/// 一次触发的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FireReport {
    pub schedule_id: String,
    pub task_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Armed {
    schedules: HashMap<String, Schedule>,
    /// 触发失败、等待重试的事件负载
    event_payloads: HashMap<String, Value>,
}

impl Armed {
    fn disarm(&mut self, schedule_id: &str) -> Option<Schedule> {
        self.event_payloads.remove(schedule_id);
        self.schedules.remove(schedule_id)
    }
}

pub struct Scheduler {
    repo: Arc<dyn ScheduleRepository>,
    directory: Arc<AgentDirectory>,
    orchestrator: Arc<TaskOrchestrator>,
    retry: RetryPolicy,
    default_max_retries: u32,
    max_retries_limit: u32,
    tick_interval: Duration,
    metrics: Arc<MetricsCollector>,
    armed: Mutex<Armed>,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn ScheduleRepository>,
        directory: Arc<AgentDirectory>,
        orchestrator: Arc<TaskOrchestrator>,
        orchestrator_config: &OrchestratorConfig,
        config: &SchedulerConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            repo,
            directory,
            orchestrator,
            retry: RetryPolicy::from_config(orchestrator_config),
            default_max_retries: orchestrator_config.default_max_retries,
            max_retries_limit: orchestrator_config.max_retries_limit,
            tick_interval: config.tick_interval(),
            metrics,
            armed: Mutex::new(Armed::default()),
        }
    }

    /// 创建调度; 无效的CRON表达式在这里被拒绝
    pub async fn create(&self, request: NewSchedule) -> FleetResult<Schedule> {
        if request.name.trim().is_empty() {
            return Err(FleetError::InvalidSchedule("调度名称不能为空".to_string()));
        }
        if request.command_type.trim().is_empty() {
            return Err(FleetError::InvalidSchedule("命令类型不能为空".to_string()));
        }
        if let Some(max_retries) = request.max_retries {
            if max_retries > self.max_retries_limit {
                return Err(FleetError::InvalidSchedule(format!(
                    "最大重试次数不能超过{}: {}",
                    self.max_retries_limit, max_retries
                )));
            }
        }

        let agent = self.directory.get(&request.agent_id).await?;
        if !agent.is_active() {
            return Err(FleetError::AgentNotFound { id: agent.id });
        }
        if agent.owner_id != request.owner_id {
            return Err(FleetError::Forbidden(format!(
                "Agent {} 不属于 {}",
                agent.id, request.owner_id
            )));
        }

        let next_run_at = initial_run(&request.kind, Utc::now())?;
        let mut schedule = Schedule::new(request, self.default_max_retries);
        schedule.next_run_at = next_run_at;

        let mut armed = self.armed.lock().await;
        self.repo.insert(&schedule).await?;
        armed
            .schedules
            .insert(schedule.id.clone(), schedule.clone());

        info!(
            schedule_id = %schedule.id,
            schedule_type = schedule.kind.type_name(),
            "调度已创建, 下次执行: {:?}",
            schedule.next_run_at
        );
        Ok(schedule)
    }

    pub async fn get(&self, schedule_id: &str) -> FleetResult<Schedule> {
        self.repo
            .get(schedule_id)
            .await?
            .ok_or_else(|| FleetError::ScheduleNotFound {
                id: schedule_id.to_string(),
            })
    }

    pub async fn list(&self, owner_id: Option<&str>) -> FleetResult<Vec<Schedule>> {
        self.repo.list(owner_id).await
    }

    pub async fn pause(&self, schedule_id: &str) -> FleetResult<Schedule> {
        let mut armed = self.armed.lock().await;
        let mut schedule = self.get(schedule_id).await?;
        if schedule.status != ScheduleStatus::Active {
            return Err(FleetError::invalid_transition(
                "schedule",
                schedule.status,
                ScheduleStatus::Paused,
            ));
        }

        schedule.status = ScheduleStatus::Paused;
        schedule.updated_at = Utc::now();
        self.repo.update(&schedule).await?;
        armed.disarm(schedule_id);

        info!("调度 {} 已暂停", schedule_id);
        Ok(schedule)
    }

    pub async fn resume(&self, schedule_id: &str) -> FleetResult<Schedule> {
        let mut armed = self.armed.lock().await;
        let mut schedule = self.get(schedule_id).await?;
        if schedule.status != ScheduleStatus::Paused {
            return Err(FleetError::invalid_transition(
                "schedule",
                schedule.status,
                ScheduleStatus::Active,
            ));
        }

        schedule.status = ScheduleStatus::Active;
        schedule.retry_count = 0;
        schedule.last_error = None;
        schedule.next_run_at = initial_run(&schedule.kind, Utc::now())?;
        schedule.updated_at = Utc::now();
        self.repo.update(&schedule).await?;
        armed
            .schedules
            .insert(schedule.id.clone(), schedule.clone());

        info!("调度 {} 已恢复, 下次执行: {:?}", schedule_id, schedule.next_run_at);
        Ok(schedule)
    }

    pub async fn delete(&self, schedule_id: &str) -> FleetResult<()> {
        let mut armed = self.armed.lock().await;
        armed.disarm(schedule_id);
        if !self.repo.delete(schedule_id).await? {
            return Err(FleetError::ScheduleNotFound {
                id: schedule_id.to_string(),
            });
        }
        info!("调度 {} 已删除", schedule_id);
        Ok(())
    }

    /// 触发所有监听该事件的活跃调度
    pub async fn trigger_event(&self, event_name: &str, payload: Value) -> FleetResult<Vec<FireReport>> {
        if event_name.trim().is_empty() {
            return Err(FleetError::Validation("事件名称不能为空".to_string()));
        }

        let now = Utc::now();
        let mut armed = self.armed.lock().await;
        let mut ids: Vec<String> = armed
            .schedules
            .values()
            .filter(|s| s.is_active() && s.kind.event_name() == Some(event_name))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();

        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            armed.event_payloads.insert(id.clone(), payload.clone());
            if let Some(report) = self.fire_armed(&mut armed, &id, now).await {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// 触发所有到期的调度
    pub async fn tick(&self, now: DateTime<Utc>) -> FleetResult<Vec<FireReport>> {
        let mut armed = self.armed.lock().await;
        let mut due: Vec<(DateTime<Utc>, String)> = armed
            .schedules
            .values()
            .filter(|s| s.is_active())
            .filter_map(|s| s.next_run_at.filter(|at| *at <= now).map(|at| (at, s.id.clone())))
            .collect();
        due.sort();

        let mut reports = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(report) = self.fire_armed(&mut armed, &id, now).await {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    async fn fire_armed(&self, armed: &mut Armed, schedule_id: &str, now: DateTime<Utc>) -> Option<FireReport> {
        let mut schedule = armed.schedules.remove(schedule_id)?;
        let payload = armed.event_payloads.remove(schedule_id);
        let outcome = self.fire(&schedule, payload.as_ref()).await;
        let failed = outcome.is_err();
        let report = self.record_outcome(&mut schedule, outcome, now);

        if let Err(e) = self.repo.update(&schedule).await {
            error!("保存调度 {} 失败: {}", schedule.id, e);
            if matches!(e, FleetError::ScheduleNotFound { .. }) {
                return Some(report);
            }
        }
        if schedule.is_active() {
            if failed {
                if let Some(payload) = payload {
                    armed.event_payloads.insert(schedule.id.clone(), payload);
                }
            }
            armed.schedules.insert(schedule.id.clone(), schedule);
        }
        Some(report)
    }

    /// 目标Agent必须存在、未吊销且已连接, 然后提交固定到该Agent的任务
    async fn fire(&self, schedule: &Schedule, payload: Option<&Value>) -> FleetResult<Task> {
        let agent = self.directory.get(&schedule.agent_id).await?;
        if !agent.is_active() {
            return Err(FleetError::AgentUnavailable {
                reason: format!("Agent {} 已被吊销", agent.id),
            });
        }
        if !agent.status.is_connected() {
            return Err(FleetError::AgentNotConnected { id: agent.id });
        }

        let mut request = TaskRequest::pinned(
            &schedule.agent_id,
            &schedule.owner_id,
            &schedule.command_type,
            with_event_payload(schedule.parameters.clone(), payload),
        );
        request.schedule_id = Some(schedule.id.clone());
        self.orchestrator.submit(request).await
    }

    fn record_outcome(
        &self,
        schedule: &mut Schedule,
        outcome: FleetResult<Task>,
        now: DateTime<Utc>,
    ) -> FireReport {
        let schedule_type = schedule.kind.type_name();
        schedule.updated_at = Utc::now();

        match outcome {
            Ok(task) => {
                self.metrics.record_schedule_fired(schedule_type, true);
                schedule.last_run_at = Some(now);
                schedule.run_count += 1;
                schedule.retry_count = 0;
                schedule.last_error = None;

                match following_run(&schedule.kind, now) {
                    Ok(Some(next)) => schedule.next_run_at = Some(next),
                    Ok(None) => {
                        schedule.next_run_at = None;
                        if !matches!(schedule.kind, ScheduleKind::Event { .. }) {
                            schedule.status = ScheduleStatus::Completed;
                        }
                    }
                    Err(e) => {
                        schedule.next_run_at = None;
                        schedule.status = ScheduleStatus::Failed;
                        schedule.last_error = Some(e.to_string());
                    }
                }

                info!(
                    schedule_id = %schedule.id,
                    task_id = %task.id,
                    "调度触发成功, 状态: {}",
                    schedule.status
                );
                FireReport {
                    schedule_id: schedule.id.clone(),
                    task_id: Some(task.id),
                    error: None,
                }
            }
            Err(e) => {
                self.metrics.record_schedule_fired(schedule_type, false);
                let reason = e.to_string();
                schedule.last_error = Some(reason.clone());

                if schedule.retry_count < schedule.max_retries {
                    let delay = self.retry.delay_for(schedule.retry_count);
                    schedule.retry_count += 1;
                    schedule.next_run_at =
                        Some(now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero()));
                    warn!(
                        "调度 {} 触发失败(第{}次重试将在{}ms后进行): {}",
                        schedule.id,
                        schedule.retry_count,
                        delay.as_millis(),
                        reason
                    );
                } else {
                    schedule.status = ScheduleStatus::Failed;
                    schedule.next_run_at = None;
                    warn!(
                        "调度 {} 重试{}次后仍失败, 已停用: {}",
                        schedule.id, schedule.retry_count, reason
                    );
                }

                FireReport {
                    schedule_id: schedule.id.clone(),
                    task_id: None,
                    error: Some(reason),
                }
            }
        }
    }

    /// 从持久化状态重建所有活跃调度的定时登记
    pub async fn rehydrate(&self) -> FleetResult<usize> {
        let active = self.repo.list_by_status(ScheduleStatus::Active).await?;
        let now = Utc::now();
        let mut armed = self.armed.lock().await;
        *armed = Armed::default();

        for mut schedule in active {
            let timed = !matches!(schedule.kind, ScheduleKind::Event { .. });
            if timed && schedule.next_run_at.is_none() {
                match initial_run(&schedule.kind, now) {
                    Ok(next) => {
                        schedule.next_run_at = next;
                        self.repo.update(&schedule).await?;
                    }
                    Err(e) => {
                        warn!("跳过无效调度 {}: {}", schedule.id, e);
                        continue;
                    }
                }
            }
            armed.schedules.insert(schedule.id.clone(), schedule);
        }

        let count = armed.schedules.len();
        info!("已从存储恢复 {} 个活跃调度", count);
        Ok(count)
    }

    pub async fn armed_count(&self) -> usize {
        self.armed.lock().await.schedules.len()
    }

    /// 调度循环, 收到关闭信号后退出
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("调度器启动, 检查周期 {:?}", self.tick_interval);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("调度器收到关闭信号");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!("调度检查失败: {}", e);
                    }
                }
            }
        }
        info!("调度器已停止");
    }
}

/// 创建或恢复时的首次执行时间
fn initial_run(kind: &ScheduleKind, now: DateTime<Utc>) -> FleetResult<Option<DateTime<Utc>>> {
    match kind {
        ScheduleKind::Once { run_at } => Ok(Some(*run_at)),
        ScheduleKind::Interval {
            every_minutes,
            anchor,
        } => next_interval_run(*anchor, *every_minutes, now).map(Some),
        ScheduleKind::Cron { expression } => CronExpression::parse(expression)?
            .next_after(now)
            .map(Some)
            .ok_or_else(|| {
                FleetError::InvalidSchedule(format!("CRON表达式没有未来的执行时间: {expression}"))
            }),
        ScheduleKind::Event { event_name } => {
            if event_name.trim().is_empty() {
                return Err(FleetError::InvalidSchedule("事件名称不能为空".to_string()));
            }
            Ok(None)
        }
    }
}

/// 成功触发后的下次执行时间
fn following_run(kind: &ScheduleKind, now: DateTime<Utc>) -> FleetResult<Option<DateTime<Utc>>> {
    match kind {
        ScheduleKind::Once { .. } | ScheduleKind::Event { .. } => Ok(None),
        ScheduleKind::Interval {
            every_minutes,
            anchor,
        } => next_interval_run(*anchor, *every_minutes, now).map(Some),
        ScheduleKind::Cron { expression } => Ok(CronExpression::parse(expression)?.next_after(now)),
    }
}

/// 事件负载并入命令参数的 `event` 字段
fn with_event_payload(parameters: Value, payload: Option<&Value>) -> Value {
    let Some(payload) = payload else {
        return parameters;
    };
    match parameters {
        Value::Object(mut map) => {
            map.insert("event".to_string(), payload.clone());
            Value::Object(map)
        }
        Value::Null => json!({ "event": payload }),
        other => json!({ "parameters": other, "event": payload }),
    }
}
