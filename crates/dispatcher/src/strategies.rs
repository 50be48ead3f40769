use tracing::debug;

use fleet_core::models::{Agent, AgentStatus, Task};

/// Agent选择策略
pub trait AgentSelectionStrategy: Send + Sync {
    /// 从已通过资格过滤的候选中选出一个
    fn select<'a>(&self, task: &Task, candidates: &[&'a Agent]) -> Option<&'a Agent>;

    fn name(&self) -> &str;
}

/// 选择负载比例最低的Agent, 负载相同时按id排序
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoadedStrategy;

impl LeastLoadedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl AgentSelectionStrategy for LeastLoadedStrategy {
    fn select<'a>(&self, task: &Task, candidates: &[&'a Agent]) -> Option<&'a Agent> {
        let selected = candidates.iter().copied().min_by(|a, b| {
            a.load_ratio()
                .total_cmp(&b.load_ratio())
                .then_with(|| a.id.cmp(&b.id))
        })?;

        debug!(
            "负载均衡策略为任务 {} 选择Agent: {} (负载: {}/{})",
            task.id, selected.id, selected.current_load, selected.max_load
        );
        Some(selected)
    }

    fn name(&self) -> &str {
        "LeastLoaded"
    }
}

/// 熔断器以外的资格检查: 在线、有余量、能力匹配、符合固定目标
pub fn is_eligible(task: &Task, agent: &Agent) -> bool {
    if agent.status != AgentStatus::Online || !agent.is_active() || !agent.has_capacity() {
        return false;
    }
    if let Some(pinned) = task.pinned_agent() {
        if pinned != agent.id {
            return false;
        }
    }
    match &task.capability {
        Some(capability) => agent.supports(capability),
        None => true,
    }
}
