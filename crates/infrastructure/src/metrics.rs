//! Metrics collector for the fleet control plane
//!
//! Thin wrapper over the `metrics` facade. Without an installed recorder every
//! call is a no-op, so components can record unconditionally.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

pub struct MetricsCollector {
    commands_dispatched_total: Counter,
    commands_completed_total: Counter,
    command_execution_duration: Histogram,
    task_retries_total: Counter,
    connected_agents: Gauge,
    queue_depth: Gauge,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            commands_dispatched_total: counter!("fleet_commands_dispatched_total"),
            commands_completed_total: counter!("fleet_commands_completed_total"),
            command_execution_duration: histogram!("fleet_command_execution_duration_seconds"),
            task_retries_total: counter!("fleet_task_retries_total"),
            connected_agents: gauge!("fleet_connected_agents"),
            queue_depth: gauge!("fleet_queue_depth"),
        }
    }

    // Command metrics

    pub fn record_command_dispatched(&self) {
        self.commands_dispatched_total.increment(1);
    }

    pub fn record_command_completed(&self, duration_seconds: f64) {
        self.commands_completed_total.increment(1);
        self.command_execution_duration.record(duration_seconds);
    }

    /// Record a failed command, labelled by its error code
    pub fn record_command_failed(&self, code: &str) {
        counter!("fleet_commands_failed_total", "code" => code.to_string()).increment(1);
    }

    pub fn record_task_retry(&self) {
        self.task_retries_total.increment(1);
    }

    /// Record a task that exhausted its retries
    pub fn record_task_exhausted(&self) {
        counter!("fleet_tasks_failed_total").increment(1);
    }

    // Agent and channel metrics

    pub fn record_circuit_opened(&self, agent_id: &str) {
        counter!("fleet_circuit_opened_total", "agent_id" => agent_id.to_string()).increment(1);
    }

    pub fn update_connected_agents(&self, count: f64) {
        self.connected_agents.set(count);
    }

    /// Record a rejected inbound message, labelled by rejection reason
    pub fn record_message_rejected(&self, reason: &'static str) {
        counter!("fleet_messages_rejected_total", "reason" => reason).increment(1);
    }

    pub fn record_connection_closed(&self, close_code: u16) {
        counter!("fleet_connections_closed_total", "code" => close_code.to_string()).increment(1);
    }

    // Queue and scheduler metrics

    pub fn update_queue_depth(&self, depth: f64) {
        self.queue_depth.set(depth);
    }

    pub fn record_schedule_fired(&self, schedule_type: &'static str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!(
            "fleet_schedule_fires_total",
            "type" => schedule_type,
            "outcome" => outcome
        )
        .increment(1);
    }
}
