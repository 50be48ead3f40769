use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - agent is selectable
    Closed,
    /// Circuit is open - agent is excluded from selection
    Open,
    /// Circuit is half-open - a single probe is allowed through
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Time since the last failure before an open circuit admits a probe
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::limits::CIRCUIT_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(crate::limits::CIRCUIT_COOLDOWN_SECONDS),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub probe_in_flight: bool,
    pub times_opened: u64,
}

/// Per-agent circuit breaker.
///
/// All methods take the current instant so callers decide the clock; the
/// breaker itself never sleeps or spawns.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            probe_in_flight: false,
            times_opened: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_failure
            .map(|at| now.saturating_duration_since(at) >= self.config.cooldown)
            .unwrap_or(true)
    }

    /// Whether a task may be dispatched to the agent right now
    pub fn is_selectable(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(now),
            CircuitState::HalfOpen => !self.probe_in_flight,
        }
    }

    /// Record that a task was dispatched. An open breaker whose cooldown has
    /// elapsed moves to half-open and the dispatch becomes its only probe.
    pub fn on_dispatch(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                if self.cooldown_elapsed(now) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                }
            }
            CircuitState::HalfOpen => self.probe_in_flight = true,
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
    }

    /// Record a failed task. Returns true when this failure opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        self.probe_in_flight = false;

        let should_open = match self.state {
            CircuitState::Closed => self.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            // cooldown restarts from this failure
            CircuitState::Open => false,
        };
        if should_open {
            self.state = CircuitState::Open;
            self.times_opened += 1;
        }
        should_open
    }

    /// Forget an outstanding probe without counting it as an outcome
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            probe_in_flight: self.probe_in_flight,
            times_opened: self.times_opened,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
