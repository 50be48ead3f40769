use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::time::Instant;

use fleet_core::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};

/// Per-agent circuit breakers, created lazily on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_breaker<T>(&self, agent_id: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        f(breaker)
    }

    pub fn is_selectable(&self, agent_id: &str, now: Instant) -> bool {
        self.lock()
            .get(agent_id)
            .map_or(true, |breaker| breaker.is_selectable(now))
    }

    pub fn on_dispatch(&self, agent_id: &str, now: Instant) {
        self.with_breaker(agent_id, |breaker| breaker.on_dispatch(now));
    }

    pub fn record_success(&self, agent_id: &str) {
        if let Some(breaker) = self.lock().get_mut(agent_id) {
            breaker.record_success();
        }
    }

    /// Returns true when this failure opened the agent's circuit
    pub fn record_failure(&self, agent_id: &str, now: Instant) -> bool {
        self.with_breaker(agent_id, |breaker| breaker.record_failure(now))
    }

    pub fn release_probe(&self, agent_id: &str) {
        if let Some(breaker) = self.lock().get_mut(agent_id) {
            breaker.release_probe();
        }
    }

    pub fn forget(&self, agent_id: &str) {
        self.lock().remove(agent_id);
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<CircuitBreakerSnapshot> {
        self.lock().get(agent_id).map(CircuitBreaker::snapshot)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
