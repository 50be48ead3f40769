//! Per-connection sliding-window rate limiter.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: VecDeque::with_capacity(limit as usize),
        }
    }

    /// Records a message at `now`; false when the window is already full
    pub fn check(&mut self, now: Instant) -> bool {
        while self
            .hits
            .front()
            .is_some_and(|&at| now.saturating_duration_since(at) >= self.window)
        {
            self.hits.pop_front();
        }

        if self.hits.len() as u32 >= self.limit {
            return false;
        }
        self.hits.push_back(now);
        true
    }

    pub fn in_window(&self) -> usize {
        self.hits.len()
    }
}
