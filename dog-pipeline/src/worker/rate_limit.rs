//! Sliding-window dequeue limiter.
//!
//! Unlike a token bucket this never allows a burst larger than `max` inside
//! any window of length `window`, which is what per-minute upstream quotas
//! count.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimit;

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max: usize,
    window: Duration,
    /// Grant times inside the current window, oldest first
    grants: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            max: limit.max.max(1) as usize,
            window: limit.window,
            grants: Mutex::new(VecDeque::new()),
        }
    }

    /// Take a slot, or return how long until one frees up
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut grants = self.grants.lock();

        while grants
            .front()
            .is_some_and(|granted| now.duration_since(*granted) >= self.window)
        {
            grants.pop_front();
        }

        if grants.len() < self.max {
            grants.push_back(now);
            return Ok(());
        }

        let oldest = grants.front().copied().unwrap_or(now);
        Err(self.window.saturating_sub(now.duration_since(oldest)))
    }

    /// Return the most recent slot when the dequeue it paid for found nothing
    pub fn refund(&self) {
        self.grants.lock().pop_back();
    }

    /// Slots left in the current window
    pub fn available(&self) -> usize {
        let now = Instant::now();
        let grants = self.grants.lock();
        let used = grants
            .iter()
            .filter(|granted| now.duration_since(**granted) < self.window)
            .count();
        self.max.saturating_sub(used)
    }
}
