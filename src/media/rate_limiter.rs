use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Spaces out requests to the same host.
pub struct RateLimiter {
    next_slot: DashMap<String, Instant>,
    delay: Duration,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            next_slot: DashMap::new(),
            delay,
        }
    }

    /// Reserve the next slot for `domain` and sleep until it opens.
    pub async fn wait_for_domain(&self, domain: &str) {
        let wait = self.reserve(domain, Instant::now());
        if !wait.is_zero() {
            debug!("Rate limiting: waiting {}ms for domain {}", wait.as_millis(), domain);
            tokio::time::sleep(wait).await;
        }
    }

    /// Book a slot at or after `now`; returns how long the caller must wait.
    fn reserve(&self, domain: &str, now: Instant) -> Duration {
        let mut slot = self.next_slot.entry(domain.to_string()).or_insert(now);
        let start = (*slot).max(now);
        *slot = start + self.delay;
        start - now
    }
}
