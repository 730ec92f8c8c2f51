use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::browser::BrowserError;
use crate::config::ProbeConfig;

/// Bounded retry with exponential backoff for lookups that may legitimately
/// come back empty while the page is still rendering.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ProbeConfig::default())
    }
}

impl From<&ProbeConfig> for RetryPolicy {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Several attempts without sleeping between them.
    pub fn no_wait(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::immediate()
        }
    }

    /// Delay before attempt `attempt + 1` (zero-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let base = self.initial_backoff.mul_f64(factor).min(self.max_backoff);
        if self.jitter && !base.is_zero() {
            let spread = rand::thread_rng().gen_range(0.8..1.2);
            base.mul_f64(spread).min(self.max_backoff)
        } else {
            base
        }
    }

    /// Run `op` until it yields `Some`, the attempts run out, or a fatal
    /// error occurs.
    ///
    /// `Ok(None)` from `op` and transient browser errors are retried.
    /// Exhaustion returns `Ok(None)`. Only fatal errors propagate.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<Option<T>, BrowserError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, BrowserError>>,
    {
        for attempt in 0..self.max_attempts {
            match op().await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {
                    debug!("{}: nothing yet (attempt {}/{})", what, attempt + 1, self.max_attempts);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("{}: {} (attempt {}/{})", what, e, attempt + 1, self.max_attempts);
                }
            }

            if attempt + 1 < self.max_attempts {
                let delay = self.backoff_for(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Ok(None)
    }
}
