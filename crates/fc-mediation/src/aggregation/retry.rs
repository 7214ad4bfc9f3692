//! Backoff between optimistic locking retries

use std::time::Duration;

use fc_config::LockRetrySettings;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticLockRetryPolicy {
    /// 0 retries forever
    pub maximum_retries: u32,
    pub retry_delay: Duration,
    pub maximum_retry_delay: Duration,
    pub exponential_backoff: bool,
    pub random_backoff: bool,
}

impl Default for OptimisticLockRetryPolicy {
    fn default() -> Self {
        Self {
            maximum_retries: 0,
            retry_delay: Duration::from_millis(50),
            maximum_retry_delay: Duration::from_millis(1000),
            exponential_backoff: true,
            random_backoff: false,
        }
    }
}

impl OptimisticLockRetryPolicy {
    pub fn from_settings(settings: &LockRetrySettings) -> Self {
        Self {
            maximum_retries: settings.maximum_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            maximum_retry_delay: Duration::from_millis(settings.maximum_retry_delay_ms),
            exponential_backoff: settings.exponential_backoff,
            random_backoff: settings.random_backoff,
        }
    }

    /// Whether conflict number `attempt` (1-based) may be retried
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.maximum_retries == 0 || attempt <= self.maximum_retries
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.random_backoff {
            let max_ms = self.maximum_retry_delay.as_millis() as u64;
            return Duration::from_millis(rand::rng().random_range(0..=max_ms));
        }
        if self.exponential_backoff {
            let shift = attempt.saturating_sub(1).min(31);
            let delay = self.retry_delay.saturating_mul(1u32 << shift);
            return delay.min(self.maximum_retry_delay);
        }
        self.retry_delay
    }

    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
