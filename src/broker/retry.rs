use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::BrokerConfig;
use crate::error::Result;

/// Bounded exponential backoff for broker operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial,
            max,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.publish_attempts, config.retry_initial(), config.retry_max())
    }

    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`,
    /// capped at `max`. Sub-second delays are fine.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Unbounded delay sequence: initial, 2x, 4x ... capped at `max`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let policy = *self;
        (0u32..).map(move |attempt| policy.delay_for_attempt(attempt))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up. Returns the last error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delays = self.delays();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = delays.next().unwrap_or(self.max);
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what, attempt, self.attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for RetryPolicy {
    fn from(config: &BrokerConfig) -> Self {
        Self::from_config(config)
    }
}
