use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule for reconnecting to a change source.
///
/// `max_retries` of `-1` retries forever, `0` never retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    max_retries: i32,
    retry_delay: Duration,
    max_delay: Duration,
    /// Fraction of the capped delay, in `[0, 1]`, to spread retries by.
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: -1,
            retry_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub fn is_infinite(&self) -> bool {
        self.max_retries == -1
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            -1 => true,
            n if n <= 0 => false,
            n => attempt <= n as u32,
        }
    }

    /// Exponential backoff capped at `max_delay`, spread by a deterministic
    /// golden-ratio jitter so tables retrying together drift apart.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let capped = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return capped;
        }
        let range = capped.as_secs_f64() * self.jitter;
        let offset = (attempt as f64 * 0.618_033_988_749_895) % 1.0;
        let adjusted = capped.as_secs_f64() + range * (offset * 2.0 - 1.0);
        Duration::from_secs_f64(adjusted.max(0.0))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<i32>,
    retry_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, value: i32) -> Self {
        self.max_retries = Some(value);
        self
    }

    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = Some(value);
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = Some(value);
        self
    }

    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = Some(value.clamp(0.0, 1.0));
        self
    }

    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}
