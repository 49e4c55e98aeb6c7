//! Lifecycle manager timings.

use std::time::Duration;

/// Configuration for the [`LifecycleManager`](super::LifecycleManager).
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Grace period after the last release before teardown (default: 60s)
    pub idle_timeout: Duration,
    /// Period of the health check (default: 30s)
    pub health_check_interval: Duration,
    /// Inactivity after which the pool counts as stale (default: 5min)
    pub stale_threshold: Duration,
    /// Delay before the first reconnect attempt (default: 1s)
    pub backoff_base: Duration,
    /// Upper bound for a single reconnect delay (default: 30s)
    pub backoff_max: Duration,
    /// Reconnect attempts before staying degraded (default: 5)
    pub max_reconnect_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

impl LifecycleConfig {
    pub fn builder() -> LifecycleConfigBuilder {
        LifecycleConfigBuilder::default()
    }

    /// Delay before reconnect `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `backoff_max`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

/// Builder pattern for LifecycleConfig.
#[derive(Default)]
pub struct LifecycleConfigBuilder {
    config: LifecycleConfig,
}

impl LifecycleConfigBuilder {
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.config.stale_threshold = threshold;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.backoff_base = base;
        self.config.backoff_max = max;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn build(self) -> LifecycleConfig {
        self.config
    }
}
