//! Reconnection policy.
//!
//! Linear backoff with a ceiling: the n-th consecutive retry waits
//! `min(base_delay * n, max_delay)`. The scheduler performs no I/O and holds
//! no connection state, so the whole policy is testable without a transport.

use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry; the n-th retry waits n times this.
    pub base_delay: Duration,
    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,
    /// Consecutive unexpected closes tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            max_attempts: 10,
        }
    }
}

/// Retry bookkeeping for the current run of unexpected closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryContext {
    pub attempt_count: u32,
    pub next_delay: Duration,
}

/// Decides when the next connection attempt happens.
#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    context: RetryContext,
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            context: RetryContext::default(),
        }
    }

    /// Delay for a 1-indexed attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.config
            .base_delay
            .saturating_mul(attempt.max(1))
            .min(self.config.max_delay)
    }

    /// Record an unexpected close and return the wait before the next attempt.
    ///
    /// Returns `None` once `max_attempts` retries have already been handed
    /// out; the count is left untouched in that case.
    pub fn on_unexpected_close(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.context.attempt_count += 1;
        self.context.next_delay = self.delay_for(self.context.attempt_count);
        Some(self.context.next_delay)
    }

    /// Forget all retries; called whenever a connection reaches Open.
    pub fn reset(&mut self) {
        self.context = RetryContext::default();
    }

    pub fn is_exhausted(&self) -> bool {
        self.context.attempt_count >= self.config.max_attempts
    }

    pub fn attempt_count(&self) -> u32 {
        self.context.attempt_count
    }

    pub fn context(&self) -> RetryContext {
        self.context
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }
}

impl Default for ReconnectScheduler {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn delay_is_linear_then_capped() {
        let scheduler = ReconnectScheduler::default();
        for attempt in 1..=10u64 {
            let expected = Duration::from_millis((1000 * attempt).min(5000));
            assert_eq!(scheduler.delay_for(attempt as u32), expected, "attempt {attempt}");
        }
        assert_eq!(scheduler.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn attempts_count_up_to_the_budget() {
        let mut scheduler = ReconnectScheduler::new(ReconnectConfig {
            max_attempts: 3,
            ..Default::default()
        });
        assert_eq!(scheduler.config().max_attempts, 3);

        assert_eq!(scheduler.on_unexpected_close(), Some(Duration::from_millis(1000)));
        assert_eq!(scheduler.on_unexpected_close(), Some(Duration::from_millis(2000)));
        assert_eq!(scheduler.on_unexpected_close(), Some(Duration::from_millis(3000)));
        assert_eq!(scheduler.attempt_count(), 3);
        assert!(scheduler.is_exhausted());

        assert_eq!(scheduler.on_unexpected_close(), None);
        assert_eq!(scheduler.attempt_count(), 3);
    }

    #[test]
    fn reset_restarts_from_first_delay() {
        let mut scheduler = ReconnectScheduler::default();
        for _ in 0..7 {
            scheduler.on_unexpected_close();
        }
        assert_eq!(scheduler.attempt_count(), 7);
        assert_eq!(scheduler.context().next_delay, Duration::from_secs(5));

        scheduler.reset();
        assert_eq!(scheduler.context(), RetryContext::default());
        assert_eq!(scheduler.on_unexpected_close(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn zero_budget_is_exhausted_immediately() {
        let mut scheduler = ReconnectScheduler::new(ReconnectConfig {
            max_attempts: 0,
            ..Default::default()
        });
        assert!(scheduler.is_exhausted());
        assert_eq!(scheduler.on_unexpected_close(), None);
    }
}
