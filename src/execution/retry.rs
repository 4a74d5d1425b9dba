//! Retry policy with exponential backoff.

use std::time::Duration;

use crate::workflow::model::RetryPolicyConfig;

/// Backoff parameters in effect for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryPolicyConfig::default(), None)
    }
}

impl RetryPolicy {
    /// Workflow defaults with an optional per-step `max_retries` override.
    pub fn from_config(config: &RetryPolicyConfig, max_retries: Option<u32>) -> Self {
        Self {
            max_retries: max_retries.unwrap_or(config.max_retries),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }

    /// Delay before retry `n` (0-indexed): `initial * multiplier^n`, capped.
    pub fn delay_for(&self, n: u32) -> Duration {
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Per-invocation attempt bookkeeping, dropped once the step is terminal.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    rate_limit_cap: u32,
    attempts: u32,
    retries: u32,
    rate_limit_retries: u32,
    credential_refreshed: bool,
    next_delay: Duration,
}

impl RetryState {
    pub fn new(policy: RetryPolicy, rate_limit_cap: u32) -> Self {
        Self {
            policy,
            rate_limit_cap,
            attempts: 0,
            retries: 0,
            rate_limit_retries: 0,
            credential_refreshed: false,
            next_delay: Duration::ZERO,
        }
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Schedules a strategy retry, returning its delay if the budget allows.
    pub fn schedule_retry(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        self.next_delay = self.policy.delay_for(self.retries);
        self.retries += 1;
        Some(self.next_delay)
    }

    /// Schedules a rate-limit retry up to the global cap.
    ///
    /// A collaborator supplied `retry_after_ms` wins over the backoff curve.
    pub fn schedule_rate_limited(&mut self, retry_after_ms: Option<u64>) -> Option<Duration> {
        if self.rate_limit_retries >= self.rate_limit_cap {
            return None;
        }
        self.next_delay = retry_after_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.policy.delay_for(self.rate_limit_retries));
        self.rate_limit_retries += 1;
        Some(self.next_delay)
    }

    /// True the first time only; credentials are refreshed at most once.
    pub fn take_credential_refresh(&mut self) -> bool {
        !std::mem::replace(&mut self.credential_refreshed, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_curve() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(500));
        assert_eq!(p.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn test_override_and_defaults() {
        let config = RetryPolicyConfig::default();
        let p = RetryPolicy::from_config(&config, Some(1));
        assert_eq!(p.max_retries, 1);
        assert_eq!(p.initial_backoff, Duration::from_millis(500));
        assert_eq!(RetryPolicy::default().max_retries, 3);
    }

    #[test]
    fn test_retry_budget() {
        let mut state = RetryState::new(policy(), 0);
        assert_eq!(state.schedule_retry(), Some(Duration::from_millis(100)));
        assert_eq!(state.schedule_retry(), Some(Duration::from_millis(200)));
        assert_eq!(state.schedule_retry(), Some(Duration::from_millis(400)));
        assert_eq!(state.schedule_retry(), None);
        assert_eq!(state.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn test_rate_limit_budget_is_separate() {
        let mut state = RetryState::new(policy(), 2);
        assert_eq!(state.schedule_rate_limited(Some(7)), Some(Duration::from_millis(7)));
        assert_eq!(state.schedule_rate_limited(None), Some(Duration::from_millis(200)));
        assert_eq!(state.schedule_rate_limited(None), None);
        assert!(state.schedule_retry().is_some());
    }

    #[test]
    fn test_credential_refresh_once() {
        let mut state = RetryState::new(policy(), 0);
        assert!(state.take_credential_refresh());
        assert!(!state.take_credential_refresh());
    }
}
