use std::time::Duration;

use crate::{ClientError, Error};

use super::builder::{
    DEFAULT_BLOCK_RETRY_INTERVAL, DEFAULT_BLOCK_RETRY_LIMIT, DEFAULT_CONNECTION_SLEEP_INTERVAL,
    DEFAULT_CONNECTION_SLEEP_RETRY_LIMIT,
};

/// Tiered retry settings of a block monitor.
///
/// A failing height is attempted `block_retry_limit` times, `block_retry_interval` apart. Once
/// those attempts are used up the monitor additionally sleeps `connection_sleep_interval` and
/// starts over, at most `connection_sleep_retry_limit` times. A height that keeps failing after
/// that is fatal; the last failure is reported without waiting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub block_retry_interval: Duration,
    pub block_retry_limit: usize,
    pub connection_sleep_interval: Duration,
    pub connection_sleep_retry_limit: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            block_retry_interval: DEFAULT_BLOCK_RETRY_INTERVAL,
            block_retry_limit: DEFAULT_BLOCK_RETRY_LIMIT,
            connection_sleep_interval: DEFAULT_CONNECTION_SLEEP_INTERVAL,
            connection_sleep_retry_limit: DEFAULT_CONNECTION_SLEEP_RETRY_LIMIT,
        }
    }
}

impl RetryPolicy {
    /// Number of attempts made on a permanently failing height before giving up.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.block_retry_limit.saturating_mul(self.connection_sleep_retry_limit.saturating_add(1))
    }
}

/// Remaining retries of one monitor run.
#[derive(Debug)]
pub(crate) struct RetryBudget {
    policy: RetryPolicy,
    retry: usize,
    sleep_retry: usize,
}

impl RetryBudget {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry: policy.block_retry_limit,
            sleep_retry: policy.connection_sleep_retry_limit,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.retry = self.policy.block_retry_limit;
        self.sleep_retry = self.policy.connection_sleep_retry_limit;
    }

    /// Records a failed attempt at `height` and returns how long to wait before the next one.
    ///
    /// Returns [`Error::RetriesExhausted`] once both budgets are spent.
    pub(crate) fn on_failure(&mut self, height: u64, error: ClientError) -> Result<Duration, Error> {
        self.retry = self.retry.saturating_sub(1);
        if self.retry > 0 {
            warn!(
                height = height,
                retries_left = self.retry,
                error = %error,
                "Block fetch failed, retrying"
            );
            return Ok(self.policy.block_retry_interval);
        }

        if self.sleep_retry == 0 {
            error!(height = height, error = %error, "Block fetch retries exhausted");
            return Err(Error::RetriesExhausted { height, source: error });
        }

        self.sleep_retry -= 1;
        self.retry = self.policy.block_retry_limit;
        let wait = self.policy.block_retry_interval + self.policy.connection_sleep_interval;
        error!(
            height = height,
            sleeps_left = self.sleep_retry,
            sleep_ms = wait.as_millis(),
            error = %error,
            "Block fetch keeps failing, backing off"
        );
        Ok(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            block_retry_interval: Duration::from_secs(1),
            block_retry_limit: 3,
            connection_sleep_interval: Duration::from_secs(10),
            connection_sleep_retry_limit: 2,
        }
    }

    #[test]
    fn waits_follow_the_tiers() {
        let mut budget = RetryBudget::new(policy());
        let short = Duration::from_secs(1);
        // the short wait still precedes the backoff
        let backoff = short + Duration::from_secs(10);

        let mut waits = vec![];
        let exhausted = loop {
            match budget.on_failure(7, ClientError::Timeout) {
                Ok(wait) => waits.push(wait),
                Err(err) => break err,
            }
        };

        assert_eq!(waits, vec![short, short, backoff, short, short, backoff, short, short]);
        assert_eq!(waits.len() + 1, policy().max_attempts());
        assert!(matches!(exhausted, Error::RetriesExhausted { height: 7, .. }));
    }

    #[test]
    fn success_restores_the_full_budget() {
        let mut budget = RetryBudget::new(policy());
        for _ in 0..5 {
            assert!(budget.on_failure(1, ClientError::Timeout).is_ok());
        }
        budget.reset();

        let attempts = (0..).take_while(|_| budget.on_failure(2, ClientError::Timeout).is_ok());
        assert_eq!(attempts.count() + 1, policy().max_attempts());
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.block_retry_interval, Duration::from_secs(3));
        assert_eq!(policy.connection_sleep_interval, Duration::from_secs(40));
        assert_eq!(policy.max_attempts(), 25);
    }
}
