//! Bounded retry policies.
//!
//! Hardware calls and device connections are retried a fixed number of times with
//! a fixed delay between attempts. Nothing retries indefinitely.
//!
//! The retry loop itself stays at the call site, which keeps the borrowed device
//! handle in scope:
//!
//! ```no_run
//! # use polar_daq::error_recovery::RetryPolicy;
//! # async fn call() -> Result<u32, i32> { Ok(1) }
//! # async fn demo() -> Option<u32> {
//! let policy = RetryPolicy::default();
//! let mut attempts = policy.attempts();
//! loop {
//!     match call().await {
//!         Ok(v) => return Some(v),
//!         Err(code) => {
//!             if !attempts.backoff("call", &code).await {
//!                 return None;
//!             }
//!         }
//!     }
//! }
//! # }
//! ```

use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, one second apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy for opening the rotation stage link: five attempts, one second apart.
    pub fn connection() -> Self {
        Self {
            max_attempts: 5,
            backoff_delay: Duration::from_secs(1),
        }
    }

    /// Start counting attempts against this policy.
    pub fn attempts(&self) -> Attempts<'_> {
        Attempts {
            policy: self,
            attempt: 1,
        }
    }
}

/// Attempt counter for one retried operation.
#[derive(Debug)]
pub struct Attempts<'p> {
    policy: &'p RetryPolicy,
    attempt: u32,
}

impl Attempts<'_> {
    /// Current attempt number, 1-based.
    pub fn current(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt.
    ///
    /// Logs the failure with its attempt number. If attempts remain, sleeps the
    /// backoff delay and returns `true`; on the final attempt returns `false`
    /// without sleeping.
    pub async fn backoff(&mut self, operation: impl Display, reason: impl Display) -> bool {
        let max_attempts = self.policy.max_attempts.max(1);
        warn!(
            attempt = self.attempt,
            max_attempts,
            %operation,
            %reason,
            "attempt failed"
        );
        if self.attempt >= max_attempts {
            return false;
        }
        sleep(self.policy.backoff_delay).await;
        self.attempt += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        }
    }

    async fn run(policy: &RetryPolicy, succeed_on_attempt: u32) -> (Option<u32>, u32) {
        let mut calls = 0;
        let mut attempts = policy.attempts();
        loop {
            calls += 1;
            if calls >= succeed_on_attempt {
                return (Some(attempts.current()), calls);
            }
            if !attempts.backoff("recover", "not yet").await {
                return (None, calls);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_succeeds() {
        let start = Instant::now();
        let (result, calls) = run(&policy(), 2).await;
        assert_eq!(result, Some(2));
        assert_eq!(calls, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_fails() {
        let start = Instant::now();
        let (result, calls) = run(&policy(), 4).await;
        assert_eq!(result, None);
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), Duration::from_millis(20));
    }

    #[test]
    fn connection_policy_is_five_one_second_attempts() {
        let p = RetryPolicy::connection();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.backoff_delay, Duration::from_secs(1));
    }
}
