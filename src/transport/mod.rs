//! Bounded-retry wrapper for remote calls.
//!
//! Transient failures (rate limits, server errors) are retried with
//! exponential backoff; everything else fails immediately, since a bad id or
//! a missing permission does not get better by asking again. The wrapper is
//! deliberately generic: it knows nothing about the remote API, only about
//! the error taxonomy.

use crate::config::RetryConfig;
use crate::error::RemoteError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry budget and backoff shape.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based): doubles each
    /// time, capped at `max_delay`.
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Runs `operation`, retrying transient failures within the policy budget.
///
/// `context` is a human-readable label for the logs. The last error is
/// returned once the budget is exhausted; permanent errors are returned on
/// the first occurrence.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    mut operation: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                warn!(
                    context = context,
                    attempts = attempt,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    context = context,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient remote failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn transient() -> RemoteError {
        RemoteError::new(SyncErrorCode::Transient, "rate limited")
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(&fast_policy(), "upload", move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(transient())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = with_retry(&fast_policy(), "validate", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::new(SyncErrorCode::NotFound, "bad id"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().code, SyncErrorCode::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = with_retry(&fast_policy(), "download", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert_eq!(result.unwrap_err().code, SyncErrorCode::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_not_auto_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = with_retry(&fast_policy(), "download", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::new(SyncErrorCode::Timeout, "stalled transfer"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().code, SyncErrorCode::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_secs(1));
        assert_eq!(policy.delay_after(3), Duration::from_secs(2));
        assert_eq!(policy.delay_after(5), Duration::from_secs(8));
        assert_eq!(policy.delay_after(30), Duration::from_secs(8));
    }
}
