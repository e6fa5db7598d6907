//! Bounded retry with exponential backoff, shared by every remote call the
//! executor makes.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ArchiveError, StorageError};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
    fn timed_out(after: Duration) -> Self;
    fn cancelled() -> Self;
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn timed_out(after: Duration) -> Self {
        StorageError::Transient(format!("timed out after {:?}", after))
    }

    fn cancelled() -> Self {
        StorageError::Transient("cancelled".to_string())
    }
}

impl Retryable for ArchiveError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn timed_out(after: Duration) -> Self {
        ArchiveError::Transient(format!("timed out after {:?}", after))
    }

    fn cancelled() -> Self {
        ArchiveError::Cancelled
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Applied to each attempt; a timeout counts as a transient failure.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(retry: &RetryConfig, call_timeout: Duration) -> Self {
        Self {
            max_attempts: retry.max_attempts.max(1),
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            call_timeout,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Each attempt is bounded by `call_timeout`.
    ///
    /// When `cancel` is given, cancellation is observed while waiting between
    /// attempts and returns `E::cancelled()`. An attempt already in flight is
    /// never interrupted.
    pub async fn run_call<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: Option<&CancellationToken>,
        op: F,
    ) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_inner(operation, cancel, Some(self.call_timeout), op)
            .await
    }

    /// Like [`run_call`](Self::run_call) without the outer timeout, for
    /// attempts made of many calls that bound themselves (chunked downloads).
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: Option<&CancellationToken>,
        op: F,
    ) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_inner(operation, cancel, None, op).await
    }

    async fn run_inner<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(E::timed_out(limit)),
                },
                None => op(attempt).await,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= self.max_attempts {
                return Err(error);
            }

            let delay = self.delay_for(attempt);
            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient error"
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(E::cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, StorageError> = fast_policy(4)
            .run("download", None, |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(StorageError::RateLimited("429".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), StorageError> = fast_policy(3)
            .run("trash", None, |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::Transient("503".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(StorageError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), StorageError> = fast_policy(5)
            .run("trash", None, |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::Unauthorized("expired".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(StorageError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeouts_count_as_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut policy = fast_policy(2);
        policy.call_timeout = Duration::from_millis(10);

        let result: Result<(), StorageError> = policy
            .run_call("list", None, |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;

        match result {
            Err(StorageError::Transient(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            call_timeout: Duration::from_secs(1),
        };
        let cancel = token.clone();

        let result: Result<(), ArchiveError> = policy
            .run("download", Some(&token), |_| {
                let cancel = cancel.clone();
                async move {
                    cancel.cancel();
                    Err(ArchiveError::Transient("reset".into()))
                }
            })
            .await;

        assert_eq!(result, Err(ArchiveError::Cancelled));
    }
}
