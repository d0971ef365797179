//! Bounded retry with per-operation policies.
//!
//! Replaces retry loops sprinkled at call sites: every operation that wants
//! retries declares a policy and goes through `retry`.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// A bounded schedule of retry delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            delays,
        }
    }

    /// The schedule used by open and exit replication: three attempts,
    /// backing off 5s then 10s.
    pub fn replication() -> Self {
        Self::new(
            3,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ],
        )
    }

    /// Zero-delay schedule, for tests and probes.
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(max_attempts, Vec::new())
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay to wait after the given (1-based) failed attempt. The last
    /// configured delay repeats if the schedule is shorter than the attempt
    /// count.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        match self.delays.last() {
            None => Duration::ZERO,
            Some(last) => *self
                .delays
                .get(attempt.saturating_sub(1))
                .unwrap_or(last),
        }
    }
}

/// Run `op` until it succeeds, the error is not retryable, or the policy is
/// exhausted. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.max_attempts() || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = policy.delay_after(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use router_core::error::PoolError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, PoolError> =
            retry(&RetryPolicy::replication(), PoolError::is_retryable, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PoolError::transport("timeout"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, PoolError> =
            retry(&RetryPolicy::replication(), PoolError::is_retryable, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PoolError::transport("timeout")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, PoolError> =
            retry(&RetryPolicy::replication(), PoolError::is_retryable, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(PoolError::Rejected {
                        status: 400,
                        message: "invalid volume".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::replication();
        assert_eq!(policy.delay_after(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(2), Duration::from_secs(10));
        assert_eq!(policy.delay_after(3), Duration::from_secs(20));
        assert_eq!(policy.delay_after(9), Duration::from_secs(20));

        assert_eq!(RetryPolicy::immediate(3).delay_after(1), Duration::ZERO);
    }
}
