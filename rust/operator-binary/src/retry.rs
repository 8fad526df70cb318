//! Bounded retries with exponential backoff and jitter for calls into the Cassandra cluster.

use std::{future::Future, time::Duration};

use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Upper bound for a single delay, jitter included.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_transient` rejects, or
/// `max_attempts` is used up. The last error is returned in the latter two cases.
pub async fn retry_transient<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        if !is_transient(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            tracing::error!(
                operation = operation_name,
                attempt,
                error = &err as &dyn std::error::Error,
                "Operation failed after max retries"
            );
            return Err(err);
        }

        // Jitter: 0.5x to 1.5x of the delay, never above max_delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = delay.mul_f64(jitter).min(config.max_delay);

        tracing::warn!(
            operation = operation_name,
            attempt,
            error = &err as &dyn std::error::Error,
            delay_ms = jittered_delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::time::sleep(jittered_delay).await;

        delay = delay
            .mul_f64(config.backoff_multiplier)
            .min(config.max_delay);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use snafu::Snafu;

    use super::*;

    #[derive(Debug, Snafu)]
    enum TestError {
        #[snafu(display("node unreachable"))]
        Unreachable,
        #[snafu(display("bad request"))]
        BadRequest,
    }

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn is_unreachable(err: &TestError) -> bool {
        matches!(err, TestError::Unreachable)
    }

    #[tokio::test]
    async fn succeeds_immediately() {
        let result: Result<i32, TestError> =
            retry_transient(&fast(3), "op", is_unreachable, || async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = retry_transient(&fast(5), "op", is_unreachable, || {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Unreachable)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<(), TestError> = retry_transient(&fast(5), "op", is_unreachable, || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(TestError::BadRequest)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::BadRequest)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<(), TestError> = retry_transient(&fast(3), "op", is_unreachable, || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Unreachable)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Unreachable)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let attempts = Arc::new(AtomicU32::new(0));

        let _ = retry_transient(&fast(0), "op", is_unreachable, || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Unreachable)
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
